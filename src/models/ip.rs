//! Instrumental-profile kernels.
//!
//! The line-spread function is represented as a discrete kernel sampled at
//! uniform velocity knots `v_k = k * dv` for `k in [-hs, +hs]`, normalized
//! to unit sum so convolution preserves flux. Widths are in km/s.

use crate::domain::IpKind;

/// Floor on kernel width parameters; the solver clamps to this before
/// evaluation so the kernel never collapses to a delta with zero sum.
pub const MIN_IP_WIDTH_KMS: f64 = 0.05;

/// Velocity knots for a kernel of half-size `hs` with spacing `dv_kms`.
pub fn velocity_knots(hs: usize, dv_kms: f64) -> Vec<f64> {
    (0..2 * hs + 1)
        .map(|i| (i as f64 - hs as f64) * dv_kms)
        .collect()
}

/// Evaluate the normalized kernel for `kind` at the given velocity knots.
///
/// `params` must have length `kind.n_params()` with positive widths; the
/// solver guarantees both via its constraint step.
pub fn kernel(kind: IpKind, params: &[f64], vk: &[f64]) -> Vec<f64> {
    debug_assert_eq!(params.len(), kind.n_params());

    let mut out: Vec<f64> = match kind {
        IpKind::Gauss => {
            let s = params[0];
            vk.iter().map(|v| (-0.5 * (v / s).powi(2)).exp()).collect()
        }
        IpKind::SuperGauss => {
            let s = params[0];
            let e = params[1];
            vk.iter().map(|v| (-(v / s).abs().powf(e)).exp()).collect()
        }
        IpKind::BiGauss => {
            let s1 = params[0];
            let s2 = params[1];
            // Recenter so the asymmetric profile has zero mean.
            let xc = (2.0 / std::f64::consts::PI).sqrt() * (s2 * s2 - s1 * s1) / (s1 + s2);
            vk.iter()
                .map(|v| {
                    let u = v + xc;
                    let s = if u < 0.0 { s1 } else { s2 };
                    (-0.5 * (u / s).powi(2)).exp()
                })
                .collect()
        }
    };

    let sum: f64 = out.iter().sum();
    if sum > 0.0 {
        for v in &mut out {
            *v /= sum;
        }
    }
    out
}

/// Discrete convolution, `valid` mode: output length is
/// `signal.len() - kernel.len() + 1`, each sample fully covered by the
/// kernel.
pub fn convolve_valid(signal: &[f64], kern: &[f64]) -> Vec<f64> {
    let n = signal.len();
    let m = kern.len();
    debug_assert!(m >= 1 && m <= n);

    let mut out = Vec::with_capacity(n - m + 1);
    for j in 0..=(n - m) {
        let mut acc = 0.0;
        for (k, &kv) in kern.iter().enumerate() {
            acc += kv * signal[j + m - 1 - k];
        }
        out.push(acc);
    }
    out
}
