//! Deterministic synthetic templates and observations.
//!
//! Observations are generated through the crate's own forward model, so a
//! fit of a synthetic chunk has an exactly representable solution; that is
//! what makes zero-noise recovery tests meaningful. All randomness is a
//! seeded `StdRng`: same seed, same spectrum.
//!
//! Callers can also use this module to validate an instrument configuration
//! end-to-end before pointing the engine at real data.

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;

use crate::C_KMS;
use crate::domain::{FitParameters, OrderSpectrum};
use crate::error::RvError;
use crate::fit::solver::FitContext;
use crate::models::forward::ChunkModel;
use crate::template::Template;

/// Settings for a synthetic absorption-line template.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineListConfig {
    pub lambda_min: f64,
    pub lambda_max: f64,
    pub n_lines: usize,
    /// Line depths are drawn uniformly from `[depth_min, depth_max]`.
    pub depth_min: f64,
    pub depth_max: f64,
    /// Gaussian line width (one sigma) in km/s.
    pub width_kms: f64,
    pub seed: u64,
}

/// A continuum-normalized template with Gaussian absorption lines at
/// seeded-random positions.
pub fn line_template(config: &LineListConfig) -> Result<Template, RvError> {
    if !(config.lambda_min.is_finite()
        && config.lambda_max.is_finite()
        && config.lambda_min > 0.0
        && config.lambda_max > config.lambda_min)
    {
        return Err(RvError::InvalidInput(
            "invalid wavelength range for synthetic template".into(),
        ));
    }
    if config.n_lines == 0 {
        return Err(RvError::InvalidInput(
            "synthetic template needs at least one line".into(),
        ));
    }
    if !(config.width_kms.is_finite() && config.width_kms > 0.0) {
        return Err(RvError::InvalidInput(
            "synthetic line width must be finite and > 0".into(),
        ));
    }
    if !(0.0 < config.depth_min && config.depth_min <= config.depth_max && config.depth_max < 1.0)
    {
        return Err(RvError::InvalidInput(
            "synthetic line depths must satisfy 0 < min <= max < 1".into(),
        ));
    }

    let mut rng = StdRng::seed_from_u64(config.seed);

    let lo = config.lambda_min.ln();
    let hi = config.lambda_max.ln();
    let width_ln = config.width_kms / C_KMS;
    // Four knots per line width resolves the Gaussian profiles.
    let step = width_ln / 4.0;
    let n_samples = ((hi - lo) / step).ceil() as usize + 1;

    let centers: Vec<f64> = (0..config.n_lines)
        .map(|_| rng.gen_range(lo..hi))
        .collect();
    let depths: Vec<f64> = (0..config.n_lines)
        .map(|_| rng.gen_range(config.depth_min..=config.depth_max))
        .collect();

    let mut wavelength = Vec::with_capacity(n_samples);
    let mut flux = Vec::with_capacity(n_samples);
    for i in 0..n_samples {
        let x = lo + i as f64 * step;
        let mut f = 1.0;
        for (c, d) in centers.iter().zip(&depths) {
            let z = (x - c) / width_ln;
            f -= d * (-0.5 * z * z).exp();
        }
        wavelength.push(x.exp());
        // Blended lines can overshoot; a saturated core is still positive.
        flux.push(f.max(0.01));
    }

    Template::from_wavelength(&wavelength, &flux)
}

/// A uniform pixel wavelength grid: `n_pixels` starting at `lambda_start`
/// with `step` spacing.
pub fn pixel_grid(lambda_start: f64, n_pixels: usize, step: f64) -> Vec<f64> {
    (0..n_pixels)
        .map(|i| lambda_start + i as f64 * step)
        .collect()
}

/// A noise-free observation of `truth` through the forward model.
///
/// The flux is exactly the model prediction; `sigma` is set to
/// `|flux| / snr` (floored well above zero) so the fit weights are
/// realistic while the chi-square floor stays numerical.
pub fn noiseless_observation(
    wavelength: &[f64],
    ctx: &FitContext<'_>,
    truth: &FitParameters,
    snr: f64,
) -> Result<OrderSpectrum, RvError> {
    if !(snr.is_finite() && snr > 0.0) {
        return Err(RvError::InvalidInput("snr must be finite and > 0".into()));
    }

    let model = ChunkModel::build(wavelength, ctx.template, ctx.cell, ctx.model)?;
    let flux = model.evaluate(truth);
    if flux.iter().any(|f| !f.is_finite()) {
        return Err(RvError::InvalidInput(
            "truth parameters produce a non-finite model".into(),
        ));
    }

    let sigma: Vec<f64> = flux.iter().map(|f| (f.abs() / snr).max(1e-12)).collect();
    Ok(OrderSpectrum {
        wavelength: wavelength.to_vec(),
        flux,
        sigma,
    })
}

/// A noisy observation: the noiseless model plus seeded Gaussian noise of
/// one sigma per pixel.
pub fn noisy_observation(
    wavelength: &[f64],
    ctx: &FitContext<'_>,
    truth: &FitParameters,
    snr: f64,
    seed: u64,
) -> Result<OrderSpectrum, RvError> {
    let mut spectrum = noiseless_observation(wavelength, ctx, truth, snr)?;

    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| RvError::InvalidInput(format!("noise distribution error: {e}")))?;
    for (f, s) in spectrum.flux.iter_mut().zip(&spectrum.sigma) {
        *f += s * normal.sample(&mut rng);
    }
    Ok(spectrum)
}
