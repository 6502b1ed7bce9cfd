//! Continuum normalization polynomial.
//!
//! The continuum is a polynomial in a centered, scaled pixel coordinate
//! `u in [-1, 1]` rather than the raw pixel index. Centering keeps the
//! normal-equation columns comparable in magnitude for chunks thousands of
//! pixels into an order.

/// Centered, scaled pixel coordinates for an `n`-pixel chunk.
pub fn normalized_pixels(n: usize) -> Vec<f64> {
    let center = (n as f64 - 1.0) / 2.0;
    let scale = center.max(1.0);
    (0..n).map(|i| (i as f64 - center) / scale).collect()
}

/// Evaluate the continuum polynomial at coordinate `u` (constant term
/// first, Horner form).
pub fn eval_poly(coeffs: &[f64], u: f64) -> f64 {
    let mut acc = 0.0;
    for &c in coeffs.iter().rev() {
        acc = acc * u + c;
    }
    acc
}
