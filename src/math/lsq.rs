//! Least-squares step solver for the damped normal equations.
//!
//! The fitter repeatedly solves small square systems of the form
//!
//! ```text
//! (J^T W J + damping) * step = J^T W r
//! ```
//!
//! Implementation choices:
//! - SVD, so near-collinear columns (e.g. a flat continuum against a broad
//!   kernel) degrade gracefully instead of panicking.
//! - Progressively looser tolerances before giving up, because damping
//!   already regularizes the system and a slightly truncated step still
//!   makes progress.

use nalgebra::{DMatrix, DVector};

/// Solve a square least-squares system via SVD.
///
/// Returns `None` if the system is too ill-conditioned to produce a finite
/// solution.
pub fn solve_normal(a: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = a.clone().svd(true, true);

    for &tol in &[1e-12, 1e-10, 1e-8] {
        if let Ok(x) = svd.solve(b, tol) {
            if x.iter().all(|v| v.is_finite()) {
                return Some(x);
            }
        }
    }

    None
}

/// Condition number (max/min singular value) of a symmetric matrix.
///
/// Infinite when the smallest singular value vanishes.
pub fn condition_number(a: &DMatrix<f64>) -> f64 {
    let svd = a.clone().svd(false, false);
    let mut smax = 0.0_f64;
    let mut smin = f64::INFINITY;
    for &s in svd.singular_values.iter() {
        smax = smax.max(s);
        smin = smin.min(s);
    }
    if smin <= 0.0 {
        return f64::INFINITY;
    }
    smax / smin
}
