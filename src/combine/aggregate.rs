//! Inverse-variance and robust RV combination.
//!
//! The same code path serves both passes: chunk results combine into one RV
//! per order, order RVs combine into one RV per exposure. Inputs enter as
//! [`RvEstimate`]s, so either a `FitResult` or a `CombinedRv` can feed a
//! combination.

use crate::domain::{CombineMode, CombinedRv, FitResult, RvEstimate};
use crate::error::RvError;
use crate::math::{mad, median, MAD_TO_SIGMA};

/// Extract aggregation inputs from converged fit results.
///
/// Non-converged or non-finite results are dropped here, so a chunk
/// excluded in an earlier round re-passes validity before any later round.
pub fn estimates_from_fits<'a, I>(results: I) -> Vec<RvEstimate>
where
    I: IntoIterator<Item = &'a FitResult>,
{
    results
        .into_iter()
        .filter(|r| r.converged)
        .map(RvEstimate::from)
        .filter(is_valid)
        .collect()
}

fn is_valid(estimate: &RvEstimate) -> bool {
    estimate.rv_kms.is_finite() && estimate.err_kms.is_finite() && estimate.err_kms > 0.0
}

/// Combine velocity estimates into one RV.
///
/// Invalid inputs (non-finite, non-positive uncertainty) are excluded; zero
/// valid inputs fail with `NoValidChunks` so a missing RV stays missing
/// instead of defaulting to zero.
pub fn combine(estimates: &[RvEstimate], mode: CombineMode) -> Result<CombinedRv, RvError> {
    let valid: Vec<RvEstimate> = estimates.iter().copied().filter(is_valid).collect();
    if valid.is_empty() {
        return Err(RvError::NoValidChunks);
    }

    match mode {
        CombineMode::WeightedMean => Ok(weighted_mean(&valid)),
        CombineMode::Robust => Ok(robust(&valid)),
    }
}

fn weighted_mean(valid: &[RvEstimate]) -> CombinedRv {
    let mut sum_w = 0.0;
    let mut sum_wv = 0.0;
    for e in valid {
        let w = 1.0 / (e.err_kms * e.err_kms);
        sum_w += w;
        sum_wv += w * e.rv_kms;
    }
    let rv_kms = sum_wv / sum_w;

    CombinedRv {
        rv_kms,
        err_kms: 1.0 / sum_w.sqrt(),
        n_used: valid.len(),
        chi2_red: scatter_chi2(valid, rv_kms),
    }
}

fn robust(valid: &[RvEstimate]) -> CombinedRv {
    let velocities: Vec<f64> = valid.iter().map(|e| e.rv_kms).collect();
    let rv_kms = median(&velocities).expect("valid set is non-empty");

    let err_kms = if valid.len() == 1 {
        valid[0].err_kms
    } else {
        let sigma = mad(&velocities).expect("valid set is non-empty") * MAD_TO_SIGMA;
        // Guard against a zero MAD when estimates are identical.
        let floor = valid
            .iter()
            .map(|e| e.err_kms)
            .fold(f64::INFINITY, f64::min)
            / (valid.len() as f64).sqrt();
        (sigma / (valid.len() as f64).sqrt()).max(floor)
    };

    CombinedRv {
        rv_kms,
        err_kms,
        n_used: valid.len(),
        chi2_red: scatter_chi2(valid, rv_kms),
    }
}

/// Reduced chi-square of the combination about `center`; zero for a single
/// input.
fn scatter_chi2(valid: &[RvEstimate], center: f64) -> f64 {
    if valid.len() < 2 {
        return 0.0;
    }
    let sum: f64 = valid
        .iter()
        .map(|e| {
            let d = e.rv_kms - center;
            d * d / (e.err_kms * e.err_kms)
        })
        .sum();
    sum / (valid.len() - 1) as f64
}
