//! Robust scatter statistics.
//!
//! The rejection loop and the robust combination mode both need a scatter
//! estimate that a handful of wild values cannot drag around, so everything
//! here is median-based. Deterministic: no RNG, ties broken by value order.

/// Scale factor from MAD to a one-sigma equivalent for Gaussian noise.
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Median of a mutable slice (sorts in place). `None` when empty.
pub fn median_mut(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

/// Median of a borrowed slice; copies once.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut buf: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    median_mut(&mut buf)
}

/// Median absolute deviation about the median. `None` when no finite input.
pub fn mad(values: &[f64]) -> Option<f64> {
    let center = median(values)?;
    let mut deviations: Vec<f64> = values
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| (v - center).abs())
        .collect();
    median_mut(&mut deviations)
}

/// MAD scaled to a standard-deviation equivalent.
pub fn robust_sigma(values: &[f64]) -> Option<f64> {
    mad(values).map(|m| m * MAD_TO_SIGMA)
}
