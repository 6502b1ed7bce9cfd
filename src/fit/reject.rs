//! Iterative outlier rejection around the chunk fitter.
//!
//! Per chunk, an explicit state machine:
//!
//! ```text
//! Fitting -> Masking -> Fitting -> ... -> Converged
//!    |          |
//!    v          v
//!  Failed     Failed
//! ```
//!
//! - `Fitting` runs the chunk fitter on the current mask.
//! - `Masking` clips pixels whose residual exceeds `kappa` times the robust
//!   scatter and loops back when anything new was masked.
//! - `Converged` and `Failed` are terminal; a failed chunk is excluded from
//!   aggregation but never aborts its siblings.
//!
//! The clip threshold is floored at the median pixel uncertainty so a fit
//! sitting at the numerical noise floor cannot mask its own machine-epsilon
//! residuals.

use log::debug;

use crate::domain::{Chunk, FitParameters, FitResult, PixelMask, RejectConfig};
use crate::error::RvError;
use crate::fit::solver::{fit_masked, FitContext};
use crate::math::robust_sigma;

/// States of the per-chunk rejection machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectState {
    Fitting,
    Masking,
    Converged,
    Failed,
}

/// Fit a chunk, iteratively masking discrepant pixels and re-fitting.
///
/// Returns the final converged [`FitResult`] (whose mask records every
/// clipped pixel) or the failure that made the chunk unusable.
pub fn reject_and_refit(
    chunk: &Chunk<'_>,
    ctx: &FitContext<'_>,
    initial: &FitParameters,
    config: &RejectConfig,
) -> Result<FitResult, RvError> {
    let min_retained =
        ((config.min_retained_frac * chunk.len() as f64).ceil() as usize).max(1);

    let mut mask = chunk.initial_mask();
    let mut guess: FitParameters = initial.clone();
    let mut latest: Option<FitResult> = None;
    let mut cycles = 0_usize;
    let mut state = RejectState::Fitting;

    loop {
        match state {
            RejectState::Fitting => match fit_masked(chunk, ctx, &guess, &mask) {
                Ok(result) => {
                    // Warm-start the next cycle from the converged point.
                    guess = result.params.clone();
                    latest = Some(result);
                    state = RejectState::Masking;
                }
                Err(err) => {
                    debug!(
                        "order {} chunk {} failed while fitting: {err}",
                        chunk.order, chunk.index
                    );
                    return Err(err);
                }
            },

            RejectState::Masking => {
                cycles += 1;
                let result = latest.as_ref().expect("Masking follows a successful fit");

                let newly_masked = clip_pixels(chunk, result, &mut mask, config.kappa);
                if newly_masked == 0 || cycles >= config.max_cycles {
                    state = RejectState::Converged;
                } else if mask.n_valid() < min_retained {
                    debug!(
                        "order {} chunk {}: masking left {} of {} pixels, below policy minimum {}",
                        chunk.order,
                        chunk.index,
                        mask.n_valid(),
                        chunk.len(),
                        min_retained
                    );
                    state = RejectState::Failed;
                } else {
                    debug!(
                        "order {} chunk {}: masked {newly_masked} pixel(s), re-fitting",
                        chunk.order, chunk.index
                    );
                    state = RejectState::Fitting;
                }
            }

            RejectState::Converged => {
                return Ok(latest.expect("Converged follows a successful fit"));
            }

            RejectState::Failed => {
                return Err(RvError::InsufficientData {
                    unmasked: mask.n_valid(),
                    required: min_retained,
                });
            }
        }
    }
}

/// Mask unmasked pixels whose absolute residual exceeds `kappa` times the
/// robust scatter; returns how many were newly masked.
fn clip_pixels(
    chunk: &Chunk<'_>,
    result: &FitResult,
    mask: &mut PixelMask,
    kappa: f64,
) -> usize {
    let unmasked_residuals: Vec<f64> =
        mask.valid_indices().map(|i| result.residuals[i]).collect();
    let Some(scatter) = robust_sigma(&unmasked_residuals) else {
        return 0;
    };

    let mut sigmas: Vec<f64> = mask.valid_indices().map(|i| chunk.sigma[i]).collect();
    let sigma_floor = crate::math::median_mut(&mut sigmas).unwrap_or(0.0);
    let threshold = kappa * scatter.max(sigma_floor);
    if !(threshold > 0.0) {
        return 0;
    }

    let to_mask: Vec<usize> = mask
        .valid_indices()
        .filter(|&i| result.residuals[i].abs() > threshold)
        .collect();
    for &i in &to_mask {
        mask.invalidate(i);
    }
    to_mask.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ModelConfig;
    use crate::fit::solver::{default_initial, fit_chunk};
    use crate::synth::{line_template, noiseless_observation, pixel_grid, LineListConfig};
    use crate::template::Template;

    fn logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn test_template() -> Template {
        line_template(&LineListConfig {
            lambda_min: 4995.0,
            lambda_max: 5015.0,
            n_lines: 40,
            depth_min: 0.2,
            depth_max: 0.7,
            width_kms: 4.0,
            seed: 11,
        })
        .unwrap()
    }

    fn test_config() -> ModelConfig {
        let mut config = ModelConfig::default();
        config.grid.ip_half_size = 25;
        config.rv_window_kms = 40.0;
        config
    }

    #[test]
    fn single_discrepant_pixel_is_masked_and_rv_recovered() {
        logging();
        let template = test_template();
        let config = test_config();
        let ctx = FitContext {
            template: &template,
            cell: None,
            model: &config,
        };

        let truth = FitParameters {
            rv_kms: 2.0,
            continuum: vec![1.0, 0.0, 0.0],
            ip: vec![2.2],
        };
        let wavelength = pixel_grid(5002.0, 240, 0.02);
        let clean = noiseless_observation(&wavelength, &ctx, &truth, 200.0).unwrap();

        // Reference fit on the clean chunk.
        let clean_chunk =
            Chunk::new(0, 0, &clean.wavelength, &clean.flux, &clean.sigma).unwrap();
        let initial = default_initial(&clean_chunk, &ctx, 0.0).unwrap();
        let clean_fit = fit_chunk(&clean_chunk, &ctx, &initial).unwrap();

        // Same chunk with one cosmic-ray-like spike.
        let mut spiked = clean.clone();
        spiked.flux[120] += 0.8;
        let chunk = Chunk::new(0, 0, &spiked.wavelength, &spiked.flux, &spiked.sigma).unwrap();

        let initial = default_initial(&chunk, &ctx, 0.0).unwrap();
        let result = reject_and_refit(&chunk, &ctx, &initial, &RejectConfig::default()).unwrap();

        assert!(!result.mask.is_valid(120), "spike should be masked");
        assert_eq!(result.mask.n_valid(), 239);
        assert!(
            (result.rv_kms - clean_fit.rv_kms).abs() < 1e-6,
            "rv {} vs clean {}",
            result.rv_kms,
            clean_fit.rv_kms
        );
    }

    #[test]
    fn clean_chunk_passes_through_without_masking() {
        logging();
        let template = test_template();
        let config = test_config();
        let ctx = FitContext {
            template: &template,
            cell: None,
            model: &config,
        };

        let truth = FitParameters {
            rv_kms: -1.0,
            continuum: vec![1.0, 0.0, 0.0],
            ip: vec![2.2],
        };
        let wavelength = pixel_grid(5002.0, 200, 0.02);
        let obs = noiseless_observation(&wavelength, &ctx, &truth, 150.0).unwrap();
        let chunk = Chunk::new(0, 0, &obs.wavelength, &obs.flux, &obs.sigma).unwrap();

        let initial = default_initial(&chunk, &ctx, 0.0).unwrap();
        let result = reject_and_refit(&chunk, &ctx, &initial, &RejectConfig::default()).unwrap();
        assert_eq!(result.mask.n_valid(), 200);
    }

    #[test]
    fn retention_policy_fails_the_chunk() {
        logging();
        let template = test_template();
        let config = test_config();
        let ctx = FitContext {
            template: &template,
            cell: None,
            model: &config,
        };

        let truth = FitParameters {
            rv_kms: 0.0,
            continuum: vec![1.0, 0.0, 0.0],
            ip: vec![2.2],
        };
        let wavelength = pixel_grid(5002.0, 200, 0.02);
        let mut obs = noiseless_observation(&wavelength, &ctx, &truth, 150.0).unwrap();
        obs.flux[50] += 1.0;

        let chunk = Chunk::new(0, 0, &obs.wavelength, &obs.flux, &obs.sigma).unwrap();
        let initial = default_initial(&chunk, &ctx, 0.0).unwrap();

        // A policy that tolerates no masking at all: the single spike makes
        // the chunk fail rather than silently shrink.
        let reject = RejectConfig {
            min_retained_frac: 1.0,
            ..RejectConfig::default()
        };
        let err = reject_and_refit(&chunk, &ctx, &initial, &reject).unwrap_err();
        assert!(matches!(err, RvError::InsufficientData { .. }));
    }
}
