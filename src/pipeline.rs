//! The exposure driver: chunk tiling, parallel fan-out, combination.
//!
//! Workflow for one exposure:
//!
//! tile orders into chunks -> fit every chunk in parallel (rejection loop
//! included) -> combine chunks per order -> combine orders per exposure ->
//! apply drift/barycentric corrections.
//!
//! Chunks are independent fitting problems sharing only read-only state, so
//! the fan-out needs no locks; results are collected into an ordered
//! sequence before any aggregation (fan-in barrier). A failed chunk becomes
//! an excluded entry in the report and never aborts its siblings.

use log::warn;
use rayon::prelude::*;

use crate::combine::{apply_corrections, combine, estimates_from_fits, CorrectionTable};
use crate::domain::{Chunk, ChunkingConfig, EngineConfig, OrderSpectrum, RvEstimate, Spectrum};
use crate::error::RvError;
use crate::fit::{default_initial, reject_and_refit, FitContext};
use crate::report::{ChunkOutcome, ExposureReport, OrderSummary};
use crate::template::Template;

/// Tile one order into fit-ready chunks.
///
/// Full tiles of `chunk_pixels`; a tail shorter than `min_chunk_pixels` is
/// merged into the preceding tile. Orders shorter than the minimum yield no
/// chunks at all.
pub fn chunk_order<'a>(
    order_index: usize,
    order: &'a OrderSpectrum,
    config: &ChunkingConfig,
) -> Result<Vec<Chunk<'a>>, RvError> {
    let n = order.len();
    if order.flux.len() != n || order.sigma.len() != n {
        return Err(RvError::InvalidInput(format!(
            "order {order_index} arrays disagree in length"
        )));
    }
    if n < config.min_chunk_pixels {
        warn!("order {order_index}: {n} pixels is below the {} minimum, skipping", config.min_chunk_pixels);
        return Ok(Vec::new());
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    let mut index = 0;
    while start < n {
        let mut end = (start + config.chunk_pixels).min(n);
        // Absorb a runt tail into this tile.
        if n - end < config.min_chunk_pixels {
            end = n;
        }
        chunks.push(Chunk::new(
            order_index,
            index,
            &order.wavelength[start..end],
            &order.flux[start..end],
            &order.sigma[start..end],
        )?);
        start = end;
        index += 1;
    }
    Ok(chunks)
}

/// Process one exposure end to end.
///
/// Returns `Err` only for malformed input detected before fitting; every
/// per-chunk and per-order failure is captured inside the report.
pub fn process_exposure(
    spectrum: &Spectrum,
    template: &Template,
    cell: Option<&Template>,
    config: &EngineConfig,
    corrections: Option<&CorrectionTable>,
    rv_guess_kms: f64,
) -> Result<ExposureReport, RvError> {
    config.model.validate()?;

    let ctx = FitContext {
        template,
        cell,
        model: &config.model,
    };

    let mut jobs: Vec<Chunk<'_>> = Vec::new();
    for (order_index, order) in spectrum.orders.iter().enumerate() {
        jobs.extend(chunk_order(order_index, order, &config.chunking)?);
    }

    // Fan out: one task per chunk, exclusive ownership of all mutable fit
    // state; fan in: ordered collection before aggregation.
    let outcomes: Vec<ChunkOutcome> = jobs
        .par_iter()
        .map(|chunk| {
            let outcome = default_initial(chunk, &ctx, rv_guess_kms)
                .and_then(|initial| reject_and_refit(chunk, &ctx, &initial, &config.reject));
            if let Err(err) = &outcome {
                warn!(
                    "order {} chunk {} excluded: {err}",
                    chunk.order, chunk.index
                );
            }
            ChunkOutcome {
                order: chunk.order,
                chunk: chunk.index,
                outcome,
            }
        })
        .collect();

    let mut orders = Vec::with_capacity(spectrum.orders.len());
    for order_index in 0..spectrum.orders.len() {
        let of_order: Vec<&ChunkOutcome> =
            outcomes.iter().filter(|o| o.order == order_index).collect();
        if of_order.is_empty() {
            continue;
        }

        let fits: Vec<&crate::domain::FitResult> = of_order
            .iter()
            .filter_map(|o| o.outcome.as_ref().ok())
            .collect();
        let estimates = estimates_from_fits(fits.into_iter());
        let excluded: Vec<(usize, RvError)> = of_order
            .iter()
            .filter_map(|o| o.outcome.as_ref().err().map(|e| (o.chunk, e.clone())))
            .collect();

        let combined = match combine(&estimates, config.combine) {
            Ok(rv) => Some(rv),
            Err(RvError::NoValidChunks) => None,
            Err(other) => return Err(other),
        };

        orders.push(OrderSummary {
            order: order_index,
            n_chunks: of_order.len(),
            combined,
            excluded,
        });
    }

    // Second pass: order RVs into one exposure RV.
    let order_estimates: Vec<RvEstimate> = orders
        .iter()
        .filter_map(|o| o.combined.as_ref().map(RvEstimate::from))
        .collect();
    let (exposure_rv, mut failure) = match combine(&order_estimates, config.combine) {
        Ok(rv) => (Some(rv), None),
        Err(err) => (None, Some(err)),
    };

    let corrected_rv = match (&exposure_rv, corrections) {
        (Some(rv), Some(table)) => match table.lookup(spectrum.epoch) {
            Ok(entry) => Some(apply_corrections(rv, &entry.drift, &entry.barycentric)),
            Err(err) => {
                warn!("exposure {}: {err}", spectrum.epoch);
                failure = Some(err);
                None
            }
        },
        _ => None,
    };

    Ok(ExposureReport {
        epoch: spectrum.epoch,
        orders,
        exposure_rv,
        corrected_rv,
        failure,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    use crate::combine::{Correction, ExposureCorrections};
    use crate::domain::{FitParameters, ModelConfig};
    use crate::synth::{line_template, noiseless_observation, pixel_grid, LineListConfig};

    fn logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn epoch() -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_opt(4, 15, 0)
            .unwrap()
    }

    fn test_template() -> Template {
        line_template(&LineListConfig {
            lambda_min: 4990.0,
            lambda_max: 5030.0,
            n_lines: 80,
            depth_min: 0.2,
            depth_max: 0.7,
            width_kms: 4.0,
            seed: 19,
        })
        .unwrap()
    }

    fn test_engine_config() -> EngineConfig {
        let mut model = ModelConfig::default();
        model.grid.ip_half_size = 25;
        model.rv_window_kms = 40.0;
        EngineConfig {
            model,
            chunking: ChunkingConfig {
                chunk_pixels: 150,
                min_chunk_pixels: 60,
            },
            ..EngineConfig::default()
        }
    }

    fn synthetic_exposure(template: &Template, config: &EngineConfig, rv_kms: f64) -> Spectrum {
        let ctx = FitContext {
            template,
            cell: None,
            model: &config.model,
        };
        let truth = FitParameters {
            rv_kms,
            continuum: vec![1.0, 0.05, -0.02],
            ip: vec![2.2],
        };
        let orders = [5000.0, 5012.0]
            .iter()
            .map(|&start| {
                let wavelength = pixel_grid(start, 300, 0.02);
                noiseless_observation(&wavelength, &ctx, &truth, 200.0).unwrap()
            })
            .collect();
        Spectrum {
            epoch: epoch(),
            orders,
        }
    }

    #[test]
    fn chunk_order_tiles_and_absorbs_the_tail() {
        let order = OrderSpectrum {
            wavelength: pixel_grid(5000.0, 500, 0.02),
            flux: vec![1.0; 500],
            sigma: vec![0.01; 500],
        };
        let config = ChunkingConfig {
            chunk_pixels: 200,
            min_chunk_pixels: 150,
        };
        let chunks = chunk_order(3, &order, &config).unwrap();
        // 200 + 300: the 100-pixel tail is merged into the second tile.
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 200);
        assert_eq!(chunks[1].len(), 300);
        assert!(chunks.iter().all(|c| c.order == 3));
    }

    #[test]
    fn short_order_yields_no_chunks() {
        let order = OrderSpectrum {
            wavelength: pixel_grid(5000.0, 20, 0.02),
            flux: vec![1.0; 20],
            sigma: vec![0.01; 20],
        };
        let config = ChunkingConfig::default();
        assert!(chunk_order(0, &order, &config).unwrap().is_empty());
    }

    #[test]
    fn exposure_recovers_the_injected_rv() {
        logging();
        let template = test_template();
        let config = test_engine_config();
        let spectrum = synthetic_exposure(&template, &config, 2.0);

        let report = process_exposure(&spectrum, &template, None, &config, None, 0.0).unwrap();

        assert_eq!(report.orders.len(), 2);
        assert_eq!(report.n_excluded(), 0);
        let rv = report.exposure_rv.expect("exposure RV present");
        // Chunks are fit on their own model grids, not the grid the
        // synthetic order was generated on, so recovery is discretization-
        // limited rather than exact.
        assert!((rv.rv_kms - 2.0).abs() < 5e-3, "rv {}", rv.rv_kms);
        assert!(rv.err_kms > 0.0);
        assert!(report.failure.is_none());
    }

    #[test]
    fn corrections_are_applied_when_present() {
        logging();
        let template = test_template();
        let config = test_engine_config();
        let spectrum = synthetic_exposure(&template, &config, 2.0);

        let mut table = CorrectionTable::new();
        table.insert(
            epoch(),
            ExposureCorrections {
                drift: Correction {
                    value_kms: 0.1,
                    err_kms: 0.001,
                },
                barycentric: Correction {
                    value_kms: -5.0,
                    err_kms: 0.002,
                },
            },
        );

        let report =
            process_exposure(&spectrum, &template, None, &config, Some(&table), 0.0).unwrap();
        let raw = report.exposure_rv.unwrap();
        let corrected = report.corrected_rv.unwrap();
        assert!((corrected.rv_kms - (raw.rv_kms - 0.1 - 5.0)).abs() < 1e-9);
        assert!(corrected.err_kms > raw.err_kms);
    }

    #[test]
    fn missing_correction_is_reported_not_fatal() {
        logging();
        let template = test_template();
        let config = test_engine_config();
        let spectrum = synthetic_exposure(&template, &config, 1.0);

        let table = CorrectionTable::new();
        let report =
            process_exposure(&spectrum, &template, None, &config, Some(&table), 0.0).unwrap();
        assert!(report.exposure_rv.is_some());
        assert!(report.corrected_rv.is_none());
        assert!(matches!(
            report.failure,
            Some(RvError::MissingCorrection { .. })
        ));
    }

    #[test]
    fn uncovered_order_is_excluded_but_siblings_survive() {
        logging();
        let template = test_template();
        let config = test_engine_config();
        let ctx = FitContext {
            template: &template,
            cell: None,
            model: &config.model,
        };
        let truth = FitParameters {
            rv_kms: 2.0,
            continuum: vec![1.0, 0.0, 0.0],
            ip: vec![2.2],
        };

        let good = {
            let wavelength = pixel_grid(5000.0, 300, 0.02);
            noiseless_observation(&wavelength, &ctx, &truth, 200.0).unwrap()
        };
        // This order lies outside the template; every chunk of it must fail
        // with OutOfTemplateRange while the good order proceeds.
        let bad = OrderSpectrum {
            wavelength: pixel_grid(5100.0, 300, 0.02),
            flux: vec![1.0; 300],
            sigma: vec![0.01; 300],
        };

        let spectrum = Spectrum {
            epoch: epoch(),
            orders: vec![good, bad],
        };
        let report = process_exposure(&spectrum, &template, None, &config, None, 0.0).unwrap();

        let bad_order = &report.orders[1];
        assert!(bad_order.combined.is_none());
        assert!(!bad_order.excluded.is_empty());
        assert!(bad_order
            .excluded
            .iter()
            .all(|(_, e)| matches!(e, RvError::OutOfTemplateRange { .. })));

        let rv = report.exposure_rv.expect("good order carries the exposure");
        assert!((rv.rv_kms - 2.0).abs() < 5e-3);
    }
}
