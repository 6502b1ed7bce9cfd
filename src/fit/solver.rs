//! The nonlinear least-squares chunk fitter.
//!
//! Given an observed chunk and a template, solve
//!
//! ```text
//! minimize  sum_i  (f_i - m_i(theta))^2 / sigma_i^2     over unmasked i
//! ```
//!
//! for `theta = {rv, continuum coefficients, kernel parameters}` with a
//! damped Gauss-Newton (Levenberg-Marquardt) iteration:
//!
//! - numeric forward-difference Jacobian of the forward model
//! - normal equations damped multiplicatively on the diagonal, solved by SVD
//! - lambda shrinks on accepted steps and grows on rejected ones
//!
//! The formal RV uncertainty comes from the inverse of the final normal
//! matrix, rescaled by sqrt(reduced chi-square) when that exceeds 1.

use log::{debug, trace};
use nalgebra::{DMatrix, DVector};

use crate::domain::{Chunk, FitParameters, FitResult, IpKind, ModelConfig, PixelMask};
use crate::error::RvError;
use crate::math::{condition_number, median, solve_normal};
use crate::models::forward::ChunkModel;
use crate::models::ip::MIN_IP_WIDTH_KMS;
use crate::template::Template;

/// Relative step for the forward-difference Jacobian.
const JACOBIAN_EPS: f64 = 1e-6;

/// A chi-square change smaller than this (relative) is a numerical plateau:
/// the fit has reached its floor and counts as converged.
const PLATEAU_REL: f64 = 1e-12;

/// Read-only context shared by every chunk fit of a run: the template, the
/// optional gas-cell/telluric reference, and the model configuration.
///
/// Explicitly passed, never global, so parallel fits stay reproducible.
#[derive(Debug, Clone, Copy)]
pub struct FitContext<'a> {
    pub template: &'a Template,
    pub cell: Option<&'a Template>,
    pub model: &'a ModelConfig,
}

/// Starting parameters for a chunk fit: RV from the caller (or zero),
/// continuum from the observed-to-model flux ratio, kernel from the
/// instrument defaults.
pub fn default_initial(
    chunk: &Chunk<'_>,
    ctx: &FitContext<'_>,
    rv_guess_kms: f64,
) -> Result<FitParameters, RvError> {
    let model = ChunkModel::build(chunk.wavelength, ctx.template, ctx.cell, ctx.model)?;

    let n_cont = ctx.model.continuum.degree + 1;
    let mut params = FitParameters {
        rv_kms: rv_guess_kms,
        continuum: {
            let mut c = vec![0.0; n_cont];
            c[0] = 1.0;
            c
        },
        ip: ctx.model.ip.initial.clone(),
    };

    let mask = chunk.initial_mask();
    let base = model.evaluate(&params);
    let obs: Vec<f64> = mask.valid_indices().map(|i| chunk.flux[i]).collect();
    let mod_: Vec<f64> = mask.valid_indices().map(|i| base[i]).collect();
    if let (Some(obs_level), Some(model_level)) = (median(&obs), median(&mod_)) {
        if model_level.abs() > f64::EPSILON && obs_level.is_finite() {
            params.continuum[0] = obs_level / model_level;
        }
    }
    Ok(params)
}

/// Fit one chunk with its initial (pre-masked) pixel mask.
pub fn fit_chunk(
    chunk: &Chunk<'_>,
    ctx: &FitContext<'_>,
    initial: &FitParameters,
) -> Result<FitResult, RvError> {
    fit_masked(chunk, ctx, initial, &chunk.initial_mask())
}

/// Fit one chunk under an explicit pixel mask (used by the rejection loop).
pub fn fit_masked(
    chunk: &Chunk<'_>,
    ctx: &FitContext<'_>,
    initial: &FitParameters,
    mask: &PixelMask,
) -> Result<FitResult, RvError> {
    let config = ctx.model;
    if initial.ip.len() != config.ip.kind.n_params()
        || initial.continuum.len() != config.continuum.degree + 1
    {
        return Err(RvError::InvalidInput(
            "initial parameters disagree with the model configuration".into(),
        ));
    }

    let model = ChunkModel::build(chunk.wavelength, ctx.template, ctx.cell, config)?;

    let free = initial.n_free();
    let n_valid = mask.n_valid();
    if initial.continuum.len() >= n_valid {
        return Err(RvError::DegenerateModel(format!(
            "continuum degree {} against {n_valid} unmasked pixels",
            config.continuum.degree
        )));
    }
    if n_valid < free {
        return Err(RvError::InsufficientData {
            unmasked: n_valid,
            required: free,
        });
    }

    let valid: Vec<usize> = mask.valid_indices().collect();
    let weights: Vec<f64> = valid.iter().map(|&i| 1.0 / (chunk.sigma[i] * chunk.sigma[i])).collect();

    let mut params = initial.clone();
    constrain(&mut params, config);

    let mut model_flux = model.evaluate(&params);
    let mut chi2 = weighted_chi2(chunk, &model_flux, &valid, &weights);
    if !chi2.is_finite() {
        return Err(RvError::ConvergenceFailure { iterations: 0 });
    }

    let lm = &config.lm;
    let mut lambda = lm.initial_lambda;
    let mut converged = false;
    let mut iterations = 0;

    for iter in 1..=lm.max_iterations {
        iterations = iter;

        let (normal, gradient) =
            build_normal_system(&model, chunk, &params, &model_flux, &valid, &weights, config);

        let cond = condition_number(&normal);
        if !cond.is_finite() || cond > lm.max_condition {
            return Err(RvError::DegenerateModel(format!(
                "normal matrix condition number {cond:.3e}"
            )));
        }

        let mut damped = normal.clone();
        for j in 0..damped.nrows() {
            damped[(j, j)] *= 1.0 + lambda;
        }
        let Some(step) = solve_normal(&damped, &gradient) else {
            return Err(RvError::DegenerateModel(
                "damped normal equations unsolvable".into(),
            ));
        };

        let mut trial = apply_step(&params, &step);
        constrain(&mut trial, config);
        let trial_flux = model.evaluate(&trial);
        let trial_chi2 = weighted_chi2(chunk, &trial_flux, &valid, &weights);

        trace!(
            "order {} chunk {} iter {iter}: chi2={chi2:.6e} trial={trial_chi2:.6e} lambda={lambda:.1e}",
            chunk.order, chunk.index
        );

        if trial_chi2.is_finite() && trial_chi2 <= chi2 {
            let drop = chi2 - trial_chi2;
            let rel = drop / chi2.max(f64::MIN_POSITIVE);
            let step_small = step.norm() < lm.tol_step * (1.0 + param_norm(&params));
            params = trial;
            model_flux = trial_flux;
            chi2 = trial_chi2;
            lambda = (lambda * lm.lambda_down).max(1e-12);
            if rel < lm.tol_chi2 || step_small {
                converged = true;
                break;
            }
        } else if trial_chi2.is_finite() && trial_chi2 - chi2 <= PLATEAU_REL * chi2.max(f64::MIN_POSITIVE) {
            // Sitting at the numerical floor; nothing left to gain.
            converged = true;
            break;
        } else {
            lambda *= lm.lambda_up;
            if lambda > lm.max_lambda {
                return Err(RvError::ConvergenceFailure { iterations });
            }
        }
    }

    if !converged {
        return Err(RvError::ConvergenceFailure { iterations });
    }
    if !params_finite(&params) {
        return Err(RvError::ConvergenceFailure { iterations });
    }

    // Covariance from the undamped normal matrix at the solution.
    let (normal, _) =
        build_normal_system(&model, chunk, &params, &model_flux, &valid, &weights, config);
    let Some(covariance) = normal.try_inverse() else {
        return Err(RvError::DegenerateModel(
            "normal matrix not invertible at the solution".into(),
        ));
    };

    let dof = n_valid - free;
    let chi2_red = if dof > 0 { chi2 / dof as f64 } else { 0.0 };
    let scale = if chi2_red > 1.0 { chi2_red.sqrt() } else { 1.0 };
    let rv_err_kms = covariance[(0, 0)].max(0.0).sqrt() * scale;

    let residuals: Vec<f64> = chunk
        .flux
        .iter()
        .zip(&model_flux)
        .map(|(f, m)| f - m)
        .collect();

    debug!(
        "order {} chunk {} converged: rv={:.5} +/- {:.5} km/s, chi2_red={:.3}, {} iter",
        chunk.order, chunk.index, params.rv_kms, rv_err_kms, chi2_red, iterations
    );

    Ok(FitResult {
        rv_kms: params.rv_kms,
        rv_err_kms,
        chi2,
        dof,
        converged: true,
        iterations,
        params,
        residuals,
        mask: mask.clone(),
    })
}

fn weighted_chi2(chunk: &Chunk<'_>, model_flux: &[f64], valid: &[usize], weights: &[f64]) -> f64 {
    valid
        .iter()
        .zip(weights)
        .map(|(&i, &w)| {
            let r = chunk.flux[i] - model_flux[i];
            w * r * r
        })
        .sum()
}

/// Weighted normal matrix `J^T W J` and gradient `J^T W r` at `params`,
/// with a forward-difference Jacobian.
fn build_normal_system(
    model: &ChunkModel<'_>,
    chunk: &Chunk<'_>,
    params: &FitParameters,
    model_flux: &[f64],
    valid: &[usize],
    weights: &[f64],
    config: &ModelConfig,
) -> (DMatrix<f64>, DVector<f64>) {
    let free = params.n_free();
    let n = valid.len();

    let mut jw = DMatrix::<f64>::zeros(n, free);
    let mut rw = DVector::<f64>::zeros(n);

    for j in 0..free {
        let mut bumped = params.clone();
        let h = bump(&mut bumped, j);
        // Keep the bumped point inside the feasible region the solver
        // constrains to, so the difference quotient stays well-defined.
        constrain_widths(&mut bumped, config);
        let bumped_flux = model.evaluate(&bumped);
        for (row, &i) in valid.iter().enumerate() {
            let d = (bumped_flux[i] - model_flux[i]) / h;
            jw[(row, j)] = d * weights[row].sqrt();
        }
    }
    for (row, &i) in valid.iter().enumerate() {
        rw[row] = (chunk.flux[i] - model_flux[i]) * weights[row].sqrt();
    }

    let normal = jw.transpose() * &jw;
    let gradient = jw.transpose() * &rw;
    (normal, gradient)
}

/// Bump parameter `j` in place and return the step actually taken.
fn bump(params: &mut FitParameters, j: usize) -> f64 {
    let slot = param_slot(params, j);
    let h = JACOBIAN_EPS * slot.abs().max(1.0);
    *param_slot_mut(params, j) = slot + h;
    h
}

fn param_slot(params: &FitParameters, j: usize) -> f64 {
    if j == 0 {
        params.rv_kms
    } else if j <= params.continuum.len() {
        params.continuum[j - 1]
    } else {
        params.ip[j - 1 - params.continuum.len()]
    }
}

fn param_slot_mut(params: &mut FitParameters, j: usize) -> &mut f64 {
    if j == 0 {
        &mut params.rv_kms
    } else if j <= params.continuum.len() {
        let idx = j - 1;
        &mut params.continuum[idx]
    } else {
        let idx = j - 1 - params.continuum.len();
        &mut params.ip[idx]
    }
}

fn apply_step(params: &FitParameters, step: &DVector<f64>) -> FitParameters {
    let mut out = params.clone();
    out.rv_kms += step[0];
    for (k, c) in out.continuum.iter_mut().enumerate() {
        *c += step[1 + k];
    }
    let offset = 1 + out.continuum.len();
    for (k, p) in out.ip.iter_mut().enumerate() {
        *p += step[offset + k];
    }
    out
}

fn param_norm(params: &FitParameters) -> f64 {
    let mut acc = params.rv_kms * params.rv_kms;
    for c in &params.continuum {
        acc += c * c;
    }
    for p in &params.ip {
        acc += p * p;
    }
    acc.sqrt()
}

fn params_finite(params: &FitParameters) -> bool {
    params.rv_kms.is_finite()
        && params.continuum.iter().all(|c| c.is_finite())
        && params.ip.iter().all(|p| p.is_finite())
}

/// Clamp a trial point into the feasible region: RV inside the search
/// window, kernel widths positive, super-Gaussian exponent bounded.
fn constrain(params: &mut FitParameters, config: &ModelConfig) {
    let w = config.rv_window_kms;
    params.rv_kms = params.rv_kms.clamp(-w, w);
    constrain_widths(params, config);
}

fn constrain_widths(params: &mut FitParameters, config: &ModelConfig) {
    match config.ip.kind {
        IpKind::Gauss => {
            params.ip[0] = params.ip[0].max(MIN_IP_WIDTH_KMS);
        }
        IpKind::SuperGauss => {
            params.ip[0] = params.ip[0].max(MIN_IP_WIDTH_KMS);
            params.ip[1] = params.ip[1].clamp(0.5, 8.0);
        }
        IpKind::BiGauss => {
            params.ip[0] = params.ip[0].max(MIN_IP_WIDTH_KMS);
            params.ip[1] = params.ip[1].max(MIN_IP_WIDTH_KMS);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ModelConfig;
    use crate::synth::{line_template, noiseless_observation, pixel_grid, LineListConfig};

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
    fn recovers_known_rv_from_noiseless_chunk() {
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
            continuum: vec![0.95, 0.04, -0.02],
            ip: vec![2.2],
        };
        let wavelength = pixel_grid(5002.0, 240, 0.02);
        let obs = noiseless_observation(&wavelength, &ctx, &truth, 200.0).unwrap();
        let chunk = Chunk::new(0, 0, &obs.wavelength, &obs.flux, &obs.sigma).unwrap();

        let initial = default_initial(&chunk, &ctx, 0.0).unwrap();
        let result = fit_chunk(&chunk, &ctx, &initial).unwrap();

        assert!(result.converged);
        assert!(
            (result.rv_kms - truth.rv_kms).abs() < 1e-6,
            "rv {} vs {}",
            result.rv_kms,
            truth.rv_kms
        );
        // Zero noise: the chi-square floor is numerical, far below one per
        // degree of freedom.
        assert!(result.reduced_chi2() < 1e-10, "chi2_red {}", result.reduced_chi2());
        assert!(result.rv_err_kms > 0.0);
    }

    #[test]
    fn insufficient_pixels_fail_before_solving() {
        logging();
        let template = test_template();
        let config = test_config();
        let ctx = FitContext {
            template: &template,
            cell: None,
            model: &config,
        };

        // 4 usable pixels against 5 free parameters.
        let wavelength = pixel_grid(5002.0, 4, 0.02);
        let flux = [1.0, 1.0, 1.0, 1.0];
        let sigma = [0.01, 0.01, 0.01, 0.01];
        let chunk = Chunk::new(0, 0, &wavelength, &flux, &sigma).unwrap();

        let initial = FitParameters {
            rv_kms: 0.0,
            continuum: vec![1.0, 0.0, 0.0],
            ip: vec![2.2],
        };
        let err = fit_chunk(&chunk, &ctx, &initial).unwrap_err();
        assert!(matches!(
            err,
            RvError::InsufficientData {
                unmasked: 4,
                required: 5
            }
        ));
    }

    #[test]
    fn continuum_degeneracy_beats_the_pixel_count() {
        logging();
        let template = test_template();
        let config = test_config();
        let ctx = FitContext {
            template: &template,
            cell: None,
            model: &config,
        };

        // Masking leaves 3 pixels for 3 continuum coefficients.
        let wavelength = pixel_grid(5002.0, 6, 0.02);
        let flux = [1.0; 6];
        let sigma = [0.01, 0.01, 0.01, -1.0, -1.0, -1.0];
        let chunk = Chunk::new(0, 0, &wavelength, &flux, &sigma).unwrap();

        let initial = FitParameters {
            rv_kms: 0.0,
            continuum: vec![1.0, 0.0, 0.0],
            ip: vec![2.2],
        };
        let err = fit_chunk(&chunk, &ctx, &initial).unwrap_err();
        assert!(matches!(err, RvError::DegenerateModel(_)));
    }

    #[test]
    fn initial_guess_matches_flux_level() {
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
            continuum: vec![3.7, 0.0, 0.0],
            ip: vec![2.2],
        };
        let wavelength = pixel_grid(5002.0, 200, 0.02);
        let obs = noiseless_observation(&wavelength, &ctx, &truth, 100.0).unwrap();
        let chunk = Chunk::new(0, 0, &obs.wavelength, &obs.flux, &obs.sigma).unwrap();

        let initial = default_initial(&chunk, &ctx, 0.0).unwrap();
        assert!(
            (initial.continuum[0] - 3.7).abs() < 0.5,
            "got {}",
            initial.continuum[0]
        );
    }

    #[test]
    fn mismatched_initial_parameters_are_invalid() {
        logging();
        let template = test_template();
        let config = test_config();
        let ctx = FitContext {
            template: &template,
            cell: None,
            model: &config,
        };
        let wavelength = pixel_grid(5002.0, 100, 0.02);
        let flux = vec![1.0; 100];
        let sigma = vec![0.01; 100];
        let chunk = Chunk::new(0, 0, &wavelength, &flux, &sigma).unwrap();

        let initial = FitParameters {
            rv_kms: 0.0,
            continuum: vec![1.0],
            ip: vec![2.2],
        };
        assert!(matches!(
            fit_chunk(&chunk, &ctx, &initial),
            Err(RvError::InvalidInput(_))
        ));
    }
}
