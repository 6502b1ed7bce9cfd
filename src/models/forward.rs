//! The assembled chunk forward model.
//!
//! For one chunk, the model prediction at pixel `i` is
//!
//! ```text
//! m_i = continuum(u_i) * [ IP (*) (template_shifted * cell) ](lambda_i)
//! ```
//!
//! evaluated on a uniform, oversampled ln-wavelength grid:
//!
//! 1. resample the template at the trial RV onto the model grid
//! 2. multiply by the optional gas-cell/telluric reference spectrum
//! 3. convolve with the instrumental-profile kernel (`valid` region only)
//! 4. interpolate the convolved model onto the chunk's pixel wavelengths
//! 5. scale by the continuum polynomial
//!
//! Everything that does not depend on the trial parameters (grid layout,
//! cell resampling, pixel coordinates) is precomputed in [`ChunkModel`],
//! which is then shared immutably by solver iterations.

use crate::C_KMS;
use crate::domain::{FitParameters, ModelConfig};
use crate::error::RvError;
use crate::math::cubic_interp;
use crate::models::continuum::{eval_poly, normalized_pixels};
use crate::models::ip::{convolve_valid, kernel, velocity_knots};
use crate::template::Template;

/// Extra uniform-grid knots kept beyond the chunk edges so that pixel
/// interpolation never lands on a one-sided boundary segment.
const GRID_PAD_KNOTS: usize = 2;

/// Precomputed, parameter-independent state for one chunk's forward model.
#[derive(Debug, Clone)]
pub struct ChunkModel<'a> {
    template: &'a Template,
    /// Cell/telluric reference resampled onto the model grid (unshifted).
    cell: Option<Vec<f64>>,
    /// Uniform model grid in ln-wavelength, kernel pads included.
    grid_lnw: Vec<f64>,
    /// Valid sub-grid after convolution trims `hs` knots per side.
    eff_range: std::ops::Range<usize>,
    /// Kernel velocity knots.
    vk: Vec<f64>,
    /// Chunk pixel positions in ln-wavelength.
    target_lnw: Vec<f64>,
    /// Centered pixel coordinate per chunk pixel.
    pixel_u: Vec<f64>,
    config: &'a ModelConfig,
}

impl<'a> ChunkModel<'a> {
    /// Lay out the model grid for a chunk's wavelength array and verify
    /// template coverage for the whole RV search window.
    pub fn build(
        wavelength: &[f64],
        template: &'a Template,
        cell: Option<&Template>,
        config: &'a ModelConfig,
    ) -> Result<Self, RvError> {
        config.validate()?;

        let n_pix = wavelength.len();
        if n_pix < 2 {
            return Err(RvError::InvalidInput(
                "chunk must have at least 2 pixels".into(),
            ));
        }
        let n_cont = config.continuum.degree + 1;
        if n_cont >= n_pix {
            return Err(RvError::DegenerateModel(format!(
                "continuum degree {} needs more than {} pixels",
                config.continuum.degree, n_pix
            )));
        }

        let target_lnw: Vec<f64> = wavelength.iter().map(|w| w.ln()).collect();
        let lo = target_lnw[0];
        let hi = target_lnw[n_pix - 1];
        let span = hi - lo;
        if !(span > 0.0) {
            return Err(RvError::InvalidInput(
                "chunk wavelengths must be strictly increasing".into(),
            ));
        }

        let hs = config.grid.ip_half_size;
        let dx = span / ((n_pix - 1) * config.grid.oversample) as f64;
        let n_core = (span / dx).ceil() as usize + 1;
        let pad = hs + GRID_PAD_KNOTS;
        let n_total = n_core + 2 * pad;
        let start = lo - pad as f64 * dx;
        let grid_lnw: Vec<f64> = (0..n_total).map(|i| start + i as f64 * dx).collect();

        // The solver clamps RV to +/- rv_window_kms; demand template
        // coverage for the whole window now so no trial step can wander off
        // the template mid-solve. 1 km/s of slack absorbs Jacobian bumps at
        // the window edge.
        let margin = (config.rv_window_kms + 1.0) / C_KMS;
        let need_lo = grid_lnw[0] - margin;
        let need_hi = grid_lnw[n_total - 1] + margin;
        if !template.covers(need_lo, need_hi) {
            return Err(RvError::OutOfTemplateRange {
                need_lo,
                need_hi,
                have_lo: template.lnw_min(),
                have_hi: template.lnw_max(),
            });
        }

        let cell = match cell {
            Some(tpl) => Some(tpl.sample_shifted(0.0, &grid_lnw)?),
            None => None,
        };

        Ok(Self {
            template,
            cell,
            vk: velocity_knots(hs, dx * C_KMS),
            eff_range: hs..n_total - hs,
            grid_lnw,
            target_lnw,
            pixel_u: normalized_pixels(n_pix),
            config,
        })
    }

    /// Number of chunk pixels the model predicts.
    pub fn n_pixels(&self) -> usize {
        self.target_lnw.len()
    }

    /// Chunk pixel positions in ln-wavelength.
    pub fn target_lnw(&self) -> &[f64] {
        &self.target_lnw
    }

    /// Evaluate the model flux per chunk pixel.
    ///
    /// Non-finite values (from pathological trial parameters) are returned
    /// as-is; the solver treats the resulting non-finite chi-square as a
    /// rejected step.
    pub fn evaluate(&self, params: &FitParameters) -> Vec<f64> {
        let n_pix = self.n_pixels();

        let star = match self.template.sample_shifted(params.rv_kms, &self.grid_lnw) {
            Ok(flux) => flux,
            // Unreachable for RVs inside the window checked at build time.
            Err(_) => return vec![f64::NAN; n_pix],
        };

        let mut gas = star;
        if let Some(cell) = &self.cell {
            for (g, c) in gas.iter_mut().zip(cell) {
                *g *= c;
            }
        }

        let kern = kernel(self.config.ip.kind, &params.ip, &self.vk);
        let conv = convolve_valid(&gas, &kern);
        let eff_lnw = &self.grid_lnw[self.eff_range.clone()];
        debug_assert_eq!(conv.len(), eff_lnw.len());

        let mut out = Vec::with_capacity(n_pix);
        for (i, &x) in self.target_lnw.iter().enumerate() {
            let sampled = cubic_interp(eff_lnw, &conv, x).unwrap_or(f64::NAN);
            out.push(sampled * eval_poly(&params.continuum, self.pixel_u[i]));
        }
        out
    }
}
