//! Reference template container and Doppler-shifted resampling.
//!
//! The template (stellar, telluric, or gas-cell reference) is stored on its
//! native grid converted to ln-wavelength, which turns a Doppler shift into
//! a constant offset: an observation redshifted by `v` is modeled by
//! evaluating the rest-frame template at `ln(lambda) - v/c`.
//!
//! Templates are loaded once per run and shared read-only across every chunk
//! and exposure.

use serde::{Deserialize, Serialize};

use crate::C_KMS;
use crate::error::RvError;
use crate::math::cubic_interp;

/// A reference spectrum at rest wavelength, assumed noise-free relative to
/// the observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    lnw: Vec<f64>,
    flux: Vec<f64>,
}

impl Template {
    /// Build from a native wavelength grid.
    ///
    /// Wavelengths must be finite, positive and strictly increasing; at
    /// least four samples are needed for cubic resampling.
    pub fn from_wavelength(wavelength: &[f64], flux: &[f64]) -> Result<Self, RvError> {
        if wavelength.len() != flux.len() {
            return Err(RvError::InvalidInput(format!(
                "template arrays disagree in length: {} wavelengths, {} fluxes",
                wavelength.len(),
                flux.len()
            )));
        }
        if wavelength.len() < 4 {
            return Err(RvError::InvalidInput(format!(
                "template has {} samples, at least 4 required",
                wavelength.len()
            )));
        }
        let mut prev = 0.0_f64;
        for (i, &w) in wavelength.iter().enumerate() {
            if !(w.is_finite() && w > 0.0) || (i > 0 && w <= prev) {
                return Err(RvError::InvalidInput(
                    "template wavelengths must be finite, positive and strictly increasing".into(),
                ));
            }
            prev = w;
        }
        if flux.iter().any(|f| !f.is_finite()) {
            return Err(RvError::InvalidInput(
                "template flux must be finite".into(),
            ));
        }
        Ok(Self {
            lnw: wavelength.iter().map(|w| w.ln()).collect(),
            flux: flux.to_vec(),
        })
    }

    /// Lower edge of the covered ln-wavelength range.
    pub fn lnw_min(&self) -> f64 {
        self.lnw[0]
    }

    /// Upper edge of the covered ln-wavelength range.
    pub fn lnw_max(&self) -> f64 {
        *self.lnw.last().expect("template is never empty")
    }

    /// Whether the template covers `[lo, hi]` in ln-wavelength.
    pub fn covers(&self, lo: f64, hi: f64) -> bool {
        lo >= self.lnw_min() && hi <= self.lnw_max()
    }

    /// Template flux on `target_lnw`, Doppler-shifted by `rv_kms`.
    ///
    /// Fails with `OutOfTemplateRange` when any shifted target point falls
    /// outside the native coverage; the caller must shrink the chunk or
    /// exclude it.
    pub fn sample_shifted(&self, rv_kms: f64, target_lnw: &[f64]) -> Result<Vec<f64>, RvError> {
        if target_lnw.is_empty() {
            return Ok(Vec::new());
        }
        let shift = rv_kms / C_KMS;
        let need_lo = target_lnw[0] - shift;
        let need_hi = target_lnw[target_lnw.len() - 1] - shift;
        if !self.covers(need_lo, need_hi) {
            return Err(RvError::OutOfTemplateRange {
                need_lo,
                need_hi,
                have_lo: self.lnw_min(),
                have_hi: self.lnw_max(),
            });
        }

        let mut out = Vec::with_capacity(target_lnw.len());
        for &x in target_lnw {
            match cubic_interp(&self.lnw, &self.flux, x - shift) {
                Some(v) => out.push(v),
                None => {
                    return Err(RvError::OutOfTemplateRange {
                        need_lo,
                        need_hi,
                        have_lo: self.lnw_min(),
                        have_hi: self.lnw_max(),
                    });
                }
            }
        }
        Ok(out)
    }
}
