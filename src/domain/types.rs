//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they
//! can be:
//!
//! - used in-memory during fitting
//! - exported to JSON for later inspection
//! - round-tripped through configuration files

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::RvError;

/// One echelle order of a wavelength-calibrated exposure.
///
/// Wavelengths are in the same vacuum scale as the template; flux units are
/// arbitrary (the continuum model absorbs the scale); `sigma` is the
/// per-pixel flux uncertainty in the same units as `flux`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSpectrum {
    pub wavelength: Vec<f64>,
    pub flux: Vec<f64>,
    pub sigma: Vec<f64>,
}

impl OrderSpectrum {
    pub fn len(&self) -> usize {
        self.wavelength.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelength.is_empty()
    }
}

/// A full exposure: one spectrum per order plus the epoch used to key
/// drift/barycentric corrections.
///
/// Owned by the caller and borrowed read-only by the engine for the duration
/// of a fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spectrum {
    pub epoch: NaiveDateTime,
    pub orders: Vec<OrderSpectrum>,
}

/// A contiguous sub-range of one order: the unit of fitting.
///
/// Borrows the caller's arrays; per-chunk mutable state lives in
/// [`PixelMask`] and [`FitParameters`], never in the chunk itself.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub order: usize,
    pub index: usize,
    pub wavelength: &'a [f64],
    pub flux: &'a [f64],
    pub sigma: &'a [f64],
}

/// Smallest chunk the cubic model-grid sampling can support.
pub const MIN_CHUNK_LEN: usize = 4;

impl<'a> Chunk<'a> {
    /// Validate and build a chunk view.
    ///
    /// Wavelengths must be finite and strictly increasing and the three
    /// arrays equally long. Pixels with non-finite flux or non-positive
    /// uncertainty are legal here; they are pre-masked by
    /// [`Chunk::initial_mask`] instead of rejected.
    pub fn new(
        order: usize,
        index: usize,
        wavelength: &'a [f64],
        flux: &'a [f64],
        sigma: &'a [f64],
    ) -> Result<Self, RvError> {
        if wavelength.len() != flux.len() || wavelength.len() != sigma.len() {
            return Err(RvError::InvalidInput(format!(
                "chunk arrays disagree in length: {} wavelengths, {} fluxes, {} sigmas",
                wavelength.len(),
                flux.len(),
                sigma.len()
            )));
        }
        if wavelength.len() < MIN_CHUNK_LEN {
            return Err(RvError::InvalidInput(format!(
                "chunk has {} pixels, at least {MIN_CHUNK_LEN} required",
                wavelength.len()
            )));
        }
        for pair in wavelength.windows(2) {
            if !(pair[0].is_finite() && pair[1].is_finite() && pair[1] > pair[0]) {
                return Err(RvError::InvalidInput(
                    "chunk wavelengths must be finite and strictly increasing".into(),
                ));
            }
        }
        Ok(Self {
            order,
            index,
            wavelength,
            flux,
            sigma,
        })
    }

    pub fn len(&self) -> usize {
        self.wavelength.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelength.is_empty()
    }

    /// All-valid mask minus pixels that fail the validity invariant
    /// (non-finite flux or non-positive/non-finite uncertainty).
    pub fn initial_mask(&self) -> PixelMask {
        let mut mask = PixelMask::all_valid(self.len());
        for i in 0..self.len() {
            if !self.flux[i].is_finite() || !(self.sigma[i].is_finite() && self.sigma[i] > 0.0) {
                mask.invalidate(i);
            }
        }
        mask
    }
}

/// Boolean validity per chunk pixel.
///
/// Initialized from [`Chunk::initial_mask`], updated in place by the outlier
/// rejector, never shared across chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelMask {
    valid: Vec<bool>,
}

impl PixelMask {
    pub fn all_valid(len: usize) -> Self {
        Self {
            valid: vec![true; len],
        }
    }

    pub fn len(&self) -> usize {
        self.valid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }

    pub fn is_valid(&self, i: usize) -> bool {
        self.valid[i]
    }

    pub fn invalidate(&mut self, i: usize) {
        self.valid[i] = false;
    }

    pub fn n_valid(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }

    /// Indices of valid pixels, in pixel order.
    pub fn valid_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.valid
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.then_some(i))
    }
}

/// Instrumental-profile kernel family.
///
/// The kernel is sampled on uniform velocity knots and normalized to unit
/// sum before convolution; see `models::ip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpKind {
    /// Gaussian, parameters `[sigma]` (km/s).
    Gauss,
    /// Super-Gaussian `exp(-|v/sigma|^e)`, parameters `[sigma, exponent]`.
    SuperGauss,
    /// Two-sided Gaussian with independent blue/red widths, recentered to
    /// zero mean; parameters `[sigma_blue, sigma_red]`.
    BiGauss,
}

impl IpKind {
    /// Human-readable label for reports.
    pub fn display_name(self) -> &'static str {
        match self {
            IpKind::Gauss => "Gaussian",
            IpKind::SuperGauss => "super-Gaussian",
            IpKind::BiGauss => "bi-Gaussian",
        }
    }

    /// Number of free kernel parameters for this family.
    pub fn n_params(self) -> usize {
        match self {
            IpKind::Gauss => 1,
            IpKind::SuperGauss => 2,
            IpKind::BiGauss => 2,
        }
    }

    /// Instrument-default starting parameters.
    pub fn default_params(self) -> Vec<f64> {
        match self {
            IpKind::Gauss => vec![2.2],
            IpKind::SuperGauss => vec![2.2, 2.0],
            IpKind::BiGauss => vec![2.2, 2.2],
        }
    }
}

/// The free parameters of one chunk fit.
///
/// Created fresh per fit, mutated only by the solver, destroyed after the
/// fit converges or fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitParameters {
    /// Radial velocity, km/s, positive = redshift.
    pub rv_kms: f64,
    /// Continuum polynomial coefficients in the centered pixel coordinate,
    /// constant term first.
    pub continuum: Vec<f64>,
    /// Kernel parameters for the configured [`IpKind`].
    pub ip: Vec<f64>,
}

impl FitParameters {
    /// Total number of free parameters.
    pub fn n_free(&self) -> usize {
        1 + self.continuum.len() + self.ip.len()
    }
}

/// Output of one converged chunk fit. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    pub rv_kms: f64,
    /// Formal RV uncertainty from the inverse normal matrix, rescaled by
    /// sqrt(reduced chi-square) when that exceeds 1.
    pub rv_err_kms: f64,
    /// Weighted chi-square over unmasked pixels.
    pub chi2: f64,
    /// Unmasked pixels minus free parameters.
    pub dof: usize,
    pub converged: bool,
    pub iterations: usize,
    pub params: FitParameters,
    /// Raw residual (observed - model) per pixel, masked pixels included.
    pub residuals: Vec<f64>,
    /// The mask the fit was evaluated under.
    pub mask: PixelMask,
}

impl FitResult {
    pub fn reduced_chi2(&self) -> f64 {
        if self.dof > 0 {
            self.chi2 / self.dof as f64
        } else {
            0.0
        }
    }
}

/// The aggregation currency: one velocity with a one-sigma uncertainty.
///
/// Extracted from a [`FitResult`] for the first combination pass and from a
/// [`CombinedRv`] for the second, so both passes share one code path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RvEstimate {
    pub rv_kms: f64,
    pub err_kms: f64,
}

impl From<&FitResult> for RvEstimate {
    fn from(result: &FitResult) -> Self {
        Self {
            rv_kms: result.rv_kms,
            err_kms: result.rv_err_kms,
        }
    }
}

impl From<&CombinedRv> for RvEstimate {
    fn from(combined: &CombinedRv) -> Self {
        Self {
            rv_kms: combined.rv_kms,
            err_kms: combined.err_kms,
        }
    }
}

/// A combined RV for one order or one exposure.
///
/// Derived, never mutated in place; recomputed from its inputs when the
/// inputs change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedRv {
    pub rv_kms: f64,
    pub err_kms: f64,
    /// Number of contributing estimates.
    pub n_used: usize,
    /// Reduced chi-square of the combination; a quality flag, not a
    /// rescaling factor.
    pub chi2_red: f64,
}

/// How estimates are combined into a [`CombinedRv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CombineMode {
    /// Inverse-variance weighted mean.
    #[default]
    WeightedMean,
    /// Median with a scaled-MAD uncertainty. An explicit reporting policy
    /// for combinations with excess inter-chunk scatter, never a silent
    /// substitution.
    Robust,
}

/// Continuum normalization settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuumConfig {
    /// Polynomial degree in the centered pixel coordinate (degree + 1
    /// coefficients).
    pub degree: usize,
}

impl Default for ContinuumConfig {
    fn default() -> Self {
        Self { degree: 2 }
    }
}

/// Instrumental-profile settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpConfig {
    pub kind: IpKind,
    /// Starting kernel parameters; length must match `kind.n_params()`.
    pub initial: Vec<f64>,
}

impl Default for IpConfig {
    fn default() -> Self {
        Self {
            kind: IpKind::Gauss,
            initial: IpKind::Gauss.default_params(),
        }
    }
}

/// Model-grid settings for the forward model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Model-grid knots per pixel spacing.
    pub oversample: usize,
    /// Kernel half-size in model-grid knots; the convolution trims this many
    /// knots from each end of the grid.
    pub ip_half_size: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            oversample: 4,
            ip_half_size: 50,
        }
    }
}

/// Damped Gauss-Newton (Levenberg-Marquardt) solver settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LmConfig {
    pub max_iterations: usize,
    /// Converged when the relative chi-square drop falls below this.
    pub tol_chi2: f64,
    /// Converged when the step norm falls below this (relative to the
    /// parameter norm).
    pub tol_step: f64,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
    /// Lambda beyond which the solve is abandoned as non-convergent.
    pub max_lambda: f64,
    /// Condition-number threshold on the normal matrix.
    pub max_condition: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tol_chi2: 1e-10,
            tol_step: 1e-10,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
            max_lambda: 1e10,
            max_condition: 1e12,
        }
    }
}

/// Everything the chunk fitter needs besides the data: continuum order,
/// kernel family, grid layout and solver tolerances.
///
/// Immutable and explicitly passed; shared read-only across parallel chunk
/// fits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub continuum: ContinuumConfig,
    pub ip: IpConfig,
    pub grid: GridConfig,
    pub lm: LmConfig,
    /// Half-width of the RV search window, km/s. The solver clamps RV to
    /// this window and the model grid requires template coverage for all of
    /// it up front.
    pub rv_window_kms: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            continuum: ContinuumConfig::default(),
            ip: IpConfig::default(),
            grid: GridConfig::default(),
            lm: LmConfig::default(),
            rv_window_kms: 100.0,
        }
    }
}

impl ModelConfig {
    /// Check internal consistency before any fit uses this config.
    pub fn validate(&self) -> Result<(), RvError> {
        if self.ip.initial.len() != self.ip.kind.n_params() {
            return Err(RvError::InvalidInput(format!(
                "{} kernel takes {} parameters, {} supplied",
                self.ip.kind.display_name(),
                self.ip.kind.n_params(),
                self.ip.initial.len()
            )));
        }
        if self.grid.oversample == 0 {
            return Err(RvError::InvalidInput("grid oversample must be >= 1".into()));
        }
        if self.grid.ip_half_size == 0 {
            return Err(RvError::InvalidInput("ip_half_size must be >= 1".into()));
        }
        if !(self.rv_window_kms.is_finite() && self.rv_window_kms > 0.0) {
            return Err(RvError::InvalidInput(
                "rv_window_kms must be finite and > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Outlier-rejection policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RejectConfig {
    /// Clip factor: pixels beyond `kappa` times the robust scatter are
    /// masked.
    pub kappa: f64,
    /// Fraction of the chunk that must stay unmasked; masking below this
    /// fails the chunk.
    pub min_retained_frac: f64,
    /// Cap on Fitting <-> Masking cycles.
    pub max_cycles: usize,
}

impl Default for RejectConfig {
    fn default() -> Self {
        Self {
            kappa: 5.0,
            min_retained_frac: 0.5,
            max_cycles: 10,
        }
    }
}

/// How orders are tiled into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Target chunk length in pixels.
    pub chunk_pixels: usize,
    /// Minimum pixels for a chunk to be fit at all; a short tail tile is
    /// merged into its neighbor instead.
    pub min_chunk_pixels: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_pixels: 400,
            min_chunk_pixels: 64,
        }
    }
}

/// Full engine configuration for the exposure pipeline.
///
/// Sourced from configuration by the caller, not hardcoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    pub model: ModelConfig,
    pub reject: RejectConfig,
    pub chunking: ChunkingConfig,
    pub combine: CombineMode,
}
