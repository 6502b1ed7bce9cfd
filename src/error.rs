//! Crate-wide error type.
//!
//! Every failure mode is local to one unit of work (a chunk fit, a
//! combination, a correction lookup). Callers capture these per unit and keep
//! processing sibling chunks/exposures; only `InvalidInput` (malformed data
//! detected before any fitting starts) is worth aborting a run for.

use chrono::NaiveDateTime;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RvError {
    /// Fewer usable pixels than the fit (or the masking policy) requires.
    #[error("insufficient data: {unmasked} usable pixels, {required} required")]
    InsufficientData { unmasked: usize, required: usize },

    /// The model is not solvable on this chunk (singular or near-singular
    /// normal equations, or a continuum order the pixel count cannot support).
    #[error("degenerate model: {0}")]
    DegenerateModel(String),

    /// The Doppler-shifted target grid extends beyond the template coverage.
    /// Callers must shrink the chunk or exclude it; the core never
    /// extrapolates.
    #[error(
        "template range exceeded: need ln-wavelength [{need_lo:.6}, {need_hi:.6}], \
         template covers [{have_lo:.6}, {have_hi:.6}]"
    )]
    OutOfTemplateRange {
        need_lo: f64,
        need_hi: f64,
        have_lo: f64,
        have_hi: f64,
    },

    /// The solver exhausted its iteration budget or diverged to non-finite
    /// values.
    #[error("no convergence after {iterations} iterations")]
    ConvergenceFailure { iterations: usize },

    /// A combination was requested over zero valid inputs. The RV is then
    /// reported as missing, never defaulted.
    #[error("no valid chunks to combine")]
    NoValidChunks,

    /// No drift/barycentric correction entry exists for the exposure epoch.
    #[error("no correction entry for exposure at {epoch}")]
    MissingCorrection { epoch: NaiveDateTime },

    /// Malformed input detected before fitting (non-monotonic wavelengths,
    /// mismatched array lengths, inconsistent configuration).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
