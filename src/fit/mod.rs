//! Chunk fitting.
//!
//! Responsibilities:
//!
//! - solve the per-chunk nonlinear least-squares problem (damped
//!   Gauss-Newton) for RV + continuum + kernel parameters
//! - iteratively mask discrepant pixels and re-fit (explicit state machine)

pub mod reject;
pub mod solver;

pub use reject::*;
pub use solver::*;
