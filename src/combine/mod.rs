//! RV combination.
//!
//! Responsibilities:
//!
//! - aggregate per-chunk (and per-order) velocities into one RV with a
//!   rigorous uncertainty
//! - apply externally supplied drift/barycentric corrections

pub mod adjust;
pub mod aggregate;

pub use adjust::*;
pub use aggregate::*;
