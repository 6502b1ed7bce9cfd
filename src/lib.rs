//! `rv-forward` library crate.
//!
//! A forward-modeling radial-velocity engine for echelle spectra: each
//! observed chunk is fit against a Doppler-shifted, IP-convolved reference
//! template, and per-chunk velocities are combined into one RV per order and
//! per exposure.
//!
//! The crate is a library on purpose:
//!
//! - core logic is testable without spawning processes
//! - front ends (CLI, GUI, batch drivers) stay external and thin
//! - file readers, ephemerides and telluric databases are the caller's job

pub mod combine;
pub mod domain;
pub mod error;
pub mod fit;
pub mod math;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod synth;
pub mod template;

/// Speed of light in km/s, the velocity unit used throughout.
pub const C_KMS: f64 = 299_792.458;
