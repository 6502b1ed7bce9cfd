//! Domain types used throughout the engine.
//!
//! This module defines:
//!
//! - observed data containers (`Spectrum`, `OrderSpectrum`, `Chunk`)
//! - per-chunk fit state (`PixelMask`, `FitParameters`, `FitResult`)
//! - combination outputs (`RvEstimate`, `CombinedRv`)
//! - configuration (`ModelConfig`, `RejectConfig`, `EngineConfig`, ...)

pub mod types;

pub use types::*;
