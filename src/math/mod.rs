//! Numerical primitives: robust statistics, cubic interpolation and the
//! damped least-squares step solver.

pub mod interp;
pub mod lsq;
pub mod stats;

pub use interp::*;
pub use lsq::*;
pub use stats::*;
