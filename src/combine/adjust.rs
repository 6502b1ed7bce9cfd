//! Drift and barycentric adjustment.
//!
//! The engine consumes these correction terms, it never computes them:
//! instrument drift comes from the calibration pipeline, the barycentric
//! velocity from an ephemeris service. Both are keyed by exposure epoch and
//! carry their own uncertainties, which add in quadrature.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::domain::CombinedRv;
use crate::error::RvError;

/// One externally supplied correction term with its one-sigma uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub value_kms: f64,
    pub err_kms: f64,
}

impl Correction {
    /// A zero correction with zero uncertainty.
    pub fn zero() -> Self {
        Self {
            value_kms: 0.0,
            err_kms: 0.0,
        }
    }
}

/// Correction terms for one exposure epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExposureCorrections {
    pub drift: Correction,
    pub barycentric: Correction,
}

/// Drift/barycentric corrections keyed by exposure epoch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrectionTable {
    entries: BTreeMap<NaiveDateTime, ExposureCorrections>,
}

impl CorrectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, epoch: NaiveDateTime, corrections: ExposureCorrections) {
        self.entries.insert(epoch, corrections);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The corrections recorded for `epoch`.
    ///
    /// Fails with `MissingCorrection` when no entry exists; an absent
    /// correction is never assumed to be zero.
    pub fn lookup(&self, epoch: NaiveDateTime) -> Result<ExposureCorrections, RvError> {
        self.entries
            .get(&epoch)
            .copied()
            .ok_or(RvError::MissingCorrection { epoch })
    }
}

/// Apply drift and barycentric corrections to a combined RV.
///
/// Pure: `final = combined - drift + barycentric`, uncertainties in
/// quadrature; `n_used` and the combination quality flag carry through.
pub fn apply_corrections(
    combined: &CombinedRv,
    drift: &Correction,
    barycentric: &Correction,
) -> CombinedRv {
    let err2 = combined.err_kms * combined.err_kms
        + drift.err_kms * drift.err_kms
        + barycentric.err_kms * barycentric.err_kms;

    CombinedRv {
        rv_kms: combined.rv_kms - drift.value_kms + barycentric.value_kms,
        err_kms: err2.sqrt(),
        n_used: combined.n_used,
        chi2_red: combined.chi2_red,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn combined() -> CombinedRv {
        CombinedRv {
            rv_kms: 10.0,
            err_kms: 0.01,
            n_used: 12,
            chi2_red: 1.1,
        }
    }

    fn epoch() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_opt(22, 30, 0)
            .unwrap()
    }

    #[test]
    fn zero_corrections_change_nothing() {
        let out = apply_corrections(&combined(), &Correction::zero(), &Correction::zero());
        assert_eq!(out, combined());
    }

    #[test]
    fn corrections_shift_and_add_in_quadrature() {
        let drift = Correction {
            value_kms: 0.5,
            err_kms: 0.003,
        };
        let bary = Correction {
            value_kms: -12.0,
            err_kms: 0.004,
        };
        let out = apply_corrections(&combined(), &drift, &bary);
        assert!((out.rv_kms - (10.0 - 0.5 - 12.0)).abs() < 1e-12);
        let expect_err = (0.01_f64 * 0.01 + 0.003 * 0.003 + 0.004 * 0.004).sqrt();
        assert!((out.err_kms - expect_err).abs() < 1e-12);
        assert_eq!(out.n_used, 12);
    }

    #[test]
    fn missing_epoch_is_an_error() {
        let table = CorrectionTable::new();
        let err = table.lookup(epoch()).unwrap_err();
        assert!(matches!(err, RvError::MissingCorrection { .. }));
    }

    #[test]
    fn lookup_returns_the_stored_entry() {
        let mut table = CorrectionTable::new();
        let entry = ExposureCorrections {
            drift: Correction {
                value_kms: 0.02,
                err_kms: 0.001,
            },
            barycentric: Correction {
                value_kms: 14.2,
                err_kms: 0.002,
            },
        };
        table.insert(epoch(), entry);
        assert_eq!(table.lookup(epoch()).unwrap(), entry);
        assert_eq!(table.len(), 1);
    }
}
