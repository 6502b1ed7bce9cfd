//! Per-exposure reporting.
//!
//! We keep formatting code in one place so:
//! - the fitting code stays clean and testable
//! - output changes are localized
//!
//! The report is the user-visible face of partial-failure isolation: every
//! excluded chunk is named together with the reason, instead of the run
//! aborting.

use chrono::NaiveDateTime;

use crate::domain::{CombinedRv, FitResult};
use crate::error::RvError;

/// Outcome of one chunk's fit, successful or not.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub order: usize,
    pub chunk: usize,
    pub outcome: Result<FitResult, RvError>,
}

/// Combined result for one order.
#[derive(Debug, Clone)]
pub struct OrderSummary {
    pub order: usize,
    /// Chunks attempted in this order.
    pub n_chunks: usize,
    /// `None` when no chunk of the order survived.
    pub combined: Option<CombinedRv>,
    /// Excluded chunks with the failure that excluded them.
    pub excluded: Vec<(usize, RvError)>,
}

/// The full per-exposure result.
#[derive(Debug, Clone)]
pub struct ExposureReport {
    pub epoch: NaiveDateTime,
    pub orders: Vec<OrderSummary>,
    /// RV combined across orders, before corrections.
    pub exposure_rv: Option<CombinedRv>,
    /// RV after drift/barycentric corrections, when a correction table was
    /// supplied and carried an entry for the epoch.
    pub corrected_rv: Option<CombinedRv>,
    /// Exposure-level failure (`NoValidChunks`, `MissingCorrection`), if
    /// any.
    pub failure: Option<RvError>,
}

impl ExposureReport {
    /// Total chunks excluded across all orders.
    pub fn n_excluded(&self) -> usize {
        self.orders.iter().map(|o| o.excluded.len()).sum()
    }
}

/// Format an exposure report for terminal display.
pub fn format_report(report: &ExposureReport) -> String {
    let mut out = String::new();

    out.push_str(&format!("=== exposure {} ===\n", report.epoch));
    match &report.exposure_rv {
        Some(rv) => out.push_str(&format!(
            "RV: {:.5} +/- {:.5} km/s  (n={}, chi2_red={:.2})\n",
            rv.rv_kms, rv.err_kms, rv.n_used, rv.chi2_red
        )),
        None => out.push_str("RV: missing\n"),
    }
    if let Some(rv) = &report.corrected_rv {
        out.push_str(&format!(
            "corrected RV: {:.5} +/- {:.5} km/s\n",
            rv.rv_kms, rv.err_kms
        ));
    }
    if let Some(failure) = &report.failure {
        out.push_str(&format!("failure: {failure}\n"));
    }

    for order in &report.orders {
        match &order.combined {
            Some(rv) => out.push_str(&format!(
                "order {:>3}: {:.5} +/- {:.5} km/s  ({}/{} chunks, chi2_red={:.2})\n",
                order.order,
                rv.rv_kms,
                rv.err_kms,
                rv.n_used,
                order.n_chunks,
                rv.chi2_red
            )),
            None => out.push_str(&format!(
                "order {:>3}: missing ({} chunks attempted)\n",
                order.order, order.n_chunks
            )),
        }
        for (chunk, err) in &order.excluded {
            out.push_str(&format!("  excluded chunk {chunk}: {err}\n"));
        }
    }

    out
}
