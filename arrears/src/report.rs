//! Report kinds.
//!
//! The set of reports is closed: every processing request names exactly
//! one of these kinds and the server dispatches on it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ArrearsError, ArrearsResult};

/// A kind of report the server can produce from an uploaded portfolio.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    /// Loans whose arrangement has gone dormant.
    DormantArrangement,

    /// Arrears collected between a start-of-day and a current snapshot.
    ArrearsCollected,

    /// Dues arranged by field officer.
    ArrangeDues,

    /// Arrears arranged into ageing buckets.
    ArrangeArrears,

    /// Month-to-date unpaid dues.
    MtdUnpaidDues,

    /// Month-to-date parameters compared across branches.
    BranchComparison,
}

impl ReportKind {
    pub const ALL: [ReportKind; 6] = [
        Self::DormantArrangement,
        Self::ArrearsCollected,
        Self::ArrangeDues,
        Self::ArrangeArrears,
        Self::MtdUnpaidDues,
        Self::BranchComparison,
    ];

    /// Returns the canonical name of the report.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DormantArrangement => "dormant_arrangement",
            Self::ArrearsCollected => "arrears_collected",
            Self::ArrangeDues => "arrange_dues",
            Self::ArrangeArrears => "arrange_arrears",
            Self::MtdUnpaidDues => "mtd_unpaid_dues",
            Self::BranchComparison => "branch_comparison",
        }
    }

    /// Returns the columns rows of this report are grouped by, in order of preference.
    ///
    /// The first column present in an uploaded file becomes the primary
    /// ordering key of the result set.
    pub fn grouping_columns(&self) -> &'static [&'static str] {
        match self {
            Self::BranchComparison => &["Branch", "BranchName", "FieldOfficer"],
            Self::ArrangeArrears => &["SalesRep", "FieldOfficer", "Officer"],
            _ => &["FieldOfficer", "Officer", "SalesRep"],
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportKind {
    type Err = ArrearsError;

    fn from_str(s: &str) -> ArrearsResult<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| ArrearsError::UnknownReportKind(s.to_owned()))
    }
}
