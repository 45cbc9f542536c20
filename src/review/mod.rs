pub mod actions;
pub mod parse;

use serde::{Deserialize, Serialize};

pub use parse::parse_review;

/// Verdict extracted from a reviewer's report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Approved,
    ChangesRequested,
    NeedsDiscussion,
    /// The report was empty or not text we can interpret at all.
    Unparseable,
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReviewStatus::Approved => "APPROVED",
            ReviewStatus::ChangesRequested => "CHANGES_REQUESTED",
            ReviewStatus::NeedsDiscussion => "NEEDS_DISCUSSION",
            ReviewStatus::Unparseable => "UNPARSEABLE",
        };
        f.write_str(s)
    }
}

/// Issues grouped by severity. Critical issues block approval.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Findings {
    pub critical: Vec<String>,
    pub moderate: Vec<String>,
    pub minor: Vec<String>,
}

impl Findings {
    pub fn is_empty(&self) -> bool {
        self.critical.is_empty() && self.moderate.is_empty() && self.minor.is_empty()
    }
}

/// Full parsed review: verdict plus the prose sections used when
/// formatting feedback for a reimplementation cycle.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub status: ReviewStatus,
    pub summary: String,
    pub recommendations: Vec<String>,
    pub findings: Findings,
    /// The reviewer's raw report, kept for comment-only outcomes.
    pub raw: String,
}
