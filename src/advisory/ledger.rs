//! Advisory decision ledger.
//!
//! Every `advise` call writes exactly one ledger row, emitted or blocked.
//! The ledger is the audit trail suppression behavior is tested against.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::util;

use super::Route;

/// Outcome of one advisory call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// At least one item was returned to the caller.
    Emitted,
    /// Suppression or an advisor fault returned nothing.
    Blocked,
}

/// One row in the decision ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdviceDecision {
    /// When the call happened.
    pub ts: DateTime<Utc>,
    /// Calling session.
    pub session_id: String,
    /// Tool the advice was for.
    pub tool: String,
    /// Emitted or blocked.
    pub outcome: DecisionOutcome,
    /// How retrieval was satisfied.
    pub route: Route,
    /// Items returned to the caller.
    pub selected_count: usize,
    /// Items dropped by suppression.
    pub suppressed_count: usize,
    /// Per-source item counts, formatted `source:count`.
    pub sources: Vec<String>,
    /// Suppression reasons, in rule order.
    pub suppression_reasons: Vec<String>,
}

/// Append-only writer for the decision ledger.
#[derive(Debug, Clone)]
pub struct DecisionLedger {
    path: PathBuf,
}

impl DecisionLedger {
    /// Create a ledger writing to the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append one decision.
    pub fn record(&self, decision: &AdviceDecision) -> Result<()> {
        util::append_jsonl(&self.path, decision)
    }

    /// Read all decisions back (tests and status).
    pub fn read_all(&self) -> Result<Vec<AdviceDecision>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = util::read_to_string_limited(&self.path)?;
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    /// Path of the ledger file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
