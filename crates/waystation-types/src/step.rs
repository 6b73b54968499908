//! Step ledger records and timers.
//!
//! A `StepRecord` is written exactly once per step index and never edited.
//! The stable column set (`run_id`, `index`, `kind`, `input_fingerprint`,
//! `result_body`, `result_status`, `completed_at`) is what replay depends on;
//! `name`, `outcome` and `result_headers` are additive.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Header mapping captured from HTTP responses: name -> ordered values.
pub type HeaderValues = BTreeMap<String, Vec<String>>;

// ---------------------------------------------------------------------------
// StepKind
// ---------------------------------------------------------------------------

/// The kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Local computation inside the workflow process.
    Generic,
    /// Outbound HTTP call.
    Call,
    /// Durable sleep.
    Sleep,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Generic => "generic",
            StepKind::Call => "call",
            StepKind::Sleep => "sleep",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generic" => Ok(StepKind::Generic),
            "call" => Ok(StepKind::Call),
            "sleep" => Ok(StepKind::Sleep),
            other => Err(format!("invalid step kind: '{other}'")),
        }
    }
}

/// Whether a step produced a result or a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Succeeded => "succeeded",
            StepOutcome::Failed => "failed",
        }
    }
}

impl FromStr for StepOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(StepOutcome::Succeeded),
            "failed" => Ok(StepOutcome::Failed),
            other => Err(format!("invalid step outcome: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// StepRecord
// ---------------------------------------------------------------------------

/// One immutable entry of a run's step ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: String,
    /// 1-based position of the step in a clean run of the workflow code.
    pub index: u32,
    /// User-facing step name (e.g. "post call").
    pub name: String,
    pub kind: StepKind,
    /// Hex SHA-256 of kind, name and canonical step input.
    pub input_fingerprint: String,
    pub outcome: StepOutcome,
    /// Step result. JSON text for generic steps, response text for calls,
    /// RFC 3339 wake time for sleeps, error message for failures.
    pub result_body: String,
    /// HTTP status for call steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_status: Option<u16>,
    /// Response headers for call steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_headers: Option<HeaderValues>,
    pub completed_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn is_failed(&self) -> bool {
        self.outcome == StepOutcome::Failed
    }

    /// Whether `other` describes the same step write (same run, index and
    /// fingerprint). Used to make retried appends idempotent.
    pub fn same_write(&self, other: &StepRecord) -> bool {
        self.run_id == other.run_id
            && self.index == other.index
            && self.input_fingerprint == other.input_fingerprint
    }
}

// ---------------------------------------------------------------------------
// TimerEntry
// ---------------------------------------------------------------------------

/// A pending wake-up for a suspended run.
///
/// At most one timer exists per (run, step index); re-arming replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerEntry {
    pub run_id: String,
    pub step_index: u32,
    pub wake_at: DateTime<Utc>,
    /// Set once a continuation was delivered for this timer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fired_at: Option<DateTime<Utc>>,
}

impl TimerEntry {
    pub fn new(run_id: &str, step_index: u32, wake_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.to_string(),
            step_index,
            wake_at,
            fired_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.wake_at <= now
    }
}
