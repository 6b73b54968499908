//! Workflow run types.
//!
//! A run is one durable execution of a workflow. It spans any number of HTTP
//! invocations; the run row carries the initial payload and headers so that
//! every replay sees the same inputs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix for engine-generated run identifiers.
pub const RUN_ID_PREFIX: &str = "wfr_";

/// Generate a fresh, time-sortable run identifier.
pub fn new_run_id() -> String {
    format!("{RUN_ID_PREFIX}{}", Uuid::now_v7().simple())
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created by the first trigger, not yet replayed to a boundary.
    Pending,
    /// Waiting for an external continuation (sleep, call retry, step retry).
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal runs never execute another step.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Suspended => "suspended",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "suspended" => Ok(RunStatus::Suspended),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowRun
// ---------------------------------------------------------------------------

/// A single durable execution of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Run identifier (caller supplied or `wfr_<uuidv7>`).
    pub id: String,
    /// Name of the registered workflow this run executes.
    pub workflow_name: String,
    pub status: RunStatus,
    /// Initial request payload; `None` when the trigger body was empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Initial request headers (lowercased names, engine headers removed).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Return value of the workflow once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_result: Option<serde_json::Value>,
    /// Last error for failed runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Step index at which a failed run stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<u32>,
    /// Workflow-level retries consumed so far.
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// Build a freshly triggered run in `Pending` status.
    pub fn new(
        id: String,
        workflow_name: String,
        payload: Option<serde_json::Value>,
        headers: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            workflow_name,
            status: RunStatus::Pending,
            payload,
            headers,
            final_result: None,
            error: None,
            failed_step: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A status change applied to a stored run.
///
/// Fields left as `None` keep their stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTransition {
    pub status: RunStatus,
    pub final_result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub failed_step: Option<u32>,
    pub retry_count: Option<u32>,
}

impl RunTransition {
    /// A bare status change.
    pub fn to(status: RunStatus) -> Self {
        Self {
            status,
            final_result: None,
            error: None,
            failed_step: None,
            retry_count: None,
        }
    }

    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            final_result: Some(result),
            ..Self::to(RunStatus::Completed)
        }
    }

    pub fn failed(step_index: Option<u32>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            failed_step: step_index,
            ..Self::to(RunStatus::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_roundtrips_through_str() {
        for status in [
            RunStatus::Pending,
            RunStatus::Suspended,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("running".parse::<RunStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Suspended.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }

    #[test]
    fn generated_run_ids_are_prefixed_and_unique() {
        let a = new_run_id();
        let b = new_run_id();
        assert!(a.starts_with(RUN_ID_PREFIX));
        assert_ne!(a, b);
    }

    #[test]
    fn failed_transition_carries_step_and_error() {
        let t = RunTransition::failed(Some(4), "boom");
        assert_eq!(t.status, RunStatus::Failed);
        assert_eq!(t.failed_step, Some(4));
        assert_eq!(t.error.as_deref(), Some("boom"));
        assert!(t.final_result.is_none());
    }
}
