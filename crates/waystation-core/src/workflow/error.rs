//! Engine error taxonomy.
//!
//! One enum per concern: [`LedgerError`] for ledger appends,
//! [`DeterminismViolation`] for replay mismatches, [`CallError`] for
//! transports, [`AuthError`] for trigger verification, [`StepError`] for what
//! workflow code sees, and [`GatewayError`] for what the HTTP layer sees.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use waystation_types::error::RepositoryError;
use waystation_types::step::StepKind;

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Errors from appending to or loading a step ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A different step was already recorded at this index.
    #[error(
        "duplicate step {index} for run {run_id}: stored fingerprint '{stored}', attempted '{attempted}'"
    )]
    DuplicateStep {
        run_id: String,
        index: u32,
        stored: String,
        attempted: String,
    },

    #[error("out-of-order append for run {run_id}: expected index {expected}, got {actual}")]
    OutOfOrder {
        run_id: String,
        expected: u32,
        actual: u32,
    },

    /// Stored records are not a gap-free 1..n sequence.
    #[error("corrupt ledger for run {run_id}: {message}")]
    Corrupt { run_id: String, message: String },

    /// The run was cancelled, possibly by another process; nothing more is
    /// recorded for it.
    #[error("run {run_id} was cancelled")]
    RunCancelled { run_id: String },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Determinism
// ---------------------------------------------------------------------------

/// The workflow code no longer visits the steps the ledger recorded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeterminismViolation {
    #[error("step {index}: expected kind '{expected}', code issued '{actual}'")]
    KindMismatch {
        index: u32,
        expected: StepKind,
        actual: StepKind,
    },

    #[error("step {index}: expected name '{expected}', code issued '{actual}'")]
    NameMismatch {
        index: u32,
        expected: String,
        actual: String,
    },

    #[error("step {index} ('{name}'): input differs from the recorded input")]
    InputMismatch { index: u32, name: String },

    #[error("step {index}: recorded result cannot be decoded: {message}")]
    ResultDecode { index: u32, message: String },

    #[error("workflow returned after {visited} steps but the ledger holds {recorded}")]
    LostSteps { visited: u32, recorded: u32 },
}

impl DeterminismViolation {
    /// Ledger index the violation was detected at.
    pub fn step_index(&self) -> u32 {
        match self {
            DeterminismViolation::KindMismatch { index, .. }
            | DeterminismViolation::NameMismatch { index, .. }
            | DeterminismViolation::InputMismatch { index, .. }
            | DeterminismViolation::ResultDecode { index, .. } => *index,
            DeterminismViolation::LostSteps { visited, .. } => visited + 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Suspension
// ---------------------------------------------------------------------------

/// Why a run stopped and waits for a continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    Sleep,
    CallRetry,
    StepRetry,
}

impl SuspendReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspendReason::Sleep => "sleep",
            SuspendReason::CallRetry => "call-retry",
            SuspendReason::StepRetry => "retry",
        }
    }
}

/// A suspension point: the run resumes at `step_index` once `wake_at` passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suspension {
    pub step_index: u32,
    pub wake_at: DateTime<Utc>,
    pub reason: SuspendReason,
}

impl Suspension {
    /// Marker carried by the continuation, e.g. `sleep:3`.
    pub fn marker(&self) -> String {
        format!("{}:{}", self.reason.as_str(), self.step_index)
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Errors surfaced to workflow code by `WorkflowContext` operations.
///
/// Workflow code propagates these with `?`; the replay executor classifies
/// the one that reaches it.
#[derive(Debug, Error)]
pub enum StepError {
    /// Control flow, not a failure: the run must wait for a continuation.
    #[error("run suspended at step {} ({})", .0.step_index, .0.reason.as_str())]
    Suspended(Suspension),

    /// A step closure failed and workflow-level retries remain.
    #[error("step {step_index} execution failed: {message}")]
    Execution { step_index: u32, message: String },

    /// Terminal failure of a step (or of the workflow when `step_index` is `None`).
    #[error("{}", failed_display(.step_index, .message))]
    Failed {
        step_index: Option<u32>,
        message: String,
    },

    #[error("determinism violation: {0}")]
    DeterminismViolation(#[from] DeterminismViolation),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("run cancelled")]
    Cancelled,
}

fn failed_display(step_index: &Option<u32>, message: &str) -> String {
    match step_index {
        Some(index) => format!("step {index} failed: {message}"),
        None => format!("workflow failed: {message}"),
    }
}

impl StepError {
    /// Fail the run from workflow code without tying it to a step.
    pub fn abort(message: impl Into<String>) -> Self {
        StepError::Failed {
            step_index: None,
            message: message.into(),
        }
    }
}

impl From<RepositoryError> for StepError {
    fn from(e: RepositoryError) -> Self {
        StepError::Ledger(LedgerError::Repository(e))
    }
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

/// Transport-level failure of one call attempt (no HTTP response observed).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to read response body: {0}")]
    Body(String),

    /// The request itself is unusable (bad URL, bad method). Never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl CallError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CallError::InvalidRequest(_))
    }
}

// ---------------------------------------------------------------------------
// Auth / Gateway
// ---------------------------------------------------------------------------

/// Trigger authentication failures. Rejected before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing signature header")]
    MissingSignature,

    #[error("malformed signature: {0}")]
    Malformed(String),

    #[error("signature mismatch")]
    Mismatch,
}

/// Errors returned by the invocation gateway to its HTTP surface.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized: {0}")]
    Auth(#[from] AuthError),

    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    #[error("workflow run '{0}' not found")]
    RunNotFound(String),

    #[error("run '{run_id}' belongs to workflow '{expected}', not '{actual}'")]
    WorkflowMismatch {
        run_id: String,
        expected: String,
        actual: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Repository(#[from] RepositoryError),
}
