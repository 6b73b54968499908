//! Deterministic replay executor.
//!
//! Runs workflow code from the top against the run's step ledger and
//! classifies how the invocation ended. It never touches run status; the
//! gateway turns the [`ReplayOutcome`] into state changes and a response.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use waystation_types::error::RepositoryError;
use waystation_types::run::WorkflowRun;

use crate::repository::ledger::BoxLedgerRepository;

use super::call::CallScheduler;
use super::clock::Clock;
use super::context::WorkflowContext;
use super::error::{DeterminismViolation, LedgerError, StepError, Suspension};
use super::ledger::StepLedger;
use super::registry::Workflow;
use super::retry::RetryPolicy;

/// How one invocation of a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    /// The workflow returned; the value is the run's final result.
    Completed(Value),
    /// A step needs a continuation at `wake_at`.
    Suspended(Suspension),
    /// A step closure failed and the run should be redelivered.
    Retry { step_index: u32, message: String },
    Failed {
        step_index: Option<u32>,
        message: String,
    },
    Cancelled,
}

pub struct ReplayExecutor {
    repo: Arc<BoxLedgerRepository>,
    calls: Arc<CallScheduler>,
    clock: Arc<dyn Clock>,
    step_retry: RetryPolicy,
}

impl ReplayExecutor {
    pub fn new(
        repo: Arc<BoxLedgerRepository>,
        calls: Arc<CallScheduler>,
        clock: Arc<dyn Clock>,
        step_retry: RetryPolicy,
    ) -> Self {
        Self {
            repo,
            calls,
            clock,
            step_retry,
        }
    }

    /// Workflow-level retry policy for failing step closures.
    pub fn step_retry(&self) -> &RetryPolicy {
        &self.step_retry
    }

    /// Replay `workflow` for `run`. Storage failures are returned as errors so
    /// the invocation can be redelivered with the ledger untouched.
    pub async fn replay(
        &self,
        run: &WorkflowRun,
        workflow: &dyn Workflow,
        cancel: CancellationToken,
    ) -> Result<ReplayOutcome, RepositoryError> {
        let ledger = match StepLedger::load(self.repo.clone(), &run.id).await {
            Ok(ledger) => ledger,
            Err(LedgerError::Repository(e)) => return Err(e),
            Err(other) => {
                return Ok(ReplayOutcome::Failed {
                    step_index: None,
                    message: other.to_string(),
                });
            }
        };

        let retries_left = self.step_retry.max_retries.saturating_sub(run.retry_count);
        let ctx = WorkflowContext::new(
            run.clone(),
            ledger,
            self.calls.clone(),
            self.clock.clone(),
            cancel,
            retries_left,
        );

        let result = workflow.run(&ctx).await;
        let outcome = classify(&ctx, result).await?;

        tracing::debug!(
            run_id = %run.id,
            workflow = %run.workflow_name,
            steps_visited = ctx.steps_visited(),
            outcome = outcome_name(&outcome),
            "replay finished"
        );
        Ok(outcome)
    }
}

async fn classify(
    ctx: &WorkflowContext,
    result: Result<Value, StepError>,
) -> Result<ReplayOutcome, RepositoryError> {
    let result = match result {
        Err(StepError::Ledger(LedgerError::Repository(e))) => return Err(e),
        other => other,
    };
    if ctx.is_cancelled() {
        return Ok(ReplayOutcome::Cancelled);
    }
    // Code that swallowed a suspension still stops here.
    if let Some(suspension) = ctx.take_suspension().await {
        return Ok(ReplayOutcome::Suspended(suspension));
    }

    let outcome = match result {
        Ok(value) => {
            let visited = ctx.steps_visited();
            let recorded = ctx.ledger().last_index().await;
            if visited < recorded {
                let violation = DeterminismViolation::LostSteps { visited, recorded };
                ReplayOutcome::Failed {
                    step_index: Some(violation.step_index()),
                    message: StepError::from(violation).to_string(),
                }
            } else {
                ReplayOutcome::Completed(value)
            }
        }
        Err(StepError::Suspended(suspension)) => ReplayOutcome::Suspended(suspension),
        Err(StepError::Execution {
            step_index,
            message,
        }) => ReplayOutcome::Retry {
            step_index,
            message,
        },
        Err(StepError::Failed {
            step_index,
            message,
        }) => ReplayOutcome::Failed {
            step_index,
            message,
        },
        Err(StepError::DeterminismViolation(violation)) => ReplayOutcome::Failed {
            step_index: Some(violation.step_index()),
            message: StepError::from(violation).to_string(),
        },
        Err(StepError::Ledger(LedgerError::RunCancelled { .. })) | Err(StepError::Cancelled) => {
            ReplayOutcome::Cancelled
        }
        Err(StepError::Ledger(e)) => ReplayOutcome::Failed {
            step_index: ledger_error_index(&e),
            message: e.to_string(),
        },
    };
    Ok(outcome)
}

fn ledger_error_index(error: &LedgerError) -> Option<u32> {
    match error {
        LedgerError::DuplicateStep { index, .. } => Some(*index),
        LedgerError::OutOfOrder { actual, .. } => Some(*actual),
        LedgerError::Corrupt { .. }
        | LedgerError::RunCancelled { .. }
        | LedgerError::Repository(_) => None,
    }
}

fn outcome_name(outcome: &ReplayOutcome) -> &'static str {
    match outcome {
        ReplayOutcome::Completed(_) => "completed",
        ReplayOutcome::Suspended(_) => "suspended",
        ReplayOutcome::Retry { .. } => "retry",
        ReplayOutcome::Failed { .. } => "failed",
        ReplayOutcome::Cancelled => "cancelled",
    }
}
