//! Outbound call scheduler behind `context.call`.
//!
//! Each attempt is persisted as a `CallAttempt`. Any HTTP response ends the
//! step (a 401 or a 300 is a result, not a failure); only transport errors
//! are retried, up to the request's `retries`. Short backoffs are slept
//! inline, longer ones are persisted as `next_retry_at` plus a timer and the
//! run suspends. Exactly one terminal outcome is promoted into the step
//! record.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use waystation_types::call::{AttemptOutcome, CallAttempt, CallRequest, CallResult};
use waystation_types::config::CallConfig;
use waystation_types::step::{StepKind, StepOutcome, StepRecord, TimerEntry};

use super::clock::Clock;
use super::error::{CallError, StepError, SuspendReason, Suspension};
use super::ledger::StepLedger;
use super::registry::BoxFuture;
use super::retry::{Backoff, RetryPolicy};

// ---------------------------------------------------------------------------
// CallTransport
// ---------------------------------------------------------------------------

/// Sends one HTTP request. Implementations must map an absent body to `""`
/// and report anything short of a full response as a [`CallError`].
pub trait CallTransport: Send + Sync {
    fn send<'a>(&'a self, request: &'a CallRequest) -> BoxFuture<'a, Result<CallResult, CallError>>;
}

/// One call step as issued by the context.
pub struct CallStep<'a> {
    pub ledger: &'a StepLedger,
    pub index: u32,
    pub name: &'a str,
    pub fingerprint: String,
    pub request: &'a CallRequest,
    pub cancel: &'a CancellationToken,
}

// ---------------------------------------------------------------------------
// CallScheduler
// ---------------------------------------------------------------------------

pub struct CallScheduler {
    transport: Arc<dyn CallTransport>,
    clock: Arc<dyn Clock>,
    /// Attempts in flight across all runs.
    permits: Arc<Semaphore>,
    config: CallConfig,
    backoff: Backoff,
}

impl CallScheduler {
    pub fn new(transport: Arc<dyn CallTransport>, clock: Arc<dyn Clock>, config: CallConfig) -> Self {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(config.initial_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
        };
        Self {
            transport,
            clock,
            permits: Arc::new(Semaphore::new(config.max_concurrent_attempts.max(1))),
            config,
            backoff,
        }
    }

    /// Replace the backoff schedule (exponential from the config by default).
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn policy_for(&self, request: &CallRequest) -> RetryPolicy {
        RetryPolicy::new(request.retries, self.backoff.clone())
    }

    /// Drive a call step to a terminal outcome or a suspension.
    pub async fn execute(&self, step: CallStep<'_>) -> Result<CallResult, StepError> {
        let run_id = step.ledger.run_id();
        let repo = step.ledger.repo();
        let policy = self.policy_for(step.request);
        let attempts = repo.list_attempts(run_id, step.index).await?;

        // A response observed by an earlier invocation is final; never call again.
        if let Some(result) = attempts.iter().rev().find_map(|a| a.outcome.as_call_result()) {
            tracing::debug!(
                run_id,
                step_index = step.index,
                status = result.status,
                "promoting persisted call response"
            );
            return self.promote(&step, result).await;
        }

        if let Some(next_retry_at) = attempts.last().and_then(|a| a.next_retry_at) {
            if next_retry_at > self.clock.now() {
                return Err(StepError::Suspended(Suspension {
                    step_index: step.index,
                    wake_at: next_retry_at,
                    reason: SuspendReason::CallRetry,
                }));
            }
        }

        let mut attempt = attempts.len() as u32;
        let mut last_error = attempts.last().and_then(|a| match &a.outcome {
            AttemptOutcome::TransportError { message } => Some(message.clone()),
            AttemptOutcome::Response { .. } => None,
        });

        loop {
            if attempt >= policy.max_attempts() {
                let message = last_error.unwrap_or_else(|| "call retries exhausted".to_string());
                return Err(self.fail(&step, message).await);
            }
            if step.cancel.is_cancelled() || step.ledger.run_cancelled().await? {
                return Err(StepError::Cancelled);
            }

            attempt += 1;
            tracing::debug!(
                run_id,
                step_index = step.index,
                attempt,
                method = %step.request.method,
                url = %step.request.url,
                "sending call attempt"
            );

            let outcome = self.attempt(step.request).await;
            let recorded_at = self.clock.now();

            let error = match outcome {
                Ok(result) => {
                    repo.record_attempt(&CallAttempt {
                        run_id: run_id.to_string(),
                        step_index: step.index,
                        attempt,
                        outcome: AttemptOutcome::Response {
                            status: result.status,
                            headers: result.headers.clone(),
                            body: result.body.clone(),
                        },
                        next_retry_at: None,
                        recorded_at,
                    })
                    .await?;
                    return self.promote(&step, result).await;
                }
                Err(error) => error,
            };

            let message = error.to_string();
            tracing::warn!(
                run_id,
                step_index = step.index,
                attempt,
                error = %message,
                "call attempt failed"
            );

            let mut record = CallAttempt {
                run_id: run_id.to_string(),
                step_index: step.index,
                attempt,
                outcome: AttemptOutcome::TransportError {
                    message: message.clone(),
                },
                next_retry_at: None,
                recorded_at,
            };

            if !error.is_retryable() || !policy.should_retry(attempt) {
                repo.record_attempt(&record).await?;
                return Err(self.fail(&step, message).await);
            }

            let delay = policy.delay(attempt);
            if delay <= Duration::from_millis(self.config.max_inline_backoff_ms) {
                repo.record_attempt(&record).await?;
                tokio::select! {
                    _ = step.cancel.cancelled() => return Err(StepError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                last_error = Some(message);
                continue;
            }

            let wake_at = recorded_at
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
            record.next_retry_at = Some(wake_at);
            repo.record_attempt(&record).await?;
            repo.arm_timer(&TimerEntry::new(run_id, step.index, wake_at))
                .await?;

            tracing::info!(
                run_id,
                step_index = step.index,
                attempt,
                wake_at = %wake_at,
                "call backing off, suspending run"
            );
            return Err(StepError::Suspended(Suspension {
                step_index: step.index,
                wake_at,
                reason: SuspendReason::CallRetry,
            }));
        }
    }

    async fn attempt(&self, request: &CallRequest) -> Result<CallResult, CallError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CallError::Connect("call budget closed".to_string()))?;

        let timeout = Duration::from_secs(
            request
                .timeout_secs
                .unwrap_or(self.config.attempt_timeout_secs),
        );
        match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(CallError::Timeout(timeout)),
        }
    }

    /// Write the succeeded step record for a response.
    async fn promote(&self, step: &CallStep<'_>, result: CallResult) -> Result<CallResult, StepError> {
        let stored = step
            .ledger
            .append(StepRecord {
                run_id: step.ledger.run_id().to_string(),
                index: step.index,
                name: step.name.to_string(),
                kind: StepKind::Call,
                input_fingerprint: step.fingerprint.clone(),
                outcome: StepOutcome::Succeeded,
                result_body: result.body,
                result_status: Some(result.status),
                result_headers: Some(result.headers),
                completed_at: self.clock.now(),
            })
            .await?;

        Ok(CallResult {
            status: stored.result_status.unwrap_or_default(),
            headers: stored.result_headers.unwrap_or_default(),
            body: stored.result_body,
        })
    }

    /// Write the failed step record after the last transport error.
    async fn fail(&self, step: &CallStep<'_>, message: String) -> StepError {
        let record = StepRecord {
            run_id: step.ledger.run_id().to_string(),
            index: step.index,
            name: step.name.to_string(),
            kind: StepKind::Call,
            input_fingerprint: step.fingerprint.clone(),
            outcome: StepOutcome::Failed,
            result_body: message.clone(),
            result_status: None,
            result_headers: None,
            completed_at: self.clock.now(),
        };
        match step.ledger.append(record).await {
            Ok(_) => StepError::Failed {
                step_index: Some(step.index),
                message,
            },
            Err(e) => e.into(),
        }
    }
}
