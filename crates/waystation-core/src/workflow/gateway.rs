//! Invocation gateway: the entry point for every trigger of a workflow.
//!
//! ```text
//! Start -> ValidateAuth -> ResolveRun -> Lease -> LoadLedger -> Replay
//!   Replay -> Completed -> EmitFinalResult
//!          -> Suspended -> EmitContinuation (broker, spawned)
//!          -> Retry     -> arm timer, EmitContinuation
//!          -> Failed    -> EmitFailureResult
//!          -> Cancelled -> EmitCancelled
//! ```
//!
//! A first trigger creates the run; continuations carry the run id (and a
//! resume marker) in headers. Duplicate deliveries to a finished run return
//! the stored result without executing anything.
//!
//! The run lease is renewed while a replay is in flight. If another
//! invocation takes it over anyway, the replay stops before its next step
//! and the outcome is discarded.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use waystation_types::config::EngineConfig;
use waystation_types::run::{RunStatus, RunTransition, WorkflowRun, new_run_id};
use waystation_types::step::TimerEntry;

use crate::repository::ledger::BoxLedgerRepository;

use super::call::{CallScheduler, CallTransport};
use super::clock::Clock;
use super::error::{AuthError, GatewayError, SuspendReason, Suspension};
use super::registry::{BoxFuture, Workflow, WorkflowRegistry};
use super::replay::{ReplayExecutor, ReplayOutcome};
use super::retry::{Backoff, RetryPolicy};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Selects an existing run (or names a new one).
pub const RUN_ID_HEADER: &str = "x-waystation-run-id";

/// Present on broker-delivered continuations; value is the marker.
pub const RESUME_HEADER: &str = "x-waystation-resume";

/// `sha256=<hex>` HMAC of the raw body.
pub const SIGNATURE_HEADER: &str = "x-waystation-signature";

/// Headers with this prefix are engine-internal and never reach workflow code.
pub const ENGINE_HEADER_PREFIX: &str = "x-waystation-";

/// Upper bound for the workflow-level retry backoff.
pub const MAX_STEP_RETRY_BACKOFF_SECS: u64 = 300;

const MAX_RUN_ID_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Verifies that a trigger was sent by a holder of the signing key.
pub trait RequestVerifier: Send + Sync {
    fn verify(&self, headers: &BTreeMap<String, String>, body: &[u8]) -> Result<(), AuthError>;
}

/// A request to re-trigger a suspended run at `deliver_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Continuation {
    pub run_id: String,
    pub workflow_name: String,
    pub step_index: u32,
    pub marker: String,
    pub deliver_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("continuation delivery failed: {0}")]
    Delivery(String),

    #[error("continuation rejected with status {0}")]
    Rejected(u16),
}

/// Delivers continuations. Implementations wait until `deliver_at` themselves;
/// the gateway hands continuations over on a spawned task and never awaits them.
pub trait ContinuationBroker: Send + Sync {
    fn deliver<'a>(&'a self, continuation: &'a Continuation) -> BoxFuture<'a, Result<(), BrokerError>>;
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// One trigger as received over HTTP.
#[derive(Debug, Clone, Default)]
pub struct TriggerRequest {
    pub workflow_name: String,
    /// Header names lowercased.
    pub headers: BTreeMap<String, String>,
    /// Raw body bytes (signatures are computed over these).
    pub body: Vec<u8>,
}

/// What the trigger endpoint answers.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerResponse {
    Completed {
        run_id: String,
        result: Value,
    },
    Suspended {
        run_id: String,
    },
    /// Another invocation holds the run lease.
    Busy {
        run_id: String,
    },
    Failed {
        run_id: String,
        step_index: Option<u32>,
        message: String,
    },
    Cancelled {
        run_id: String,
    },
}

impl TriggerResponse {
    pub fn run_id(&self) -> &str {
        match self {
            TriggerResponse::Completed { run_id, .. }
            | TriggerResponse::Suspended { run_id }
            | TriggerResponse::Busy { run_id }
            | TriggerResponse::Failed { run_id, .. }
            | TriggerResponse::Cancelled { run_id } => run_id,
        }
    }

    /// The stored answer for a run that already finished.
    pub fn from_terminal(run: &WorkflowRun) -> Option<Self> {
        let run_id = run.id.clone();
        match run.status {
            RunStatus::Completed => Some(TriggerResponse::Completed {
                run_id,
                result: run.final_result.clone().unwrap_or(Value::Null),
            }),
            RunStatus::Failed => Some(TriggerResponse::Failed {
                run_id,
                step_index: run.failed_step,
                message: run.error.clone().unwrap_or_default(),
            }),
            RunStatus::Cancelled => Some(TriggerResponse::Cancelled { run_id }),
            RunStatus::Pending | RunStatus::Suspended => None,
        }
    }
}

// ---------------------------------------------------------------------------
// InvocationGateway
// ---------------------------------------------------------------------------

/// Collaborators the gateway is assembled from.
pub struct GatewayParts {
    pub repo: Arc<BoxLedgerRepository>,
    pub registry: Arc<WorkflowRegistry>,
    pub transport: Arc<dyn CallTransport>,
    pub broker: Arc<dyn ContinuationBroker>,
    pub clock: Arc<dyn Clock>,
    pub verifier: Option<Arc<dyn RequestVerifier>>,
}

pub struct InvocationGateway {
    repo: Arc<BoxLedgerRepository>,
    registry: Arc<WorkflowRegistry>,
    executor: ReplayExecutor,
    broker: Arc<dyn ContinuationBroker>,
    verifier: Option<Arc<dyn RequestVerifier>>,
    clock: Arc<dyn Clock>,
    lease_ttl: chrono::Duration,
    /// How often an in-flight replay renews its lease.
    heartbeat: Duration,
    /// Prefix of every lease owner taken by this process.
    instance_id: String,
    /// Cancellation tokens of in-flight replays keyed by run id.
    in_flight: DashMap<String, CancellationToken>,
}

impl InvocationGateway {
    pub fn new(parts: GatewayParts, config: &EngineConfig) -> Self {
        let calls = Arc::new(CallScheduler::new(
            parts.transport,
            parts.clock.clone(),
            config.call.clone(),
        ));
        let step_retry = RetryPolicy::new(
            config.retries,
            Backoff::Exponential {
                base: Duration::from_millis(config.retry_backoff_ms),
                max: Duration::from_secs(MAX_STEP_RETRY_BACKOFF_SECS),
            },
        );
        let executor = ReplayExecutor::new(
            parts.repo.clone(),
            calls,
            parts.clock.clone(),
            step_retry,
        );

        Self {
            repo: parts.repo,
            registry: parts.registry,
            executor,
            broker: parts.broker,
            verifier: parts.verifier,
            clock: parts.clock,
            lease_ttl: chrono::Duration::seconds(config.lease_ttl_secs as i64),
            heartbeat: Duration::from_secs((config.lease_ttl_secs / 3).max(1)),
            instance_id: Uuid::now_v7().simple().to_string(),
            in_flight: DashMap::new(),
        }
    }

    pub fn repo(&self) -> &Arc<BoxLedgerRepository> {
        &self.repo
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    /// Handle one trigger of `request.workflow_name`.
    pub async fn invoke(&self, request: TriggerRequest) -> Result<TriggerResponse, GatewayError> {
        if let Some(verifier) = &self.verifier {
            verifier.verify(&request.headers, &request.body)?;
        }

        let workflow = self
            .registry
            .get(&request.workflow_name)
            .ok_or_else(|| GatewayError::UnknownWorkflow(request.workflow_name.clone()))?;

        let run = self.resolve_run(&request).await?;
        if let Some(done) = TriggerResponse::from_terminal(&run) {
            tracing::debug!(run_id = %run.id, status = %run.status, "trigger for finished run");
            return Ok(done);
        }

        let owner = format!("{}:{}", self.instance_id, Uuid::now_v7().simple());
        let now = self.clock.now();
        if !self
            .repo
            .try_acquire_lease(&run.id, &owner, now + self.lease_ttl, now)
            .await?
        {
            tracing::info!(run_id = %run.id, "run is busy, acknowledging without replay");
            return Ok(TriggerResponse::Busy { run_id: run.id });
        }

        let result = self.invoke_leased(&run.id, &owner, workflow.as_ref()).await;

        if let Err(e) = self.repo.release_lease(&run.id, &owner).await {
            tracing::warn!(run_id = %run.id, error = %e, "failed to release run lease");
        }
        result
    }

    async fn invoke_leased(
        &self,
        run_id: &str,
        owner: &str,
        workflow: &dyn Workflow,
    ) -> Result<TriggerResponse, GatewayError> {
        // Re-read under the lease: a previous holder may have finished the run.
        let run = self
            .repo
            .get_run(run_id)
            .await?
            .ok_or_else(|| GatewayError::RunNotFound(run_id.to_string()))?;
        if let Some(done) = TriggerResponse::from_terminal(&run) {
            return Ok(done);
        }

        let started_at = self.clock.now();
        let token = CancellationToken::new();
        let lease_lost = CancellationToken::new();
        let done = CancellationToken::new();
        self.in_flight.insert(run.id.clone(), token.clone());
        let (outcome, ()) = tokio::join!(
            async {
                let outcome = self.executor.replay(&run, workflow, token.clone()).await;
                done.cancel();
                outcome
            },
            self.hold_lease(&run.id, owner, &token, &lease_lost, &done),
        );
        self.in_flight.remove(&run.id);

        if lease_lost.is_cancelled() {
            tracing::warn!(run_id = %run.id, "run lease lost mid-replay, outcome discarded");
            return Ok(TriggerResponse::Busy { run_id: run.id });
        }

        let outcome = if token.is_cancelled() {
            ReplayOutcome::Cancelled
        } else {
            outcome?
        };
        let response = self.emit(&run, outcome).await?;

        self.repo.fire_due_timers(&run.id, started_at).await?;
        Ok(response)
    }

    /// Renew the run lease every `heartbeat` until `done` fires. If another
    /// owner took the lease, trip `lost` and `stop` and return.
    async fn hold_lease(
        &self,
        run_id: &str,
        owner: &str,
        stop: &CancellationToken,
        lost: &CancellationToken,
        done: &CancellationToken,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = done.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let now = self.clock.now();
            match self
                .repo
                .try_acquire_lease(run_id, owner, now + self.lease_ttl, now)
                .await
            {
                Ok(true) => tracing::trace!(run_id, "renewed run lease"),
                Ok(false) => {
                    tracing::warn!(run_id, "run lease taken over, stopping replay");
                    lost.cancel();
                    stop.cancel();
                    return;
                }
                Err(e) => tracing::warn!(run_id, error = %e, "failed to renew run lease"),
            }
        }
    }

    /// Apply `transition` unless the run already finished, e.g. cancelled by
    /// another process. Returns the stored answer in that case.
    async fn transition(
        &self,
        run_id: &str,
        transition: &RunTransition,
        now: DateTime<Utc>,
    ) -> Result<Option<TriggerResponse>, GatewayError> {
        if self.repo.update_run(run_id, transition, now).await? {
            return Ok(None);
        }
        let run = self
            .repo
            .get_run(run_id)
            .await?
            .ok_or_else(|| GatewayError::RunNotFound(run_id.to_string()))?;
        tracing::info!(run_id, status = %run.status, "run finished elsewhere, keeping stored status");
        Ok(TriggerResponse::from_terminal(&run))
    }

    /// Persist the outcome and build the response.
    async fn emit(
        &self,
        run: &WorkflowRun,
        outcome: ReplayOutcome,
    ) -> Result<TriggerResponse, GatewayError> {
        let now = self.clock.now();
        let run_id = run.id.clone();

        match outcome {
            ReplayOutcome::Completed(result) => {
                let transition = RunTransition::completed(result.clone());
                if let Some(done) = self.transition(&run.id, &transition, now).await? {
                    return Ok(done);
                }
                self.repo.disarm_timers(&run.id).await?;
                tracing::info!(run_id = %run.id, workflow = %run.workflow_name, "run completed");
                Ok(TriggerResponse::Completed { run_id, result })
            }
            ReplayOutcome::Suspended(suspension) => {
                let transition = RunTransition::to(RunStatus::Suspended);
                if let Some(done) = self.transition(&run.id, &transition, now).await? {
                    return Ok(done);
                }
                self.schedule_continuation(run, &suspension);
                Ok(TriggerResponse::Suspended { run_id })
            }
            ReplayOutcome::Retry {
                step_index,
                message,
            } => {
                let retry_count = run.retry_count + 1;
                let delay = self.executor.step_retry().delay(retry_count);
                let wake_at = now
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(MAX_STEP_RETRY_BACKOFF_SECS as i64));

                let transition = RunTransition {
                    error: Some(message),
                    retry_count: Some(retry_count),
                    ..RunTransition::to(RunStatus::Suspended)
                };
                if let Some(done) = self.transition(&run.id, &transition, now).await? {
                    return Ok(done);
                }
                self.repo
                    .arm_timer(&TimerEntry::new(&run.id, step_index, wake_at))
                    .await?;

                tracing::info!(
                    run_id = %run.id,
                    step_index,
                    retry_count,
                    wake_at = %wake_at,
                    "step failed, retry scheduled"
                );
                self.schedule_continuation(
                    run,
                    &Suspension {
                        step_index,
                        wake_at,
                        reason: SuspendReason::StepRetry,
                    },
                );
                Ok(TriggerResponse::Suspended { run_id })
            }
            ReplayOutcome::Failed {
                step_index,
                message,
            } => {
                let transition = RunTransition::failed(step_index, message.clone());
                if let Some(done) = self.transition(&run.id, &transition, now).await? {
                    return Ok(done);
                }
                self.repo.disarm_timers(&run.id).await?;
                tracing::warn!(
                    run_id = %run.id,
                    workflow = %run.workflow_name,
                    step_index = ?step_index,
                    error = %message,
                    "run failed"
                );
                Ok(TriggerResponse::Failed {
                    run_id,
                    step_index,
                    message,
                })
            }
            ReplayOutcome::Cancelled => {
                let transition = RunTransition::to(RunStatus::Cancelled);
                if let Some(done) = self.transition(&run.id, &transition, now).await? {
                    return Ok(done);
                }
                self.repo.disarm_timers(&run.id).await?;
                tracing::info!(run_id = %run.id, "run cancelled");
                Ok(TriggerResponse::Cancelled { run_id })
            }
        }
    }

    fn schedule_continuation(&self, run: &WorkflowRun, suspension: &Suspension) {
        let continuation = Continuation {
            run_id: run.id.clone(),
            workflow_name: run.workflow_name.clone(),
            step_index: suspension.step_index,
            marker: suspension.marker(),
            deliver_at: suspension.wake_at,
        };
        tracing::debug!(
            run_id = %continuation.run_id,
            marker = %continuation.marker,
            deliver_at = %continuation.deliver_at,
            "scheduling continuation"
        );

        let broker = Arc::clone(&self.broker);
        tokio::spawn(async move {
            if let Err(e) = broker.deliver(&continuation).await {
                // The sweeper redelivers from the timer table.
                tracing::warn!(
                    run_id = %continuation.run_id,
                    marker = %continuation.marker,
                    error = %e,
                    "continuation delivery failed"
                );
            }
        });
    }

    // -----------------------------------------------------------------------
    // Run resolution
    // -----------------------------------------------------------------------

    async fn resolve_run(&self, request: &TriggerRequest) -> Result<WorkflowRun, GatewayError> {
        let run_id = request
            .headers
            .get(RUN_ID_HEADER)
            .map(|id| id.trim())
            .filter(|id| !id.is_empty());
        let resuming = request.headers.contains_key(RESUME_HEADER);

        let Some(run_id) = run_id else {
            if resuming {
                return Err(GatewayError::InvalidRequest(format!(
                    "{RESUME_HEADER} requires {RUN_ID_HEADER}"
                )));
            }
            return self.create_run(new_run_id(), request).await;
        };

        if let Some(run) = self.repo.get_run(run_id).await? {
            if run.workflow_name != request.workflow_name {
                return Err(GatewayError::WorkflowMismatch {
                    run_id: run.id,
                    expected: run.workflow_name,
                    actual: request.workflow_name.clone(),
                });
            }
            if resuming {
                tracing::debug!(
                    run_id,
                    marker = request.headers.get(RESUME_HEADER).map(String::as_str).unwrap_or(""),
                    "continuation received"
                );
            }
            return Ok(run);
        }

        if resuming {
            return Err(GatewayError::RunNotFound(run_id.to_string()));
        }
        validate_run_id(run_id)?;
        self.create_run(run_id.to_string(), request).await
    }

    async fn create_run(
        &self,
        run_id: String,
        request: &TriggerRequest,
    ) -> Result<WorkflowRun, GatewayError> {
        let run = WorkflowRun::new(
            run_id,
            request.workflow_name.clone(),
            parse_payload(&request.body),
            initial_headers(&request.headers),
            self.clock.now(),
        );

        if self.repo.create_run(&run).await? {
            tracing::info!(run_id = %run.id, workflow = %run.workflow_name, "created run");
            return Ok(run);
        }

        // Lost a creation race to a concurrent first trigger.
        self.repo
            .get_run(&run.id)
            .await?
            .ok_or_else(|| GatewayError::RunNotFound(run.id.clone()))
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Cancel a run: mark it cancelled, disarm its timers and stop an
    /// in-flight replay before its next step. Finished runs are returned as-is.
    pub async fn cancel(&self, run_id: &str) -> Result<WorkflowRun, GatewayError> {
        let run = self
            .repo
            .get_run(run_id)
            .await?
            .ok_or_else(|| GatewayError::RunNotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let applied = self
            .repo
            .update_run(run_id, &RunTransition::to(RunStatus::Cancelled), self.clock.now())
            .await?;
        if applied {
            let disarmed = self.repo.disarm_timers(run_id).await?;
            if let Some(token) = self.in_flight.get(run_id) {
                token.cancel();
            }
            tracing::info!(run_id, disarmed, "cancelled run");
        }

        self.repo
            .get_run(run_id)
            .await?
            .ok_or_else(|| GatewayError::RunNotFound(run_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Empty body -> `None`; JSON text -> that value; anything else -> raw string.
pub fn parse_payload(body: &[u8]) -> Option<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => Some(value),
        Err(_) => Some(Value::String(String::from_utf8_lossy(body).into_owned())),
    }
}

/// Request headers minus engine-internal ones, names lowercased.
pub fn initial_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .filter(|(name, _)| !name.starts_with(ENGINE_HEADER_PREFIX))
        .collect()
}

fn validate_run_id(run_id: &str) -> Result<(), GatewayError> {
    let valid = run_id.len() <= MAX_RUN_ID_LEN
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(GatewayError::InvalidRequest(format!(
            "invalid run id '{run_id}'"
        )))
    }
}
