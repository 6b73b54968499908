//! The handle workflow code uses to issue steps.
//!
//! Every step (`run`, `call`, `sleep`, `sleep_until`) takes the next index
//! from an explicit counter, so indices depend only on the order in which
//! the code issues steps. At an index the ledger already holds, the step's
//! kind, name and input fingerprint are checked against the record and the
//! stored result is returned without running anything. Past the end of the
//! ledger the step executes for real and its result is appended.
//!
//! Steps must be awaited one at a time; issuing them concurrently makes
//! index assignment depend on completion order.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use waystation_types::call::{CallRequest, CallResult};
use waystation_types::run::WorkflowRun;
use waystation_types::step::{StepKind, StepOutcome, StepRecord};

use super::call::{CallScheduler, CallStep};
use super::clock::Clock;
use super::error::{DeterminismViolation, StepError, Suspension};
use super::fingerprint::fingerprint;
use super::ledger::StepLedger;
use super::timer::{DurableTimer, SleepStep, SleepTarget};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum serialized size of a generic step result (1 MB).
pub const MAX_STEP_RESULT_SIZE: usize = 1_048_576;

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

pub struct WorkflowContext {
    run: WorkflowRun,
    ledger: StepLedger,
    calls: Arc<CallScheduler>,
    timer: DurableTimer,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    /// Workflow-level retries this invocation may still request.
    step_retries_left: u32,
    cursor: AtomicU32,
    /// Set by the first step that suspends; later steps refuse to run.
    suspension: Mutex<Option<Suspension>>,
}

impl WorkflowContext {
    pub(crate) fn new(
        run: WorkflowRun,
        ledger: StepLedger,
        calls: Arc<CallScheduler>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
        step_retries_left: u32,
    ) -> Self {
        Self {
            run,
            ledger,
            calls,
            timer: DurableTimer::new(clock.clone()),
            clock,
            cancel,
            step_retries_left,
            cursor: AtomicU32::new(0),
            suspension: Mutex::new(None),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run.id
    }

    pub fn workflow_name(&self) -> &str {
        &self.run.workflow_name
    }

    /// Payload of the request that created the run, identical on every replay.
    pub fn request_payload(&self) -> Option<&Value> {
        self.run.payload.as_ref()
    }

    /// Headers of the request that created the run (lowercase names).
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.run.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.run
            .headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Current time as seen by the engine. Not a step: do not branch on it.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of step indices issued so far in this invocation.
    pub fn steps_visited(&self) -> u32 {
        self.cursor.load(Ordering::SeqCst)
    }

    pub(crate) fn ledger(&self) -> &StepLedger {
        &self.ledger
    }

    pub(crate) async fn take_suspension(&self) -> Option<Suspension> {
        self.suspension.lock().await.take()
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Run a local step once and record its JSON-serialized result.
    ///
    /// On replay the closure is not called. If the closure fails and
    /// workflow-level retries remain, the run is suspended and redelivered;
    /// otherwise a failed record is written and the run fails.
    pub async fn run<T, E, F, Fut>(&self, name: &str, step: F) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned + Send,
        E: fmt::Display + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let index = self.begin_step().await?;
        let input_fingerprint = fingerprint(StepKind::Generic, name, &Value::Null);

        if let Some(record) = self
            .replayed(index, StepKind::Generic, name, &input_fingerprint)
            .await?
        {
            return serde_json::from_str(&record.result_body).map_err(|e| {
                DeterminismViolation::ResultDecode {
                    index,
                    message: e.to_string(),
                }
                .into()
            });
        }

        self.ensure_active().await?;
        tracing::debug!(run_id = %self.run.id, step_index = index, step = name, "executing step");

        let outcome = step().await.map_err(|e| e.to_string());
        let value = match outcome {
            Ok(value) => value,
            Err(message) => {
                return Err(self
                    .fail_step(index, StepKind::Generic, name, input_fingerprint, message)
                    .await);
            }
        };

        let body = match serde_json::to_string(&value) {
            Ok(body) if body.len() <= MAX_STEP_RESULT_SIZE => body,
            Ok(body) => {
                let message = format!(
                    "step result is {} bytes, limit is {MAX_STEP_RESULT_SIZE}",
                    body.len()
                );
                return Err(self
                    .fail_step(index, StepKind::Generic, name, input_fingerprint, message)
                    .await);
            }
            Err(e) => {
                let message = format!("step result is not serializable: {e}");
                return Err(self
                    .fail_step(index, StepKind::Generic, name, input_fingerprint, message)
                    .await);
            }
        };

        self.ledger
            .append(self.record(index, StepKind::Generic, name, input_fingerprint, body))
            .await?;
        Ok(value)
    }

    /// Perform an outbound HTTP call through the call scheduler.
    ///
    /// Any HTTP response (2xx..5xx) is the step result. Only transport
    /// failures are retried, up to `request.retries` times.
    pub async fn call(&self, name: &str, request: CallRequest) -> Result<CallResult, StepError> {
        let index = self.begin_step().await?;
        let input_fingerprint = fingerprint(StepKind::Call, name, &call_input(&request));

        if let Some(record) = self
            .replayed(index, StepKind::Call, name, &input_fingerprint)
            .await?
        {
            return Ok(CallResult {
                status: record.result_status.unwrap_or_default(),
                headers: record.result_headers.unwrap_or_default(),
                body: record.result_body,
            });
        }

        self.ensure_active().await?;

        let step = CallStep {
            ledger: &self.ledger,
            index,
            name,
            fingerprint: input_fingerprint,
            request: &request,
            cancel: &self.cancel,
        };
        match self.calls.execute(step).await {
            Err(StepError::Suspended(s)) => Err(self.suspend(s).await),
            other => other,
        }
    }

    /// Durable sleep. Suspends the run until `duration` has elapsed.
    pub async fn sleep(&self, name: &str, duration: Duration) -> Result<(), StepError> {
        let input = json!({ "duration_ms": u64::try_from(duration.as_millis()).unwrap_or(u64::MAX) });
        self.sleep_step(name, input, SleepTarget::For(duration)).await
    }

    /// Durable sleep until an absolute time. A time in the past resolves at once.
    pub async fn sleep_until(&self, name: &str, until: DateTime<Utc>) -> Result<(), StepError> {
        let input = json!({ "until": until.to_rfc3339() });
        self.sleep_step(name, input, SleepTarget::Until(until)).await
    }

    async fn sleep_step(
        &self,
        name: &str,
        input: Value,
        target: SleepTarget,
    ) -> Result<(), StepError> {
        let index = self.begin_step().await?;
        let input_fingerprint = fingerprint(StepKind::Sleep, name, &input);
        let recorded = self
            .replayed(index, StepKind::Sleep, name, &input_fingerprint)
            .await?;
        if recorded.is_none() {
            self.ensure_active().await?;
        }

        let step = SleepStep {
            index,
            name,
            fingerprint: input_fingerprint,
            recorded,
            target,
        };
        match self.timer.sleep(&self.ledger, step).await {
            Err(StepError::Suspended(s)) => Err(self.suspend(s).await),
            other => other,
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn begin_step(&self) -> Result<u32, StepError> {
        if let Some(pending) = self.suspension.lock().await.clone() {
            return Err(StepError::Suspended(pending));
        }
        Ok(self.cursor.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn suspend(&self, suspension: Suspension) -> StepError {
        let mut slot = self.suspension.lock().await;
        if slot.is_none() {
            *slot = Some(suspension.clone());
        }
        StepError::Suspended(suspension)
    }

    /// Refuse to execute a new step once the run is cancelled, either through
    /// this process's token or by a status change made elsewhere.
    async fn ensure_active(&self) -> Result<(), StepError> {
        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        if self.ledger.run_cancelled().await? {
            tracing::info!(run_id = %self.run.id, "run cancelled elsewhere, stopping replay");
            self.cancel.cancel();
            return Err(StepError::Cancelled);
        }
        Ok(())
    }

    /// Look up the record at `index` and verify it belongs to this step.
    async fn replayed(
        &self,
        index: u32,
        kind: StepKind,
        name: &str,
        input_fingerprint: &str,
    ) -> Result<Option<StepRecord>, StepError> {
        let Some(record) = self.ledger.get(index).await else {
            return Ok(None);
        };

        if record.kind != kind {
            return Err(DeterminismViolation::KindMismatch {
                index,
                expected: record.kind,
                actual: kind,
            }
            .into());
        }
        if record.name != name {
            return Err(DeterminismViolation::NameMismatch {
                index,
                expected: record.name,
                actual: name.to_string(),
            }
            .into());
        }
        if record.input_fingerprint != input_fingerprint {
            return Err(DeterminismViolation::InputMismatch {
                index,
                name: name.to_string(),
            }
            .into());
        }
        if record.is_failed() {
            return Err(StepError::Failed {
                step_index: Some(index),
                message: record.result_body,
            });
        }

        tracing::trace!(run_id = %self.run.id, step_index = index, step = name, "replayed step");
        Ok(Some(record))
    }

    async fn fail_step(
        &self,
        index: u32,
        kind: StepKind,
        name: &str,
        input_fingerprint: String,
        message: String,
    ) -> StepError {
        if self.step_retries_left > 0 {
            tracing::warn!(
                run_id = %self.run.id,
                step_index = index,
                step = name,
                retries_left = self.step_retries_left,
                error = %message,
                "step failed, run will be retried"
            );
            return StepError::Execution {
                step_index: index,
                message,
            };
        }

        let mut record = self.record(index, kind, name, input_fingerprint, message.clone());
        record.outcome = StepOutcome::Failed;
        match self.ledger.append(record).await {
            Ok(_) => StepError::Failed {
                step_index: Some(index),
                message,
            },
            Err(e) => e.into(),
        }
    }

    fn record(
        &self,
        index: u32,
        kind: StepKind,
        name: &str,
        input_fingerprint: String,
        result_body: String,
    ) -> StepRecord {
        StepRecord {
            run_id: self.run.id.clone(),
            index,
            name: name.to_string(),
            kind,
            input_fingerprint,
            outcome: StepOutcome::Succeeded,
            result_body,
            result_status: None,
            result_headers: None,
            completed_at: self.clock.now(),
        }
    }
}

/// The parts of a call request that identify the step. Retry settings are
/// left out so tuning them does not invalidate recorded runs.
fn call_input(request: &CallRequest) -> Value {
    json!({
        "url": request.url,
        "method": request.method,
        "headers": request.headers,
        "body": request.body,
    })
}
