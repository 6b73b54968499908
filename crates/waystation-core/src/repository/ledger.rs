//! Ledger repository trait definition.
//!
//! Defines the storage interface for workflow runs, step records, call
//! attempts, timers and run leases. The infrastructure layer
//! (waystation-infra) implements this trait with SQLite persistence;
//! [`super::memory::InMemoryLedgerRepository`] backs tests and embedding.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use waystation_types::call::CallAttempt;
use waystation_types::error::RepositoryError;
use waystation_types::run::{RunTransition, WorkflowRun};
use waystation_types::step::{StepRecord, TimerEntry};

/// Result of an insert-if-absent step append.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// The record was written.
    Inserted,
    /// A record already existed at that (run, index); it is returned unchanged.
    Existing(StepRecord),
}

/// A due timer joined with the workflow it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct DueTimer {
    pub timer: TimerEntry,
    pub workflow_name: String,
}

/// Repository trait for the durable step ledger.
///
/// Covers four entity families:
/// - **Runs:** create/query runs and apply status transitions, plus the run lease.
/// - **Steps:** insert-if-absent step records (never updated).
/// - **Attempts:** per-attempt log of outbound calls.
/// - **Timers:** armed wake-ups for suspended runs.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait LedgerRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a run. Returns `false` if a run with that id already exists.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    fn get_run(
        &self,
        run_id: &str,
    ) -> impl Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Apply a status transition unless the run is already terminal.
    ///
    /// Returns `false` (and changes nothing) when the run is completed,
    /// failed or cancelled. `NotFound` if the run does not exist.
    fn update_run(
        &self,
        run_id: &str,
        transition: &RunTransition,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// List runs ordered by `created_at` DESC, optionally for one workflow.
    fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Take the run lease if it is free, expired, or already held by `owner`.
    /// Calling it again as the holder extends the lease to `until`.
    fn try_acquire_lease(
        &self,
        run_id: &str,
        owner: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Release the lease if `owner` still holds it.
    fn release_lease(
        &self,
        run_id: &str,
        owner: &str,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Insert a step record unless one exists at the same (run, index).
    fn append_step(
        &self,
        record: &StepRecord,
    ) -> impl Future<Output = Result<AppendOutcome, RepositoryError>> + Send;

    fn get_step(
        &self,
        run_id: &str,
        index: u32,
    ) -> impl Future<Output = Result<Option<StepRecord>, RepositoryError>> + Send;

    /// All step records of a run ordered by index ASC.
    fn list_steps(
        &self,
        run_id: &str,
    ) -> impl Future<Output = Result<Vec<StepRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Call attempts
    // -----------------------------------------------------------------------

    fn record_attempt(
        &self,
        attempt: &CallAttempt,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Attempts of one call step ordered by attempt number ASC.
    fn list_attempts(
        &self,
        run_id: &str,
        step_index: u32,
    ) -> impl Future<Output = Result<Vec<CallAttempt>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Arm a timer, replacing any timer at the same (run, step index).
    fn arm_timer(
        &self,
        timer: &TimerEntry,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Unfired timers of suspended runs with `wake_at <= before`, oldest first.
    fn list_due_timers(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<DueTimer>, RepositoryError>> + Send;

    /// Mark every unfired timer of the run with `wake_at <= now` as fired.
    fn fire_due_timers(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, RepositoryError>> + Send;

    /// Delete all timers of a run. Returns how many were removed.
    fn disarm_timers(
        &self,
        run_id: &str,
    ) -> impl Future<Output = Result<u64, RepositoryError>> + Send;
}

// ---------------------------------------------------------------------------
// BoxLedgerRepository
// ---------------------------------------------------------------------------

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, RepositoryError>> + Send + 'a>>;

/// Object-safe version of [`LedgerRepository`] with boxed futures.
///
/// A blanket implementation is provided for all types implementing
/// `LedgerRepository`.
pub trait LedgerRepositoryDyn: Send + Sync {
    fn create_run_boxed<'a>(&'a self, run: &'a WorkflowRun) -> BoxFut<'a, bool>;
    fn get_run_boxed<'a>(&'a self, run_id: &'a str) -> BoxFut<'a, Option<WorkflowRun>>;
    fn update_run_boxed<'a>(
        &'a self,
        run_id: &'a str,
        transition: &'a RunTransition,
        now: DateTime<Utc>,
    ) -> BoxFut<'a, bool>;
    fn list_runs_boxed<'a>(
        &'a self,
        workflow_name: Option<&'a str>,
        limit: u32,
    ) -> BoxFut<'a, Vec<WorkflowRun>>;
    fn try_acquire_lease_boxed<'a>(
        &'a self,
        run_id: &'a str,
        owner: &'a str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BoxFut<'a, bool>;
    fn release_lease_boxed<'a>(&'a self, run_id: &'a str, owner: &'a str) -> BoxFut<'a, ()>;
    fn append_step_boxed<'a>(&'a self, record: &'a StepRecord) -> BoxFut<'a, AppendOutcome>;
    fn get_step_boxed<'a>(&'a self, run_id: &'a str, index: u32)
    -> BoxFut<'a, Option<StepRecord>>;
    fn list_steps_boxed<'a>(&'a self, run_id: &'a str) -> BoxFut<'a, Vec<StepRecord>>;
    fn record_attempt_boxed<'a>(&'a self, attempt: &'a CallAttempt) -> BoxFut<'a, ()>;
    fn list_attempts_boxed<'a>(
        &'a self,
        run_id: &'a str,
        step_index: u32,
    ) -> BoxFut<'a, Vec<CallAttempt>>;
    fn arm_timer_boxed<'a>(&'a self, timer: &'a TimerEntry) -> BoxFut<'a, ()>;
    fn list_due_timers_boxed(&self, before: DateTime<Utc>, limit: u32)
    -> BoxFut<'_, Vec<DueTimer>>;
    fn fire_due_timers_boxed<'a>(&'a self, run_id: &'a str, now: DateTime<Utc>)
    -> BoxFut<'a, u64>;
    fn disarm_timers_boxed<'a>(&'a self, run_id: &'a str) -> BoxFut<'a, u64>;
}

impl<T: LedgerRepository> LedgerRepositoryDyn for T {
    fn create_run_boxed<'a>(&'a self, run: &'a WorkflowRun) -> BoxFut<'a, bool> {
        Box::pin(self.create_run(run))
    }

    fn get_run_boxed<'a>(&'a self, run_id: &'a str) -> BoxFut<'a, Option<WorkflowRun>> {
        Box::pin(self.get_run(run_id))
    }

    fn update_run_boxed<'a>(
        &'a self,
        run_id: &'a str,
        transition: &'a RunTransition,
        now: DateTime<Utc>,
    ) -> BoxFut<'a, bool> {
        Box::pin(self.update_run(run_id, transition, now))
    }

    fn list_runs_boxed<'a>(
        &'a self,
        workflow_name: Option<&'a str>,
        limit: u32,
    ) -> BoxFut<'a, Vec<WorkflowRun>> {
        Box::pin(self.list_runs(workflow_name, limit))
    }

    fn try_acquire_lease_boxed<'a>(
        &'a self,
        run_id: &'a str,
        owner: &'a str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BoxFut<'a, bool> {
        Box::pin(self.try_acquire_lease(run_id, owner, until, now))
    }

    fn release_lease_boxed<'a>(&'a self, run_id: &'a str, owner: &'a str) -> BoxFut<'a, ()> {
        Box::pin(self.release_lease(run_id, owner))
    }

    fn append_step_boxed<'a>(&'a self, record: &'a StepRecord) -> BoxFut<'a, AppendOutcome> {
        Box::pin(self.append_step(record))
    }

    fn get_step_boxed<'a>(
        &'a self,
        run_id: &'a str,
        index: u32,
    ) -> BoxFut<'a, Option<StepRecord>> {
        Box::pin(self.get_step(run_id, index))
    }

    fn list_steps_boxed<'a>(&'a self, run_id: &'a str) -> BoxFut<'a, Vec<StepRecord>> {
        Box::pin(self.list_steps(run_id))
    }

    fn record_attempt_boxed<'a>(&'a self, attempt: &'a CallAttempt) -> BoxFut<'a, ()> {
        Box::pin(self.record_attempt(attempt))
    }

    fn list_attempts_boxed<'a>(
        &'a self,
        run_id: &'a str,
        step_index: u32,
    ) -> BoxFut<'a, Vec<CallAttempt>> {
        Box::pin(self.list_attempts(run_id, step_index))
    }

    fn arm_timer_boxed<'a>(&'a self, timer: &'a TimerEntry) -> BoxFut<'a, ()> {
        Box::pin(self.arm_timer(timer))
    }

    fn list_due_timers_boxed(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> BoxFut<'_, Vec<DueTimer>> {
        Box::pin(self.list_due_timers(before, limit))
    }

    fn fire_due_timers_boxed<'a>(
        &'a self,
        run_id: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFut<'a, u64> {
        Box::pin(self.fire_due_timers(run_id, now))
    }

    fn disarm_timers_boxed<'a>(&'a self, run_id: &'a str) -> BoxFut<'a, u64> {
        Box::pin(self.disarm_timers(run_id))
    }
}

/// Type-erased ledger repository.
///
/// `LedgerRepository` uses RPITIT and cannot be a trait object directly; the
/// engine holds an `Arc<BoxLedgerRepository>` so that one gateway can run on
/// SQLite in production and on the in-memory store in tests.
pub struct BoxLedgerRepository {
    inner: Box<dyn LedgerRepositoryDyn>,
}

impl BoxLedgerRepository {
    pub fn new<T: LedgerRepository + 'static>(repo: T) -> Self {
        Self {
            inner: Box::new(repo),
        }
    }

    pub async fn create_run(&self, run: &WorkflowRun) -> Result<bool, RepositoryError> {
        self.inner.create_run_boxed(run).await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, RepositoryError> {
        self.inner.get_run_boxed(run_id).await
    }

    pub async fn update_run(
        &self,
        run_id: &str,
        transition: &RunTransition,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.inner.update_run_boxed(run_id, transition, now).await
    }

    pub async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        self.inner.list_runs_boxed(workflow_name, limit).await
    }

    pub async fn try_acquire_lease(
        &self,
        run_id: &str,
        owner: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.inner
            .try_acquire_lease_boxed(run_id, owner, until, now)
            .await
    }

    pub async fn release_lease(&self, run_id: &str, owner: &str) -> Result<(), RepositoryError> {
        self.inner.release_lease_boxed(run_id, owner).await
    }

    pub async fn append_step(&self, record: &StepRecord) -> Result<AppendOutcome, RepositoryError> {
        self.inner.append_step_boxed(record).await
    }

    pub async fn get_step(
        &self,
        run_id: &str,
        index: u32,
    ) -> Result<Option<StepRecord>, RepositoryError> {
        self.inner.get_step_boxed(run_id, index).await
    }

    pub async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, RepositoryError> {
        self.inner.list_steps_boxed(run_id).await
    }

    pub async fn record_attempt(&self, attempt: &CallAttempt) -> Result<(), RepositoryError> {
        self.inner.record_attempt_boxed(attempt).await
    }

    pub async fn list_attempts(
        &self,
        run_id: &str,
        step_index: u32,
    ) -> Result<Vec<CallAttempt>, RepositoryError> {
        self.inner.list_attempts_boxed(run_id, step_index).await
    }

    pub async fn arm_timer(&self, timer: &TimerEntry) -> Result<(), RepositoryError> {
        self.inner.arm_timer_boxed(timer).await
    }

    pub async fn list_due_timers(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DueTimer>, RepositoryError> {
        self.inner.list_due_timers_boxed(before, limit).await
    }

    pub async fn fire_due_timers(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        self.inner.fire_due_timers_boxed(run_id, now).await
    }

    pub async fn disarm_timers(&self, run_id: &str) -> Result<u64, RepositoryError> {
        self.inner.disarm_timers_boxed(run_id).await
    }
}
