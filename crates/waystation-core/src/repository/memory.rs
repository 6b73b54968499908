//! In-memory `LedgerRepository` for tests and embedded use.
//!
//! Same semantics as the SQLite store (insert-if-absent steps, upserted
//! timers, compare-and-set leases) without any IO. State is lost when the
//! value is dropped.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use waystation_types::call::CallAttempt;
use waystation_types::error::RepositoryError;
use waystation_types::run::{RunStatus, RunTransition, WorkflowRun};
use waystation_types::step::{StepRecord, TimerEntry};

use super::ledger::{AppendOutcome, DueTimer, LedgerRepository};

#[derive(Debug, Clone)]
struct StoredRun {
    run: WorkflowRun,
    lease_owner: Option<String>,
    lease_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    runs: HashMap<String, StoredRun>,
    steps: HashMap<String, BTreeMap<u32, StepRecord>>,
    attempts: HashMap<(String, u32), Vec<CallAttempt>>,
    timers: BTreeMap<(String, u32), TimerEntry>,
}

/// Ledger repository backed by process memory.
#[derive(Debug, Default)]
pub struct InMemoryLedgerRepository {
    inner: Mutex<Inner>,
}

impl InMemoryLedgerRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerRepository for InMemoryLedgerRepository {
    async fn create_run(&self, run: &WorkflowRun) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().await;
        if inner.runs.contains_key(&run.id) {
            return Ok(false);
        }
        inner.runs.insert(
            run.id.clone(),
            StoredRun {
                run: run.clone(),
                lease_owner: None,
                lease_until: None,
            },
        );
        Ok(true)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, RepositoryError> {
        let inner = self.inner.lock().await;
        Ok(inner.runs.get(run_id).map(|stored| stored.run.clone()))
    }

    async fn update_run(
        &self,
        run_id: &str,
        transition: &RunTransition,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .runs
            .get_mut(run_id)
            .ok_or(RepositoryError::NotFound)?;
        let run = &mut stored.run;
        if run.status.is_terminal() {
            return Ok(false);
        }
        run.status = transition.status;
        if let Some(result) = &transition.final_result {
            run.final_result = Some(result.clone());
        }
        if let Some(error) = &transition.error {
            run.error = Some(error.clone());
        }
        if let Some(step) = transition.failed_step {
            run.failed_step = Some(step);
        }
        if let Some(count) = transition.retry_count {
            run.retry_count = count;
        }
        run.updated_at = now;
        Ok(true)
    }

    async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let inner = self.inner.lock().await;
        let mut runs: Vec<WorkflowRun> = inner
            .runs
            .values()
            .filter(|s| workflow_name.is_none_or(|name| s.run.workflow_name == name))
            .map(|s| s.run.clone())
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn try_acquire_lease(
        &self,
        run_id: &str,
        owner: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .runs
            .get_mut(run_id)
            .ok_or(RepositoryError::NotFound)?;
        let free = match (&stored.lease_owner, stored.lease_until) {
            (None, _) => true,
            (Some(current), _) if current == owner => true,
            (Some(_), Some(expiry)) => expiry < now,
            (Some(_), None) => true,
        };
        if free {
            stored.lease_owner = Some(owner.to_string());
            stored.lease_until = Some(until);
        }
        Ok(free)
    }

    async fn release_lease(&self, run_id: &str, owner: &str) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        if let Some(stored) = inner.runs.get_mut(run_id) {
            if stored.lease_owner.as_deref() == Some(owner) {
                stored.lease_owner = None;
                stored.lease_until = None;
            }
        }
        Ok(())
    }

    async fn append_step(&self, record: &StepRecord) -> Result<AppendOutcome, RepositoryError> {
        let mut inner = self.inner.lock().await;
        let steps = inner.steps.entry(record.run_id.clone()).or_default();
        if let Some(existing) = steps.get(&record.index) {
            return Ok(AppendOutcome::Existing(existing.clone()));
        }
        steps.insert(record.index, record.clone());
        Ok(AppendOutcome::Inserted)
    }

    async fn get_step(
        &self,
        run_id: &str,
        index: u32,
    ) -> Result<Option<StepRecord>, RepositoryError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .steps
            .get(run_id)
            .and_then(|steps| steps.get(&index))
            .cloned())
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, RepositoryError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .steps
            .get(run_id)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn record_attempt(&self, attempt: &CallAttempt) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        let attempts = inner
            .attempts
            .entry((attempt.run_id.clone(), attempt.step_index))
            .or_default();
        if attempts.iter().any(|a| a.attempt == attempt.attempt) {
            return Err(RepositoryError::Conflict(format!(
                "attempt {} of step {} already recorded",
                attempt.attempt, attempt.step_index
            )));
        }
        attempts.push(attempt.clone());
        attempts.sort_by_key(|a| a.attempt);
        Ok(())
    }

    async fn list_attempts(
        &self,
        run_id: &str,
        step_index: u32,
    ) -> Result<Vec<CallAttempt>, RepositoryError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .attempts
            .get(&(run_id.to_string(), step_index))
            .cloned()
            .unwrap_or_default())
    }

    async fn arm_timer(&self, timer: &TimerEntry) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        let mut armed = timer.clone();
        armed.fired_at = None;
        inner
            .timers
            .insert((timer.run_id.clone(), timer.step_index), armed);
        Ok(())
    }

    async fn list_due_timers(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DueTimer>, RepositoryError> {
        let inner = self.inner.lock().await;
        let mut due: Vec<DueTimer> = inner
            .timers
            .values()
            .filter(|t| t.fired_at.is_none() && t.wake_at <= before)
            .filter_map(|t| {
                let stored = inner.runs.get(&t.run_id)?;
                (stored.run.status == RunStatus::Suspended).then(|| DueTimer {
                    timer: t.clone(),
                    workflow_name: stored.run.workflow_name.clone(),
                })
            })
            .collect();
        due.sort_by_key(|d| d.timer.wake_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn fire_due_timers(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let mut inner = self.inner.lock().await;
        let mut fired = 0;
        for timer in inner.timers.values_mut() {
            if timer.run_id == run_id && timer.fired_at.is_none() && timer.wake_at <= now {
                timer.fired_at = Some(now);
                fired += 1;
            }
        }
        Ok(fired)
    }

    async fn disarm_timers(&self, run_id: &str) -> Result<u64, RepositoryError> {
        let mut inner = self.inner.lock().await;
        let before = inner.timers.len();
        inner.timers.retain(|(id, _), _| id != run_id);
        Ok((before - inner.timers.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
