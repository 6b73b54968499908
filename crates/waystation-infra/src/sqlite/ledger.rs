//! SQLite ledger repository implementation.
//!
//! Implements `LedgerRepository` from `waystation-core` using sqlx with split
//! read/write pools. Step records are insert-only (`ON CONFLICT DO NOTHING`);
//! the run lease lives in the `runs` row and is taken with a conditional
//! `UPDATE`. Timestamps are stored as fixed-width RFC 3339 text so that
//! string comparison in SQL matches time order.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use waystation_core::repository::ledger::{AppendOutcome, DueTimer, LedgerRepository};
use waystation_types::call::{AttemptOutcome, CallAttempt};
use waystation_types::error::RepositoryError;
use waystation_types::run::{RunStatus, RunTransition, WorkflowRun};
use waystation_types::step::{HeaderValues, StepKind, StepOutcome, StepRecord, TimerEntry};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `LedgerRepository`.
pub struct SqliteLedgerRepository {
    pool: DatabasePool,
}

impl SqliteLedgerRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    workflow_name: String,
    status: String,
    payload: Option<String>,
    headers: String,
    final_result: Option<String>,
    error: Option<String>,
    failed_step: Option<i64>,
    retry_count: i64,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_name: row.try_get("workflow_name")?,
            status: row.try_get("status")?,
            payload: row.try_get("payload")?,
            headers: row.try_get("headers")?,
            final_result: row.try_get("final_result")?,
            error: row.try_get("error")?,
            failed_step: row.try_get("failed_step")?,
            retry_count: row.try_get("retry_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        let status: RunStatus = self.status.parse().map_err(RepositoryError::Corrupt)?;
        let headers: BTreeMap<String, String> = parse_json(&self.headers, "run headers")?;

        Ok(WorkflowRun {
            id: self.id,
            workflow_name: self.workflow_name,
            status,
            payload: self
                .payload
                .as_deref()
                .map(|p| parse_json(p, "run payload"))
                .transpose()?,
            headers,
            final_result: self
                .final_result
                .as_deref()
                .map(|r| parse_json(r, "final result"))
                .transpose()?,
            error: self.error,
            failed_step: self.failed_step.map(|s| s as u32),
            retry_count: self.retry_count as u32,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StepRow {
    run_id: String,
    step_index: i64,
    name: String,
    kind: String,
    input_fingerprint: String,
    outcome: String,
    result_body: String,
    result_status: Option<i64>,
    result_headers: Option<String>,
    completed_at: String,
}

impl StepRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step_index: row.try_get("step_index")?,
            name: row.try_get("name")?,
            kind: row.try_get("kind")?,
            input_fingerprint: row.try_get("input_fingerprint")?,
            outcome: row.try_get("outcome")?,
            result_body: row.try_get("result_body")?,
            result_status: row.try_get("result_status")?,
            result_headers: row.try_get("result_headers")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_record(self) -> Result<StepRecord, RepositoryError> {
        let kind: StepKind = self.kind.parse().map_err(RepositoryError::Corrupt)?;
        let outcome: StepOutcome = self.outcome.parse().map_err(RepositoryError::Corrupt)?;
        let result_headers: Option<HeaderValues> = self
            .result_headers
            .as_deref()
            .map(|h| parse_json(h, "result headers"))
            .transpose()?;

        Ok(StepRecord {
            run_id: self.run_id,
            index: self.step_index as u32,
            name: self.name,
            kind,
            input_fingerprint: self.input_fingerprint,
            outcome,
            result_body: self.result_body,
            result_status: self.result_status.map(|s| s as u16),
            result_headers,
            completed_at: parse_datetime(&self.completed_at)?,
        })
    }
}

struct AttemptRow {
    run_id: String,
    step_index: i64,
    attempt: i64,
    outcome: String,
    next_retry_at: Option<String>,
    recorded_at: String,
}

impl AttemptRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step_index: row.try_get("step_index")?,
            attempt: row.try_get("attempt")?,
            outcome: row.try_get("outcome")?,
            next_retry_at: row.try_get("next_retry_at")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn into_attempt(self) -> Result<CallAttempt, RepositoryError> {
        let outcome: AttemptOutcome = parse_json(&self.outcome, "attempt outcome")?;
        Ok(CallAttempt {
            run_id: self.run_id,
            step_index: self.step_index as u32,
            attempt: self.attempt as u32,
            outcome,
            next_retry_at: self
                .next_retry_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            recorded_at: parse_datetime(&self.recorded_at)?,
        })
    }
}

struct TimerRow {
    run_id: String,
    step_index: i64,
    wake_at: String,
    fired_at: Option<String>,
}

impl TimerRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step_index: row.try_get("step_index")?,
            wake_at: row.try_get("wake_at")?,
            fired_at: row.try_get("fired_at")?,
        })
    }

    fn into_timer(self) -> Result<TimerEntry, RepositoryError> {
        Ok(TimerEntry {
            run_id: self.run_id,
            step_index: self.step_index as u32,
            wake_at: parse_datetime(&self.wake_at)?,
            fired_at: self.fired_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Corrupt(format!("invalid datetime '{s}': {e}")))
}

/// Fixed-width UTC form (`2026-01-02T03:04:05.123456Z`).
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Corrupt(format!("invalid {what}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn db_error(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RepositoryError::Connection
        }
        other => RepositoryError::Query(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// LedgerRepository impl
// ---------------------------------------------------------------------------

impl LedgerRepository for SqliteLedgerRepository {
    async fn create_run(&self, run: &WorkflowRun) -> Result<bool, RepositoryError> {
        let payload = run.payload.as_ref().map(to_json).transpose()?;
        let final_result = run.final_result.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"INSERT INTO runs
               (id, workflow_name, status, payload, headers, final_result, error,
                failed_step, retry_count, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(&run.id)
        .bind(&run.workflow_name)
        .bind(run.status.as_str())
        .bind(&payload)
        .bind(to_json(&run.headers)?)
        .bind(&final_result)
        .bind(&run.error)
        .bind(run.failed_step.map(i64::from))
        .bind(i64::from(run.retry_count))
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_error)?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(db_error)?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn update_run(
        &self,
        run_id: &str,
        transition: &RunTransition,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let final_result = transition.final_result.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"UPDATE runs SET
                 status = ?,
                 final_result = COALESCE(?, final_result),
                 error = COALESCE(?, error),
                 failed_step = COALESCE(?, failed_step),
                 retry_count = COALESCE(?, retry_count),
                 updated_at = ?
               WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')"#,
        )
        .bind(transition.status.as_str())
        .bind(&final_result)
        .bind(&transition.error)
        .bind(transition.failed_step.map(i64::from))
        .bind(transition.retry_count.map(i64::from))
        .bind(format_datetime(&now))
        .bind(run_id)
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // Nothing updated: either the run is missing or it already finished.
        let exists = sqlx::query("SELECT 1 FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(db_error)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = match workflow_name {
            Some(name) => {
                sqlx::query(
                    "SELECT * FROM runs WHERE workflow_name = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(name)
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM runs ORDER BY created_at DESC LIMIT ?")
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(db_error)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = RunRow::from_row(row).map_err(db_error)?;
            runs.push(r.into_run()?);
        }
        Ok(runs)
    }

    async fn try_acquire_lease(
        &self,
        run_id: &str,
        owner: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE runs SET lease_owner = ?, lease_until = ?
               WHERE id = ?
                 AND (lease_owner IS NULL OR lease_owner = ?
                      OR lease_until IS NULL OR lease_until < ?)"#,
        )
        .bind(owner)
        .bind(format_datetime(&until))
        .bind(run_id)
        .bind(owner)
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(db_error)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn release_lease(&self, run_id: &str, owner: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE runs SET lease_owner = NULL, lease_until = NULL WHERE id = ? AND lease_owner = ?",
        )
        .bind(run_id)
        .bind(owner)
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn append_step(&self, record: &StepRecord) -> Result<AppendOutcome, RepositoryError> {
        let headers = record.result_headers.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"INSERT INTO steps
               (run_id, step_index, name, kind, input_fingerprint, outcome,
                result_body, result_status, result_headers, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id, step_index) DO NOTHING"#,
        )
        .bind(&record.run_id)
        .bind(i64::from(record.index))
        .bind(&record.name)
        .bind(record.kind.as_str())
        .bind(&record.input_fingerprint)
        .bind(record.outcome.as_str())
        .bind(&record.result_body)
        .bind(record.result_status.map(i64::from))
        .bind(&headers)
        .bind(format_datetime(&record.completed_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;

        if result.rows_affected() > 0 {
            return Ok(AppendOutcome::Inserted);
        }

        // Read the winner on the writer so the row is visible.
        let row = sqlx::query("SELECT * FROM steps WHERE run_id = ? AND step_index = ?")
            .bind(&record.run_id)
            .bind(i64::from(record.index))
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(db_error)?
            .ok_or_else(|| {
                RepositoryError::Conflict(format!(
                    "step {} of run {} neither inserted nor found",
                    record.index, record.run_id
                ))
            })?;
        let existing = StepRow::from_row(&row).map_err(db_error)?.into_record()?;
        Ok(AppendOutcome::Existing(existing))
    }

    async fn get_step(&self, run_id: &str, index: u32) -> Result<Option<StepRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM steps WHERE run_id = ? AND step_index = ?")
            .bind(run_id)
            .bind(i64::from(index))
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_error)?;

        match row {
            Some(row) => Ok(Some(StepRow::from_row(&row).map_err(db_error)?.into_record()?)),
            None => Ok(None),
        }
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM steps WHERE run_id = ? ORDER BY step_index ASC")
            .bind(run_id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(StepRow::from_row(row).map_err(db_error)?.into_record()?);
        }
        Ok(records)
    }

    async fn record_attempt(&self, attempt: &CallAttempt) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO call_attempts
               (run_id, step_index, attempt, outcome, next_retry_at, recorded_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id, step_index, attempt) DO NOTHING"#,
        )
        .bind(&attempt.run_id)
        .bind(i64::from(attempt.step_index))
        .bind(i64::from(attempt.attempt))
        .bind(to_json(&attempt.outcome)?)
        .bind(attempt.next_retry_at.as_ref().map(format_datetime))
        .bind(format_datetime(&attempt.recorded_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "attempt {} of step {} already recorded",
                attempt.attempt, attempt.step_index
            )));
        }
        Ok(())
    }

    async fn list_attempts(
        &self,
        run_id: &str,
        step_index: u32,
    ) -> Result<Vec<CallAttempt>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM call_attempts WHERE run_id = ? AND step_index = ? ORDER BY attempt ASC",
        )
        .bind(run_id)
        .bind(i64::from(step_index))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_error)?;

        let mut attempts = Vec::with_capacity(rows.len());
        for row in &rows {
            attempts.push(AttemptRow::from_row(row).map_err(db_error)?.into_attempt()?);
        }
        Ok(attempts)
    }

    async fn arm_timer(&self, timer: &TimerEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO timers (run_id, step_index, wake_at, fired_at)
               VALUES (?, ?, ?, NULL)
               ON CONFLICT(run_id, step_index) DO UPDATE SET
                 wake_at = excluded.wake_at,
                 fired_at = NULL"#,
        )
        .bind(&timer.run_id)
        .bind(i64::from(timer.step_index))
        .bind(format_datetime(&timer.wake_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn list_due_timers(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DueTimer>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT t.run_id, t.step_index, t.wake_at, t.fired_at, r.workflow_name
               FROM timers t JOIN runs r ON r.id = t.run_id
               WHERE t.fired_at IS NULL AND t.wake_at <= ? AND r.status = 'suspended'
               ORDER BY t.wake_at ASC
               LIMIT ?"#,
        )
        .bind(format_datetime(&before))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_error)?;

        let mut due = Vec::with_capacity(rows.len());
        for row in &rows {
            let workflow_name: String = row.try_get("workflow_name").map_err(db_error)?;
            let timer = TimerRow::from_row(row).map_err(db_error)?.into_timer()?;
            due.push(DueTimer {
                timer,
                workflow_name,
            });
        }
        Ok(due)
    }

    async fn fire_due_timers(&self, run_id: &str, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let now = format_datetime(&now);
        let result = sqlx::query(
            "UPDATE timers SET fired_at = ? WHERE run_id = ? AND fired_at IS NULL AND wake_at <= ?",
        )
        .bind(&now)
        .bind(run_id)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected())
    }

    async fn disarm_timers(&self, run_id: &str) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM timers WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool.writer)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected())
    }
}
