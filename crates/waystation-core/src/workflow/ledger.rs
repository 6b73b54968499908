//! Append-only step ledger for one workflow run.
//!
//! Wraps the `LedgerRepository` with the ordering and fingerprint rules the
//! replay executor relies on. The run's records are loaded once per
//! invocation and cached; the caller holds the run lease, so this ledger is
//! the only writer for the duration of the invocation. Appends re-read the
//! run status so a cancellation issued by any process stops further writes.

use std::sync::Arc;

use tokio::sync::Mutex;
use waystation_types::run::RunStatus;
use waystation_types::step::StepRecord;

use crate::repository::ledger::{AppendOutcome, BoxLedgerRepository};

use super::error::LedgerError;

// ---------------------------------------------------------------------------
// StepLedger
// ---------------------------------------------------------------------------

pub struct StepLedger {
    repo: Arc<BoxLedgerRepository>,
    run_id: String,
    /// Record with index `i` lives at position `i - 1`.
    records: Mutex<Vec<StepRecord>>,
}

impl StepLedger {
    /// Load every stored record of the run and check it is gap-free.
    pub async fn load(repo: Arc<BoxLedgerRepository>, run_id: &str) -> Result<Self, LedgerError> {
        let records = repo.list_steps(run_id).await?;
        for (pos, record) in records.iter().enumerate() {
            let expected = pos as u32 + 1;
            if record.index != expected {
                return Err(LedgerError::Corrupt {
                    run_id: run_id.to_string(),
                    message: format!("expected step {expected}, found {}", record.index),
                });
            }
        }

        tracing::debug!(run_id, steps = records.len(), "loaded step ledger");

        Ok(Self {
            repo,
            run_id: run_id.to_string(),
            records: Mutex::new(records),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &Arc<BoxLedgerRepository> {
        &self.repo
    }

    pub async fn get(&self, index: u32) -> Option<StepRecord> {
        if index == 0 {
            return None;
        }
        let records = self.records.lock().await;
        records.get(index as usize - 1).cloned()
    }

    /// Highest recorded index (0 for an empty ledger).
    pub async fn last_index(&self) -> u32 {
        self.records.lock().await.len() as u32
    }

    pub async fn records(&self) -> Vec<StepRecord> {
        self.records.lock().await.clone()
    }

    /// Whether the stored run has been cancelled.
    pub async fn run_cancelled(&self) -> Result<bool, LedgerError> {
        let run = self.repo.get_run(&self.run_id).await?;
        Ok(run.is_some_and(|run| run.status == RunStatus::Cancelled))
    }

    /// Append the next step record.
    ///
    /// - Same (run, index, fingerprint) as a stored record: no-op, the stored
    ///   record is returned.
    /// - Same index, different fingerprint: `DuplicateStep`.
    /// - Index other than `last_index + 1`: `OutOfOrder`.
    /// - Run cancelled in the store: `RunCancelled`, nothing is written.
    pub async fn append(&self, record: StepRecord) -> Result<StepRecord, LedgerError> {
        let mut records = self.records.lock().await;
        let last = records.len() as u32;

        if record.index >= 1 && record.index <= last {
            let stored = &records[record.index as usize - 1];
            return check_same_write(stored, &record);
        }
        if record.index != last + 1 || record.run_id != self.run_id {
            return Err(LedgerError::OutOfOrder {
                run_id: self.run_id.clone(),
                expected: last + 1,
                actual: record.index,
            });
        }

        if self.run_cancelled().await? {
            return Err(LedgerError::RunCancelled {
                run_id: self.run_id.clone(),
            });
        }

        let stored = match self.repo.append_step(&record).await? {
            AppendOutcome::Inserted => record,
            // Written by an invocation whose lease expired under us.
            AppendOutcome::Existing(existing) => check_same_write(&existing, &record)?,
        };

        tracing::debug!(
            run_id = %self.run_id,
            step_index = stored.index,
            kind = %stored.kind,
            outcome = stored.outcome.as_str(),
            "appended step"
        );

        records.push(stored.clone());
        Ok(stored)
    }
}

fn check_same_write(stored: &StepRecord, attempted: &StepRecord) -> Result<StepRecord, LedgerError> {
    if stored.same_write(attempted) {
        Ok(stored.clone())
    } else {
        Err(LedgerError::DuplicateStep {
            run_id: stored.run_id.clone(),
            index: stored.index,
            stored: stored.input_fingerprint.clone(),
            attempted: attempted.input_fingerprint.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
