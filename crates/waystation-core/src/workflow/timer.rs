//! Durable timer behind `context.sleep` / `context.sleep_until`.
//!
//! The first encounter of a sleep arms a `TimerEntry`, writes the sleep
//! record with the wake time (RFC 3339) as its body and suspends the run.
//! A later invocation compares the recorded wake time with the clock: early
//! deliveries suspend again, on-time and late ones let replay continue. No
//! process resources are held while a run sleeps.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use waystation_types::step::{StepKind, StepOutcome, StepRecord, TimerEntry};

use super::clock::Clock;
use super::error::{DeterminismViolation, StepError, SuspendReason, Suspension};
use super::ledger::StepLedger;

/// When a sleep ends.
#[derive(Debug, Clone, Copy)]
pub enum SleepTarget {
    For(Duration),
    Until(DateTime<Utc>),
}

impl SleepTarget {
    pub fn wake_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            SleepTarget::For(duration) => chrono::Duration::from_std(*duration)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            SleepTarget::Until(at) => *at,
        }
    }
}

/// One sleep step as issued by the context.
pub struct SleepStep<'a> {
    pub index: u32,
    pub name: &'a str,
    pub fingerprint: String,
    /// Ledger record at `index`, already verified against this step.
    pub recorded: Option<StepRecord>,
    pub target: SleepTarget,
}

pub struct DurableTimer {
    clock: Arc<dyn Clock>,
}

impl DurableTimer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub async fn sleep(&self, ledger: &StepLedger, step: SleepStep<'_>) -> Result<(), StepError> {
        let now = self.clock.now();
        let run_id = ledger.run_id();

        let wake_at = match step.recorded {
            Some(record) => parse_wake_at(&record)?,
            None => {
                let wake_at = step.target.wake_at(now);
                // Armed before the record so a crash in between still leaves a
                // timer that leads back here.
                if wake_at > now {
                    ledger
                        .repo()
                        .arm_timer(&TimerEntry::new(run_id, step.index, wake_at))
                        .await?;
                }
                ledger
                    .append(StepRecord {
                        run_id: run_id.to_string(),
                        index: step.index,
                        name: step.name.to_string(),
                        kind: StepKind::Sleep,
                        input_fingerprint: step.fingerprint,
                        outcome: StepOutcome::Succeeded,
                        result_body: wake_at.to_rfc3339(),
                        result_status: None,
                        result_headers: None,
                        completed_at: now,
                    })
                    .await?;
                tracing::debug!(
                    run_id,
                    step_index = step.index,
                    wake_at = %wake_at,
                    "armed sleep"
                );
                wake_at
            }
        };

        if now >= wake_at {
            return Ok(());
        }

        Err(StepError::Suspended(Suspension {
            step_index: step.index,
            wake_at,
            reason: SuspendReason::Sleep,
        }))
    }
}

fn parse_wake_at(record: &StepRecord) -> Result<DateTime<Utc>, StepError> {
    DateTime::parse_from_rfc3339(&record.result_body)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            DeterminismViolation::ResultDecode {
                index: record.index,
                message: format!("invalid wake time '{}': {e}", record.result_body),
            }
            .into()
        })
}
