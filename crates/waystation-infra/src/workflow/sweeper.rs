//! Background sweeper for lost continuations.
//!
//! Continuations are delivered from in-process tasks, so a restart drops
//! every pending one. The sweeper periodically scans for armed timers of
//! suspended runs whose wake time passed more than `grace` ago without a
//! delivery, and hands them to the broker again.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use waystation_core::repository::ledger::BoxLedgerRepository;
use waystation_core::workflow::clock::Clock;
use waystation_core::workflow::gateway::{Continuation, ContinuationBroker};
use waystation_types::config::SweeperConfig;
use waystation_types::error::RepositoryError;

/// Timers handled per sweep.
const SWEEP_BATCH: u32 = 100;

pub struct TimerSweeper {
    repo: Arc<BoxLedgerRepository>,
    broker: Arc<dyn ContinuationBroker>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    grace: chrono::Duration,
}

impl TimerSweeper {
    pub fn new(
        repo: Arc<BoxLedgerRepository>,
        broker: Arc<dyn ContinuationBroker>,
        clock: Arc<dyn Clock>,
        config: &SweeperConfig,
    ) -> Self {
        Self {
            repo,
            broker,
            clock,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            grace: chrono::Duration::seconds(config.grace_secs as i64),
        }
    }

    /// Redeliver overdue timers once. Returns how many were handed over.
    pub async fn sweep_once(&self) -> Result<usize, RepositoryError> {
        let cutoff = self.clock.now() - self.grace;
        let due = self.repo.list_due_timers(cutoff, SWEEP_BATCH).await?;

        let mut delivered = 0;
        for entry in due {
            let continuation = Continuation {
                run_id: entry.timer.run_id.clone(),
                workflow_name: entry.workflow_name,
                step_index: entry.timer.step_index,
                marker: format!("sweep:{}", entry.timer.step_index),
                deliver_at: entry.timer.wake_at,
            };
            tracing::info!(
                run_id = %continuation.run_id,
                step_index = continuation.step_index,
                wake_at = %continuation.deliver_at,
                "redelivering overdue continuation"
            );
            match self.broker.deliver(&continuation).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(
                    run_id = %continuation.run_id,
                    error = %e,
                    "sweeper delivery failed"
                ),
            }
        }
        Ok(delivered)
    }

    /// Run until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval = ?self.interval, "timer sweeper started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            tracing::warn!(error = %e, "timer sweep failed");
                        }
                    }
                }
            }
            tracing::info!("timer sweeper stopped");
        })
    }
}
