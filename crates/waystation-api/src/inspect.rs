//! Read-side views of the ledger shared by the HTTP handlers and the CLI.

use serde::Serialize;

use waystation_core::repository::ledger::BoxLedgerRepository;
use waystation_types::call::CallAttempt;
use waystation_types::error::RepositoryError;
use waystation_types::run::WorkflowRun;
use waystation_types::step::{StepKind, StepRecord};

/// Largest page the list endpoints hand out.
pub const MAX_LIST_LIMIT: u32 = 500;

/// A ledger entry together with the attempts of call steps.
#[derive(Debug, Serialize)]
pub struct StepView {
    #[serde(flatten)]
    pub record: StepRecord,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<CallAttempt>,
}

/// `None` when the run does not exist.
pub async fn load_steps(
    repo: &BoxLedgerRepository,
    run_id: &str,
) -> Result<Option<(WorkflowRun, Vec<StepView>)>, RepositoryError> {
    let Some(run) = repo.get_run(run_id).await? else {
        return Ok(None);
    };

    let records = repo.list_steps(run_id).await?;
    let mut steps = Vec::with_capacity(records.len());
    for record in records {
        let attempts = if record.kind == StepKind::Call {
            repo.list_attempts(run_id, record.index).await?
        } else {
            Vec::new()
        };
        steps.push(StepView { record, attempts });
    }
    Ok(Some((run, steps)))
}

pub fn clamp_limit(limit: u32) -> u32 {
    limit.clamp(1, MAX_LIST_LIMIT)
}
