//! Run inspection and cancellation handlers.

use axum::extract::{Path, Query, State};
use serde::Deserialize;

use waystation_types::run::WorkflowRun;

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::inspect::{StepView, clamp_limit, load_steps};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    /// Only runs of this workflow.
    pub workflow: Option<String>,
    #[serde(default = "default_run_limit")]
    pub limit: u32,
}

fn default_run_limit() -> u32 {
    20
}

fn run_link(id: &str) -> String {
    format!("/api/v1/runs/{id}")
}

/// GET /api/v1/runs
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<ApiResponse<Vec<WorkflowRun>>, AppError> {
    let timer = RequestTimer::start();
    let runs = state
        .gateway
        .repo()
        .list_runs(query.workflow.as_deref(), clamp_limit(query.limit))
        .await?;
    Ok(timer.respond(runs).with_link("self", "/api/v1/runs"))
}

/// GET /api/v1/runs/{id}
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ApiResponse<WorkflowRun>, AppError> {
    let timer = RequestTimer::start();
    let run = state
        .gateway
        .repo()
        .get_run(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(id.clone()))?;

    Ok(timer
        .respond(run)
        .with_link("self", run_link(&id))
        .with_link("steps", format!("{}/steps", run_link(&id))))
}

/// GET /api/v1/runs/{id}/steps
pub async fn list_steps(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ApiResponse<Vec<StepView>>, AppError> {
    let timer = RequestTimer::start();
    let (_, steps) = load_steps(state.gateway.repo(), &id)
        .await?
        .ok_or_else(|| AppError::NotFound(id.clone()))?;

    Ok(timer
        .respond(steps)
        .with_link("self", format!("{}/steps", run_link(&id)))
        .with_link("run", run_link(&id)))
}

/// POST /api/v1/runs/{id}/cancel
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ApiResponse<WorkflowRun>, AppError> {
    let timer = RequestTimer::start();
    let run = state.gateway.cancel(&id).await?;
    Ok(timer.respond(run).with_link("run", run_link(&id)))
}

/// GET /api/v1/workflows
pub async fn list_workflows(State(state): State<AppState>) -> ApiResponse<Vec<String>> {
    RequestTimer::start()
        .respond(state.gateway.registry().names())
        .with_link("self", "/api/v1/workflows")
}
