//! Trigger endpoint: first invocations and broker continuations alike.

use std::collections::BTreeMap;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use waystation_core::workflow::gateway::{RUN_ID_HEADER, TriggerRequest, TriggerResponse};

use crate::http::error::AppError;
use crate::state::AppState;

/// POST /api/v1/workflows/{name}
///
/// The raw body is handed to the gateway untouched so the signature check
/// sees the exact bytes that were signed.
pub async fn trigger_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let request = TriggerRequest {
        workflow_name: name,
        headers: collect_headers(&headers),
        body: body.to_vec(),
    };
    let response = state.gateway.invoke(request).await?;
    Ok(trigger_response(response))
}

/// Lowercased header map; repeated headers are joined with `", "`.
/// Values that are not visible ASCII are dropped.
pub fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

/// Completed runs answer with the workflow's return value; every other
/// outcome with a small status document. The run id is always echoed in
/// the `x-waystation-run-id` response header.
pub fn trigger_response(response: TriggerResponse) -> Response {
    let run_id = response.run_id().to_string();
    let (status, body) = match response {
        TriggerResponse::Completed { result, .. } => (StatusCode::OK, result),
        TriggerResponse::Suspended { run_id } => (
            StatusCode::OK,
            json!({ "workflowRunId": run_id, "status": "suspended" }),
        ),
        TriggerResponse::Busy { run_id } => (
            StatusCode::ACCEPTED,
            json!({ "workflowRunId": run_id, "status": "busy" }),
        ),
        TriggerResponse::Failed {
            run_id,
            step_index,
            message,
        } => (
            StatusCode::OK,
            json!({
                "workflowRunId": run_id,
                "status": "failed",
                "error": { "stepIndex": step_index, "message": message },
            }),
        ),
        TriggerResponse::Cancelled { run_id } => (
            StatusCode::OK,
            json!({ "workflowRunId": run_id, "status": "cancelled" }),
        ),
    };

    let mut resp = (status, Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&run_id) {
        resp.headers_mut().insert(RUN_ID_HEADER, value);
    }
    resp
}
