//! Axum router configuration with middleware.
//!
//! Workflow triggers and run inspection live under `/api/v1/`; `/health`
//! and the demo third-party endpoint sit at the root.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::routing::{any, get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Triggers and continuations
        .route("/workflows", get(handlers::run::list_workflows))
        .route("/workflows/{name}", post(handlers::trigger::trigger_workflow))
        // Runs
        .route("/runs", get(handlers::run::list_runs))
        .route("/runs/{id}", get(handlers::run::get_run))
        .route("/runs/{id}/steps", get(handlers::run::list_steps))
        .route("/runs/{id}/cancel", post(handlers::run::cancel_run));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .route("/demo/third-party", any(handlers::demo::third_party))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
