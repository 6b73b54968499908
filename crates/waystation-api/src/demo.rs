//! Workflows registered by the `wstn` binary.
//!
//! - `greet`: one local step, completes in a single invocation.
//! - `nap`: a durable sleep of `payload.seconds` (default 5).
//! - `ci`: POST, sleep 2s, GET, PATCH (one retry) and PUT against the
//!   built-in `/demo/third-party` endpoint.

use std::time::Duration;

use serde_json::{Value, json};

use waystation_core::workflow::context::WorkflowContext;
use waystation_core::workflow::error::StepError;
use waystation_core::workflow::registry::{BoxFuture, Workflow, WorkflowRegistry};
use waystation_types::call::CallRequest;

use crate::http::handlers::demo::FAILING_HEADER;

const DEFAULT_NAP_SECS: u64 = 5;

/// Register every demo workflow. `base_url` is where this server is reachable.
pub fn register_all(registry: &WorkflowRegistry, base_url: &str) {
    registry.register("greet", Greet);
    registry.register("nap", Nap);
    registry.register(
        "ci",
        CallShowcase {
            third_party: format!("{}/demo/third-party", base_url.trim_end_matches('/')),
        },
    );
}

// ---------------------------------------------------------------------------
// greet
// ---------------------------------------------------------------------------

struct Greet;

impl Workflow for Greet {
    fn run<'a>(&'a self, ctx: &'a WorkflowContext) -> BoxFuture<'a, Result<Value, StepError>> {
        Box::pin(async move {
            let name = match ctx.request_payload() {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Object(map)) => map
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("world")
                    .to_string(),
                _ => "world".to_string(),
            };

            let greeting: String = ctx
                .run("compose greeting", || async move {
                    Ok::<_, String>(format!("hello, {name}"))
                })
                .await?;

            Ok(json!({
                "greeting": greeting,
                "runId": ctx.run_id(),
                "trace": ctx.header("x-trace"),
            }))
        })
    }
}

// ---------------------------------------------------------------------------
// nap
// ---------------------------------------------------------------------------

struct Nap;

impl Workflow for Nap {
    fn run<'a>(&'a self, ctx: &'a WorkflowContext) -> BoxFuture<'a, Result<Value, StepError>> {
        Box::pin(async move {
            let seconds = ctx
                .request_payload()
                .and_then(|p| p.get("seconds"))
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_NAP_SECS);

            let started: String = ctx
                .run("note start", || async move {
                    Ok::<_, String>(chrono::Utc::now().to_rfc3339())
                })
                .await?;
            ctx.sleep("nap", Duration::from_secs(seconds)).await?;

            Ok(json!({ "sleptSeconds": seconds, "startedAt": started }))
        })
    }
}

// ---------------------------------------------------------------------------
// ci
// ---------------------------------------------------------------------------

struct CallShowcase {
    third_party: String,
}

impl Workflow for CallShowcase {
    fn run<'a>(&'a self, ctx: &'a WorkflowContext) -> BoxFuture<'a, Result<Value, StepError>> {
        Box::pin(async move {
            let post = ctx
                .call(
                    "post call",
                    CallRequest::get(&self.third_party)
                        .method("POST")
                        .header("post-header", "post-header-value-x")
                        .json_body(&json!("post-payload")),
                )
                .await?;

            ctx.sleep("sleep 1", Duration::from_secs(2)).await?;

            let get = ctx
                .call(
                    "get call",
                    CallRequest::get(&self.third_party).header("get-header", "get-header-value-x"),
                )
                .await?;
            let patch = ctx
                .call(
                    "patch call",
                    CallRequest::get(&self.third_party)
                        .method("PATCH")
                        .header("get-header", "get-header-value-x")
                        .retries(1),
                )
                .await?;
            let put = ctx
                .call(
                    "put call",
                    CallRequest::get(&self.third_party).method("PUT").retries(0),
                )
                .await?;

            Ok(json!({
                "post": { "status": post.status, "body": post.body },
                "get": {
                    "status": get.status,
                    "body": get.body,
                    "header": get.header("get-header"),
                },
                "patch": {
                    "status": patch.status,
                    "body": patch.body,
                    "header": patch.header(FAILING_HEADER),
                },
                "put": { "status": put.status, "body": put.body },
            }))
        })
    }
}
