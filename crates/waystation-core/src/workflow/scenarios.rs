//! End-to-end engine scenarios: gateway, replay, calls and timers against
//! the in-memory ledger, a scripted transport and a manual clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::Notify;
use waystation_types::call::{AttemptOutcome, CallAttempt, CallRequest};
use waystation_types::run::RunStatus;
use waystation_types::step::{HeaderValues, StepKind, StepOutcome};

use super::clock::Clock;
use super::context::WorkflowContext;
use super::error::{AuthError, CallError, GatewayError, StepError};
use super::gateway::{RUN_ID_HEADER, TriggerResponse};
use super::registry::{BoxFuture, Workflow};
use super::test_support::{
    Harness, TokenVerifier, response, response_with_header, suspended_run_id, test_config,
};

const THIRD_PARTY: &str = "http://third-party.test/api";
const FLAKY: &str = "http://flaky.test/resource";

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

/// POST, sleep 2s, then GET, PATCH (one retry allowed) and PUT.
struct CallShowcase;

impl Workflow for CallShowcase {
    fn run<'a>(&'a self, ctx: &'a WorkflowContext) -> BoxFuture<'a, Result<Value, StepError>> {
        Box::pin(async move {
            let post = ctx
                .call(
                    "post call",
                    CallRequest::get(THIRD_PARTY)
                        .method("post")
                        .header("post-header", "post-header-value-x")
                        .json_body(&json!("post-payload")),
                )
                .await?;

            ctx.sleep("sleep 2s", Duration::from_secs(2)).await?;

            let get = ctx
                .call(
                    "get call",
                    CallRequest::get(THIRD_PARTY).header("get-header", "get-header-value-x"),
                )
                .await?;
            let patch = ctx
                .call(
                    "patch call",
                    CallRequest::get(THIRD_PARTY).method("PATCH").retries(1),
                )
                .await?;
            let put = ctx
                .call("put call", CallRequest::get(THIRD_PARTY).method("PUT"))
                .await?;

            Ok(json!({
                "post": { "status": post.status, "body": post.body },
                "get": { "status": get.status, "body": get.body },
                "patch": {
                    "status": patch.status,
                    "body": patch.body,
                    "header": patch.header("failing-header"),
                },
                "put": { "status": put.status, "body": put.body },
            }))
        })
    }
}

struct SingleCall {
    retries: u32,
}

impl Workflow for SingleCall {
    fn run<'a>(&'a self, ctx: &'a WorkflowContext) -> BoxFuture<'a, Result<Value, StepError>> {
        Box::pin(async move {
            let result = ctx
                .call("fetch", CallRequest::get(FLAKY).retries(self.retries))
                .await?;
            Ok(json!({ "status": result.status, "body": result.body }))
        })
    }
}

/// Sleeps once, then echoes what the first request carried.
struct Echo;

impl Workflow for Echo {
    fn run<'a>(&'a self, ctx: &'a WorkflowContext) -> BoxFuture<'a, Result<Value, StepError>> {
        Box::pin(async move {
            ctx.sleep("pause", Duration::from_secs(1)).await?;
            Ok(json!({
                "payload": ctx.request_payload().cloned(),
                "trace": ctx.header("X-Trace"),
            }))
        })
    }
}

struct PayloadOnly;

impl Workflow for PayloadOnly {
    fn run<'a>(&'a self, ctx: &'a WorkflowContext) -> BoxFuture<'a, Result<Value, StepError>> {
        Box::pin(async move { Ok(ctx.request_payload().cloned().unwrap_or(Value::Null)) })
    }
}

/// Issues its two steps in an order controlled by `swapped`.
struct Reorderable {
    swapped: Arc<AtomicBool>,
}

impl Workflow for Reorderable {
    fn run<'a>(&'a self, ctx: &'a WorkflowContext) -> BoxFuture<'a, Result<Value, StepError>> {
        Box::pin(async move {
            if self.swapped.load(Ordering::SeqCst) {
                ctx.sleep("wait", Duration::from_secs(1)).await?;
                ctx.run("compute", || async { Ok::<u32, String>(1) }).await?;
            } else {
                ctx.run("compute", || async { Ok::<u32, String>(1) }).await?;
                ctx.sleep("wait", Duration::from_secs(1)).await?;
            }
            Ok(json!("done"))
        })
    }
}

/// Returns early once `short` is set, skipping steps it recorded before.
struct Shrinking {
    short: Arc<AtomicBool>,
}

impl Workflow for Shrinking {
    fn run<'a>(&'a self, ctx: &'a WorkflowContext) -> BoxFuture<'a, Result<Value, StepError>> {
        Box::pin(async move {
            ctx.run("one", || async { Ok::<u32, String>(1) }).await?;
            if !self.short.load(Ordering::SeqCst) {
                ctx.run("two", || async { Ok::<u32, String>(2) }).await?;
                ctx.sleep("wait", Duration::from_secs(1)).await?;
            }
            Ok(json!("done"))
        })
    }
}

/// A local step that fails `failures` times before returning 7.
struct FlakyStep {
    failures: Arc<AtomicU32>,
    executions: Arc<AtomicU32>,
}

impl Workflow for FlakyStep {
    fn run<'a>(&'a self, ctx: &'a WorkflowContext) -> BoxFuture<'a, Result<Value, StepError>> {
        let failures = self.failures.clone();
        let executions = self.executions.clone();
        Box::pin(async move {
            let value: u32 = ctx
                .run("flaky", move || async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    let left = failures.load(Ordering::SeqCst);
                    if left > 0 {
                        failures.store(left - 1, Ordering::SeqCst);
                        Err("transient".to_string())
                    } else {
                        Ok(7)
                    }
                })
                .await?;
            Ok(json!(value))
        })
    }
}

/// First step parks until released; used to cancel a run mid-replay.
struct Blocking {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl Workflow for Blocking {
    fn run<'a>(&'a self, ctx: &'a WorkflowContext) -> BoxFuture<'a, Result<Value, StepError>> {
        let entered = self.entered.clone();
        let release = self.release.clone();
        Box::pin(async move {
            ctx.run("block", move || async move {
                entered.notify_one();
                release.notified().await;
                Ok::<u32, String>(1)
            })
            .await?;
            ctx.run("after", || async { Ok::<u32, String>(2) }).await?;
            Ok(json!("done"))
        })
    }
}

struct ZeroSleep;

impl Workflow for ZeroSleep {
    fn run<'a>(&'a self, ctx: &'a WorkflowContext) -> BoxFuture<'a, Result<Value, StepError>> {
        Box::pin(async move {
            ctx.sleep("no wait", Duration::ZERO).await?;
            ctx.sleep_until("past", ctx.now() - chrono::Duration::seconds(5))
                .await?;
            Ok(json!("awake"))
        })
    }
}

/// Ignores the suspension of its sleep and keeps going.
struct Swallow {
    ran_after: Arc<AtomicBool>,
}

impl Workflow for Swallow {
    fn run<'a>(&'a self, ctx: &'a WorkflowContext) -> BoxFuture<'a, Result<Value, StepError>> {
        let ran_after = self.ran_after.clone();
        Box::pin(async move {
            let _ = ctx.sleep("nap", Duration::from_secs(10)).await;
            let _ = ctx
                .run("after", move || async move {
                    ran_after.store(true, Ordering::SeqCst);
                    Ok::<u32, String>(1)
                })
                .await;
            Ok(json!("ignored the sleep"))
        })
    }
}

fn completed_result(response: &TriggerResponse) -> &Value {
    match response {
        TriggerResponse::Completed { result, .. } => result,
        other => panic!("expected Completed, got {other:?}"),
    }
}

fn wake_time(body: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(body).unwrap().with_timezone(&Utc)
}

// ---------------------------------------------------------------------------
// Calls, sleep and replay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn call_showcase_runs_every_step_once() {
    let h = Harness::new(test_config());
    h.registry.register("ci", CallShowcase);

    h.transport.push(
        "POST",
        THIRD_PARTY,
        Ok(response(
            201,
            "called POST 'third-party-result' 'post-header-value-x' '\"post-payload\"'",
        )),
    );
    h.transport.push(
        "GET",
        THIRD_PARTY,
        Ok(response(200, "called GET 'third-party-result' 'get-header-value-x'")),
    );
    h.transport.push(
        "PATCH",
        THIRD_PARTY,
        Ok(response_with_header(
            401,
            "failing request",
            "Failing-Header",
            "failing-header-value",
        )),
    );
    h.transport.push("PUT", THIRD_PARTY, Ok(response(300, "")));

    let started = h.clock.now();
    let first = h.trigger("ci", "").await;
    let run_id = suspended_run_id(&first);
    assert_eq!(h.run(&run_id).await.status, RunStatus::Suspended);

    let steps = h.steps(&run_id).await;
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[1].kind, StepKind::Sleep);
    let wake = wake_time(&steps[1].result_body);
    assert_eq!(wake, started + chrono::Duration::seconds(2));

    let delivered = h.delivered().await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].marker, "sleep:2");
    assert_eq!(delivered[0].deliver_at, wake);

    // An early continuation re-suspends without touching anything after the sleep.
    h.advance_secs(1);
    let early = h.resume("ci", &run_id).await;
    assert_eq!(suspended_run_id(&early), run_id);
    assert_eq!(h.steps(&run_id).await.len(), 2);
    assert_eq!(h.transport.count("GET", THIRD_PARTY), 0);

    h.advance_secs(1);
    let done = h.resume("ci", &run_id).await;
    let result = completed_result(&done);
    assert_eq!(result["post"]["status"], 201);
    assert_eq!(
        result["post"]["body"],
        "called POST 'third-party-result' 'post-header-value-x' '\"post-payload\"'"
    );
    assert_eq!(result["get"]["status"], 200);
    assert_eq!(result["patch"]["status"], 401);
    assert_eq!(result["patch"]["body"], "failing request");
    assert_eq!(result["patch"]["header"], "failing-header-value");
    assert_eq!(result["put"]["status"], 300);
    assert_eq!(result["put"]["body"], "");

    // Every call reached the third party exactly once.
    assert_eq!(h.transport.count("POST", THIRD_PARTY), 1);
    assert_eq!(h.transport.count("GET", THIRD_PARTY), 1);
    assert_eq!(h.transport.count("PATCH", THIRD_PARTY), 1);
    assert_eq!(h.transport.count("PUT", THIRD_PARTY), 1);

    let post = &h.transport.requests()[0];
    assert_eq!(post.method, "POST");
    assert_eq!(post.headers["post-header"], "post-header-value-x");
    assert_eq!(post.body.as_deref(), Some("\"post-payload\""));

    let steps = h.steps(&run_id).await;
    let indices: Vec<u32> = steps.iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    assert!(steps.iter().all(|s| s.outcome == StepOutcome::Succeeded));
    assert!(steps[2].completed_at >= wake);
    assert_eq!(h.repo.list_attempts(&run_id, 4).await.unwrap().len(), 1);

    let run = h.run(&run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.final_result.as_ref(), Some(result));
}

#[tokio::test]
async fn duplicate_delivery_returns_stored_result() {
    let h = Harness::new(test_config());
    h.registry.register("single", SingleCall { retries: 0 });
    h.transport.push("GET", FLAKY, Ok(response(200, "once")));

    let mut request = h.request("single", "");
    request
        .headers
        .insert(RUN_ID_HEADER.to_string(), "order-42".to_string());

    let first = h.gateway.invoke(request.clone()).await.unwrap();
    let second = h.gateway.invoke(request).await.unwrap();
    let resumed = h.resume("single", "order-42").await;

    assert_eq!(first.run_id(), "order-42");
    assert_eq!(first, second);
    assert_eq!(first, resumed);
    assert_eq!(h.transport.count("GET", FLAKY), 1);
    assert_eq!(h.steps("order-42").await.len(), 1);
}

#[tokio::test]
async fn transport_errors_are_retried_inline() {
    let h = Harness::new(test_config());
    h.registry.register("single", SingleCall { retries: 2 });
    h.transport
        .push("GET", FLAKY, Err(CallError::Connect("refused".to_string())));
    h.transport.push(
        "GET",
        FLAKY,
        Err(CallError::Timeout(Duration::from_secs(30))),
    );
    h.transport.push("GET", FLAKY, Ok(response(200, "finally")));

    let done = h.trigger("single", "").await;
    assert_eq!(completed_result(&done)["body"], "finally");
    assert_eq!(h.transport.count("GET", FLAKY), 3);

    let attempts = h.repo.list_attempts(done.run_id(), 1).await.unwrap();
    assert_eq!(attempts.len(), 3);
    assert!(!attempts[0].outcome.is_response());
    assert!(attempts[2].outcome.is_response());
    assert!(h.delivered().await.is_empty());
}

#[tokio::test]
async fn exhausted_transport_retries_fail_the_run() {
    let h = Harness::new(test_config());
    h.registry.register("single", SingleCall { retries: 1 });
    for _ in 0..2 {
        h.transport
            .push("GET", FLAKY, Err(CallError::Connect("refused".to_string())));
    }

    let response = h.trigger("single", "").await;
    let TriggerResponse::Failed {
        run_id,
        step_index,
        message,
    } = response
    else {
        panic!("expected Failed, got {response:?}");
    };
    assert_eq!(step_index, Some(1));
    assert!(message.contains("refused"), "{message}");
    assert_eq!(h.transport.count("GET", FLAKY), 2);

    let steps = h.steps(&run_id).await;
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].outcome, StepOutcome::Failed);

    let run = h.run(&run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failed_step, Some(1));

    // Replaying the failed run never calls again.
    let again = h.resume("single", &run_id).await;
    assert!(matches!(again, TriggerResponse::Failed { .. }));
    assert_eq!(h.transport.count("GET", FLAKY), 2);
}

#[tokio::test]
async fn invalid_request_is_not_retried() {
    let h = Harness::new(test_config());
    h.registry.register("single", SingleCall { retries: 3 });
    h.transport.push(
        "GET",
        FLAKY,
        Err(CallError::InvalidRequest("bad header".to_string())),
    );

    let response = h.trigger("single", "").await;
    assert!(matches!(
        response,
        TriggerResponse::Failed {
            step_index: Some(1),
            ..
        }
    ));
    assert_eq!(h.transport.count("GET", FLAKY), 1);
}

#[tokio::test]
async fn long_call_backoff_suspends_the_run() {
    let mut config = test_config();
    config.call.max_inline_backoff_ms = 0;
    config.call.initial_backoff_ms = 5_000;
    config.call.max_backoff_ms = 60_000;
    let h = Harness::new(config);
    h.registry.register("single", SingleCall { retries: 1 });
    h.transport
        .push("GET", FLAKY, Err(CallError::Connect("refused".to_string())));
    h.transport.push("GET", FLAKY, Ok(response(200, "recovered")));

    let started = h.clock.now();
    let first = h.trigger("single", "").await;
    let run_id = suspended_run_id(&first);

    let attempts = h.repo.list_attempts(&run_id, 1).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(
        attempts[0].next_retry_at,
        Some(started + chrono::Duration::seconds(5))
    );
    let delivered = h.delivered().await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].marker, "call-retry:1");

    h.advance_secs(1);
    suspended_run_id(&h.resume("single", &run_id).await);
    assert_eq!(h.transport.count("GET", FLAKY), 1);

    h.advance_secs(5);
    let done = h.resume("single", &run_id).await;
    assert_eq!(completed_result(&done)["body"], "recovered");
    assert_eq!(h.repo.list_attempts(&run_id, 1).await.unwrap().len(), 2);
}

#[tokio::test]
async fn persisted_response_is_promoted_without_calling() {
    let h = Harness::new(test_config());
    h.registry.register("single", SingleCall { retries: 0 });

    // A previous invocation got a response but died before writing the step.
    let mut headers = HeaderValues::new();
    headers.insert("etag".to_string(), vec!["v1".to_string()]);
    h.repo
        .record_attempt(&CallAttempt {
            run_id: "wfr_crashed".to_string(),
            step_index: 1,
            attempt: 1,
            outcome: AttemptOutcome::Response {
                status: 202,
                headers,
                body: "persisted".to_string(),
            },
            next_retry_at: None,
            recorded_at: h.clock.now(),
        })
        .await
        .unwrap();

    let mut request = h.request("single", "");
    request
        .headers
        .insert(RUN_ID_HEADER.to_string(), "wfr_crashed".to_string());
    let done = h.gateway.invoke(request).await.unwrap();

    assert_eq!(completed_result(&done)["status"], 202);
    assert_eq!(completed_result(&done)["body"], "persisted");
    assert_eq!(h.transport.count("GET", FLAKY), 0);

    let steps = h.steps("wfr_crashed").await;
    assert_eq!(steps[0].result_status, Some(202));
    assert_eq!(
        steps[0].result_headers.as_ref().unwrap()["etag"],
        vec!["v1".to_string()]
    );
}

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

#[tokio::test]
async fn payload_and_headers_survive_replay() {
    let h = Harness::new(test_config());
    h.registry.register("echo", Echo);

    let mut request = h.request("echo", r#"{"order": 7}"#);
    request
        .headers
        .insert("X-Trace".to_string(), "abc".to_string());
    let first = h.gateway.invoke(request).await.unwrap();
    let run_id = suspended_run_id(&first);

    h.advance_secs(1);
    let done = h.resume("echo", &run_id).await;
    let result = completed_result(&done);
    assert_eq!(result["payload"], json!({"order": 7}));
    assert_eq!(result["trace"], "abc");
}

#[tokio::test]
async fn payload_forms() {
    let h = Harness::new(test_config());
    h.registry.register("payload", PayloadOnly);

    let empty = h.trigger("payload", "").await;
    assert_eq!(completed_result(&empty), &Value::Null);

    let text = h.trigger("payload", "my-payload").await;
    assert_eq!(completed_result(&text), &json!("my-payload"));

    let object = h.trigger("payload", r#"{"a": [1, 2]}"#).await;
    assert_eq!(completed_result(&object), &json!({"a": [1, 2]}));
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unauthenticated_trigger_creates_nothing() {
    let h = Harness::with_verifier(test_config(), Arc::new(TokenVerifier));
    h.registry.register("payload", PayloadOnly);

    let err = h
        .gateway
        .invoke(h.request("payload", "{}"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Auth(AuthError::MissingSignature)
    ));

    let mut forged = h.request("payload", "{}");
    forged
        .headers
        .insert("x-test-token".to_string(), "nope".to_string());
    assert!(matches!(
        h.gateway.invoke(forged).await,
        Err(GatewayError::Auth(AuthError::Mismatch))
    ));
    assert!(h.repo.list_runs(None, 10).await.unwrap().is_empty());

    let mut signed = h.request("payload", "{}");
    signed
        .headers
        .insert("x-test-token".to_string(), "ok".to_string());
    let done = h.gateway.invoke(signed).await.unwrap();
    assert_eq!(completed_result(&done), &json!({}));
    // The verification header is not engine-internal, so the run keeps it.
    assert_eq!(h.run(done.run_id()).await.headers["x-test-token"], "ok");
}

#[tokio::test]
async fn unknown_workflow_and_mismatched_run() {
    let h = Harness::new(test_config());
    h.registry.register("echo", Echo);
    h.registry.register("payload", PayloadOnly);

    assert!(matches!(
        h.gateway.invoke(h.request("missing", "")).await,
        Err(GatewayError::UnknownWorkflow(name)) if name == "missing"
    ));

    let run_id = suspended_run_id(&h.trigger("echo", "").await);
    let mut request = h.request("payload", "");
    request.headers.insert(RUN_ID_HEADER.to_string(), run_id);
    assert!(matches!(
        h.gateway.invoke(request).await,
        Err(GatewayError::WorkflowMismatch { .. })
    ));

    let mut orphan = h.request("echo", "");
    orphan
        .headers
        .insert(RUN_ID_HEADER.to_string(), "wfr_gone".to_string());
    orphan
        .headers
        .insert(super::gateway::RESUME_HEADER.to_string(), "sleep:1".to_string());
    assert!(matches!(
        h.gateway.invoke(orphan).await,
        Err(GatewayError::RunNotFound(_))
    ));
}

#[tokio::test]
async fn held_lease_answers_busy() {
    let h = Harness::new(test_config());
    h.registry.register("echo", Echo);

    let run_id = suspended_run_id(&h.trigger("echo", "").await);
    let now = h.clock.now();
    assert!(
        h.repo
            .try_acquire_lease(&run_id, "other-instance", now + chrono::Duration::seconds(60), now)
            .await
            .unwrap()
    );

    h.advance_secs(1);
    assert_eq!(
        h.resume("echo", &run_id).await,
        TriggerResponse::Busy {
            run_id: run_id.clone()
        }
    );
    assert_eq!(h.run(&run_id).await.status, RunStatus::Suspended);

    // Once the lease expires the next delivery proceeds.
    h.advance_secs(60);
    assert!(matches!(
        h.resume("echo", &run_id).await,
        TriggerResponse::Completed { .. }
    ));
}

// ---------------------------------------------------------------------------
// Determinism
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reordered_steps_fail_the_run() {
    let h = Harness::new(test_config());
    let swapped = Arc::new(AtomicBool::new(false));
    h.registry.register(
        "reorder",
        Reorderable {
            swapped: swapped.clone(),
        },
    );

    let run_id = suspended_run_id(&h.trigger("reorder", "").await);
    swapped.store(true, Ordering::SeqCst);
    h.advance_secs(1);

    let response = h.resume("reorder", &run_id).await;
    let TriggerResponse::Failed {
        step_index,
        message,
        ..
    } = response
    else {
        panic!("expected Failed, got {response:?}");
    };
    assert_eq!(step_index, Some(1));
    assert!(message.contains("determinism violation"), "{message}");
    assert_eq!(h.steps(&run_id).await.len(), 2);
    assert_eq!(h.run(&run_id).await.status, RunStatus::Failed);
}

#[tokio::test]
async fn returning_before_recorded_steps_is_a_violation() {
    let h = Harness::new(test_config());
    let short = Arc::new(AtomicBool::new(false));
    h.registry.register(
        "shrink",
        Shrinking {
            short: short.clone(),
        },
    );

    let run_id = suspended_run_id(&h.trigger("shrink", "").await);
    assert_eq!(h.steps(&run_id).await.len(), 3);

    short.store(true, Ordering::SeqCst);
    h.advance_secs(1);
    let response = h.resume("shrink", &run_id).await;
    assert!(
        matches!(
            response,
            TriggerResponse::Failed {
                step_index: Some(2),
                ..
            }
        ),
        "{response:?}"
    );
}

#[tokio::test]
async fn swallowed_suspension_still_suspends() {
    let h = Harness::new(test_config());
    let ran_after = Arc::new(AtomicBool::new(false));
    h.registry.register(
        "swallow",
        Swallow {
            ran_after: ran_after.clone(),
        },
    );

    let run_id = suspended_run_id(&h.trigger("swallow", "").await);
    assert!(!ran_after.load(Ordering::SeqCst));
    assert_eq!(h.steps(&run_id).await.len(), 1);
    assert_eq!(h.run(&run_id).await.status, RunStatus::Suspended);
}

// ---------------------------------------------------------------------------
// Timers, retries and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn elapsed_sleeps_do_not_suspend() {
    let h = Harness::new(test_config());
    h.registry.register("zero", ZeroSleep);

    let done = h.trigger("zero", "").await;
    assert_eq!(completed_result(&done), &json!("awake"));
    assert_eq!(h.steps(done.run_id()).await.len(), 2);
    assert!(h.delivered().await.is_empty());
}

#[tokio::test]
async fn failing_step_is_retried_at_workflow_level() {
    let mut config = test_config();
    config.retries = 2;
    config.retry_backoff_ms = 1_000;
    let h = Harness::new(config);
    let executions = Arc::new(AtomicU32::new(0));
    h.registry.register(
        "flaky",
        FlakyStep {
            failures: Arc::new(AtomicU32::new(1)),
            executions: executions.clone(),
        },
    );

    let run_id = suspended_run_id(&h.trigger("flaky", "").await);
    let run = h.run(&run_id).await;
    assert_eq!(run.retry_count, 1);
    assert_eq!(run.error.as_deref(), Some("transient"));
    assert!(h.steps(&run_id).await.is_empty());

    let delivered = h.delivered().await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].marker, "retry:1");

    h.advance_secs(2);
    let done = h.resume("flaky", &run_id).await;
    assert_eq!(completed_result(&done), &json!(7));
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn exhausted_workflow_retries_fail_the_run() {
    let mut config = test_config();
    config.retries = 1;
    let h = Harness::new(config);
    let executions = Arc::new(AtomicU32::new(0));
    h.registry.register(
        "flaky",
        FlakyStep {
            failures: Arc::new(AtomicU32::new(5)),
            executions: executions.clone(),
        },
    );

    let run_id = suspended_run_id(&h.trigger("flaky", "").await);
    h.advance_secs(10);

    let response = h.resume("flaky", &run_id).await;
    assert_eq!(
        response,
        TriggerResponse::Failed {
            run_id: run_id.clone(),
            step_index: Some(1),
            message: "transient".to_string(),
        }
    );
    let steps = h.steps(&run_id).await;
    assert_eq!(steps.len(), 1);
    assert!(steps[0].is_failed());

    // Further deliveries replay the stored failure.
    assert_eq!(h.resume("flaky", &run_id).await, response);
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cancelled_run_stays_cancelled() {
    let h = Harness::new(test_config());
    h.registry.register("echo", Echo);

    let run_id = suspended_run_id(&h.trigger("echo", "").await);
    let run = h.gateway.cancel(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);

    let far = h.clock.now() + chrono::Duration::days(1);
    assert!(h.repo.list_due_timers(far, 10).await.unwrap().is_empty());

    h.advance_secs(1);
    assert_eq!(
        h.resume("echo", &run_id).await,
        TriggerResponse::Cancelled {
            run_id: run_id.clone()
        }
    );
    assert_eq!(h.steps(&run_id).await.len(), 1);
}

fn blocking(h: &Harness) -> (Arc<Notify>, Arc<Notify>) {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    h.registry.register(
        "blocking",
        Blocking {
            entered: entered.clone(),
            release: release.clone(),
        },
    );
    (entered, release)
}

#[tokio::test]
async fn cancel_stops_an_in_flight_replay_without_recording_more_steps() {
    let h = Harness::new(test_config());
    let (entered, release) = blocking(&h);

    let task = h.spawn_trigger("blocking", "wfr_inflight");
    entered.notified().await;
    h.gateway.cancel("wfr_inflight").await.unwrap();
    release.notify_one();

    let response = task.await.unwrap();
    assert_eq!(
        response,
        TriggerResponse::Cancelled {
            run_id: "wfr_inflight".to_string()
        }
    );
    assert!(h.steps("wfr_inflight").await.is_empty());
    assert_eq!(h.run("wfr_inflight").await.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn cancel_from_another_gateway_is_not_overwritten() {
    let h = Harness::new(test_config());
    let (entered, release) = blocking(&h);

    let task = h.spawn_trigger("blocking", "wfr_remote");
    entered.notified().await;

    let peer = h.peer_gateway();
    let cancelled = peer.cancel("wfr_remote").await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    release.notify_one();

    assert_eq!(
        task.await.unwrap(),
        TriggerResponse::Cancelled {
            run_id: "wfr_remote".to_string()
        }
    );
    assert!(h.steps("wfr_remote").await.is_empty());
    let run = h.run("wfr_remote").await;
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.final_result, None);
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn long_replay_keeps_its_lease() {
    let h = Harness::new(test_config());
    let (entered, release) = blocking(&h);

    let task = h.spawn_trigger("blocking", "wfr_long");
    entered.notified().await;

    // Past the original lease expiry; the heartbeat renews it.
    h.advance_secs(61);
    tokio::time::sleep(Duration::from_secs(21)).await;

    let mut again = h.request("blocking", "");
    again
        .headers
        .insert(RUN_ID_HEADER.to_string(), "wfr_long".to_string());
    assert_eq!(
        h.gateway.invoke(again).await.unwrap(),
        TriggerResponse::Busy {
            run_id: "wfr_long".to_string()
        }
    );

    release.notify_one();
    assert_eq!(completed_result(&task.await.unwrap()), &json!("done"));
    let names: Vec<String> = h
        .steps("wfr_long")
        .await
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names, vec!["block", "after"]);
}

#[tokio::test(start_paused = true)]
async fn replay_stops_when_its_lease_is_taken_over() {
    let h = Harness::new(test_config());
    let (entered, release) = blocking(&h);

    let task = h.spawn_trigger("blocking", "wfr_taken");
    entered.notified().await;

    h.advance_secs(61);
    let now = h.clock.now();
    assert!(
        h.repo
            .try_acquire_lease("wfr_taken", "other-instance", now + chrono::Duration::seconds(60), now)
            .await
            .unwrap()
    );
    tokio::time::sleep(Duration::from_secs(21)).await;
    release.notify_one();

    assert_eq!(
        task.await.unwrap(),
        TriggerResponse::Busy {
            run_id: "wfr_taken".to_string()
        }
    );
    let steps = h.steps("wfr_taken").await;
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].name, "block");
    assert_eq!(h.run("wfr_taken").await.status, RunStatus::Pending);

    // The new holder keeps the lease.
    assert!(
        !h.repo
            .try_acquire_lease("wfr_taken", "third", now + chrono::Duration::seconds(60), now)
            .await
            .unwrap()
    );
}
