//! Fakes shared by the engine tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use waystation_types::call::{CallRequest, CallResult};
use waystation_types::config::EngineConfig;
use waystation_types::run::WorkflowRun;
use waystation_types::step::{HeaderValues, StepRecord};

use crate::repository::ledger::BoxLedgerRepository;
use crate::repository::memory::InMemoryLedgerRepository;

use super::call::CallTransport;
use super::clock::ManualClock;
use super::error::{AuthError, CallError};
use super::gateway::{
    BrokerError, Continuation, ContinuationBroker, GatewayParts, InvocationGateway,
    RESUME_HEADER, RUN_ID_HEADER, RequestVerifier, TriggerRequest, TriggerResponse,
};
use super::registry::{BoxFuture, WorkflowRegistry};

// ---------------------------------------------------------------------------
// ScriptedTransport
// ---------------------------------------------------------------------------

/// Answers calls from per-(method, url) queues and records every request.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<HashMap<(String, String), VecDeque<Result<CallResult, CallError>>>>,
    requests: Mutex<Vec<CallRequest>>,
}

impl ScriptedTransport {
    pub fn push(&self, method: &str, url: &str, outcome: Result<CallResult, CallError>) {
        self.script
            .lock()
            .unwrap()
            .entry((method.to_string(), url.to_string()))
            .or_default()
            .push_back(outcome);
    }

    pub fn requests(&self) -> Vec<CallRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method && r.url == url)
            .count()
    }
}

impl CallTransport for ScriptedTransport {
    fn send<'a>(&'a self, request: &'a CallRequest) -> BoxFuture<'a, Result<CallResult, CallError>> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self
            .script
            .lock()
            .unwrap()
            .get_mut(&(request.method.clone(), request.url.clone()))
            .and_then(VecDeque::pop_front);
        Box::pin(async move {
            next.unwrap_or_else(|| {
                Err(CallError::Connect(format!(
                    "no scripted response for {} {}",
                    request.method, request.url
                )))
            })
        })
    }
}

pub fn response(status: u16, body: &str) -> CallResult {
    CallResult {
        status,
        headers: HeaderValues::new(),
        body: body.to_string(),
    }
}

pub fn response_with_header(status: u16, body: &str, name: &str, value: &str) -> CallResult {
    let mut result = response(status, body);
    result
        .headers
        .insert(name.to_string(), vec![value.to_string()]);
    result
}

// ---------------------------------------------------------------------------
// RecordingBroker / verifiers
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingBroker {
    delivered: Mutex<Vec<Continuation>>,
}

impl RecordingBroker {
    pub fn delivered(&self) -> Vec<Continuation> {
        self.delivered.lock().unwrap().clone()
    }
}

impl ContinuationBroker for RecordingBroker {
    fn deliver<'a>(&'a self, continuation: &'a Continuation) -> BoxFuture<'a, Result<(), BrokerError>> {
        self.delivered.lock().unwrap().push(continuation.clone());
        Box::pin(async { Ok(()) })
    }
}

/// Accepts only requests carrying `x-test-token: ok`.
pub struct TokenVerifier;

impl RequestVerifier for TokenVerifier {
    fn verify(&self, headers: &BTreeMap<String, String>, _body: &[u8]) -> Result<(), AuthError> {
        match headers.get("x-test-token").map(String::as_str) {
            Some("ok") => Ok(()),
            Some(_) => Err(AuthError::Mismatch),
            None => Err(AuthError::MissingSignature),
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub gateway: Arc<InvocationGateway>,
    pub repo: Arc<BoxLedgerRepository>,
    pub registry: Arc<WorkflowRegistry>,
    pub clock: Arc<ManualClock>,
    pub transport: Arc<ScriptedTransport>,
    pub broker: Arc<RecordingBroker>,
    config: EngineConfig,
}

/// Engine config with millisecond call backoff and no step retries.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retries = 0;
    config.call.initial_backoff_ms = 1;
    config.call.max_backoff_ms = 10;
    config
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_verifier(config: EngineConfig, verifier: Arc<dyn RequestVerifier>) -> Self {
        Self::build(config, Some(verifier))
    }

    fn build(config: EngineConfig, verifier: Option<Arc<dyn RequestVerifier>>) -> Self {
        let repo = Arc::new(BoxLedgerRepository::new(InMemoryLedgerRepository::new()));
        let registry = Arc::new(WorkflowRegistry::new());
        let clock = Arc::new(ManualClock::default());
        let transport = Arc::new(ScriptedTransport::default());
        let broker = Arc::new(RecordingBroker::default());

        let gateway = Arc::new(InvocationGateway::new(
            GatewayParts {
                repo: repo.clone(),
                registry: registry.clone(),
                transport: transport.clone(),
                broker: broker.clone(),
                clock: clock.clone(),
                verifier,
            },
            &config,
        ));

        Self {
            gateway,
            repo,
            registry,
            clock,
            transport,
            broker,
            config,
        }
    }

    /// A second gateway over the same store, the way another engine process
    /// (or the CLI) would see the run.
    pub fn peer_gateway(&self) -> Arc<InvocationGateway> {
        Arc::new(InvocationGateway::new(
            GatewayParts {
                repo: self.repo.clone(),
                registry: self.registry.clone(),
                transport: self.transport.clone(),
                broker: self.broker.clone(),
                clock: self.clock.clone(),
                verifier: None,
            },
            &self.config,
        ))
    }

    /// Trigger `workflow` on a spawned task with a fixed run id.
    pub fn spawn_trigger(
        &self,
        workflow: &str,
        run_id: &str,
    ) -> tokio::task::JoinHandle<TriggerResponse> {
        let mut request = self.request(workflow, "");
        request
            .headers
            .insert(RUN_ID_HEADER.to_string(), run_id.to_string());
        let gateway = self.gateway.clone();
        tokio::spawn(async move { gateway.invoke(request).await.unwrap() })
    }

    pub fn request(&self, workflow: &str, body: &str) -> TriggerRequest {
        TriggerRequest {
            workflow_name: workflow.to_string(),
            headers: BTreeMap::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    pub async fn trigger(&self, workflow: &str, body: &str) -> TriggerResponse {
        self.gateway
            .invoke(self.request(workflow, body))
            .await
            .unwrap()
    }

    /// Deliver a continuation the way the HTTP broker would.
    pub async fn resume(&self, workflow: &str, run_id: &str) -> TriggerResponse {
        let mut request = self.request(workflow, "");
        request
            .headers
            .insert(RUN_ID_HEADER.to_string(), run_id.to_string());
        request
            .headers
            .insert(RESUME_HEADER.to_string(), "test".to_string());
        self.gateway.invoke(request).await.unwrap()
    }

    pub async fn run(&self, run_id: &str) -> WorkflowRun {
        self.repo.get_run(run_id).await.unwrap().unwrap()
    }

    pub async fn steps(&self, run_id: &str) -> Vec<StepRecord> {
        self.repo.list_steps(run_id).await.unwrap()
    }

    /// Continuations handed to the broker so far (lets spawned deliveries run first).
    pub async fn delivered(&self) -> Vec<Continuation> {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        self.broker.delivered()
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }
}

/// Run id of a `Suspended` response, panicking otherwise.
pub fn suspended_run_id(response: &TriggerResponse) -> String {
    match response {
        TriggerResponse::Suspended { run_id } => run_id.clone(),
        other => panic!("expected Suspended, got {other:?}"),
    }
}
