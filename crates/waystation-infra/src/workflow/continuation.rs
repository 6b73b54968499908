//! Continuation delivery over HTTP.
//!
//! A continuation is a signed POST back to the engine's own trigger
//! endpoint, carrying the run id and resume marker in headers. Continuations
//! due within the horizon are held in-process until `deliver_at`; later ones
//! are left to the timer sweeper, which reads the `timers` table. The sweeper
//! also redelivers anything lost when the process dies.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;
use waystation_core::workflow::clock::Clock;
use waystation_core::workflow::gateway::{
    BrokerError, Continuation, ContinuationBroker, RESUME_HEADER, RUN_ID_HEADER, SIGNATURE_HEADER,
};
use waystation_core::workflow::registry::BoxFuture;

use super::signature::sign_body;

pub struct HttpContinuationBroker {
    client: reqwest::Client,
    base_url: String,
    signing_key: Option<SecretString>,
    clock: Arc<dyn Clock>,
    horizon: chrono::Duration,
}

/// Default in-process waiting window.
const DEFAULT_HORIZON_SECS: u64 = 60;

impl HttpContinuationBroker {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        signing_key: Option<SecretString>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            signing_key,
            clock,
            horizon: chrono::Duration::seconds(DEFAULT_HORIZON_SECS as i64),
        }
    }

    /// Only wait in-process for continuations due within `horizon`.
    pub fn with_horizon(mut self, horizon: Duration) -> Self {
        self.horizon = chrono::Duration::from_std(horizon).unwrap_or(self.horizon);
        self
    }

    /// Trigger endpoint of `workflow_name`.
    pub fn trigger_url(&self, workflow_name: &str) -> String {
        format!("{}/api/v1/workflows/{workflow_name}", self.base_url)
    }

    async fn post(&self, continuation: &Continuation) -> Result<(), BrokerError> {
        let body = json!({
            "runId": continuation.run_id,
            "marker": continuation.marker,
            "stepIndex": continuation.step_index,
        })
        .to_string();

        let mut request = self
            .client
            .post(self.trigger_url(&continuation.workflow_name))
            .header(RUN_ID_HEADER, &continuation.run_id)
            .header(RESUME_HEADER, &continuation.marker)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(key) = &self.signing_key {
            let signature =
                sign_body(key, body.as_bytes()).map_err(|e| BrokerError::Delivery(e.to_string()))?;
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| BrokerError::Delivery(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BrokerError::Rejected(status.as_u16()));
        }
        tracing::debug!(
            run_id = %continuation.run_id,
            marker = %continuation.marker,
            status = status.as_u16(),
            "continuation delivered"
        );
        Ok(())
    }
}

impl ContinuationBroker for HttpContinuationBroker {
    fn deliver<'a>(&'a self, continuation: &'a Continuation) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let wait = continuation.deliver_at - self.clock.now();
            if wait > self.horizon {
                tracing::debug!(
                    run_id = %continuation.run_id,
                    marker = %continuation.marker,
                    deliver_at = %continuation.deliver_at,
                    "continuation beyond horizon, left to the sweeper"
                );
                return Ok(());
            }
            if let Ok(wait) = wait.to_std() {
                tokio::time::sleep(wait).await;
            }
            self.post(continuation).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use axum::Router;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use chrono::Utc;
    use waystation_core::workflow::clock::SystemClock;
    use waystation_core::workflow::gateway::RequestVerifier;

    use crate::workflow::signature::HmacRequestVerifier;

    #[derive(Default)]
    struct Received {
        requests: Mutex<Vec<(String, BTreeMap<String, String>, String)>>,
    }

    async fn capture(
        State(received): State<Arc<Received>>,
        Path(name): Path<String>,
        headers: HeaderMap,
        body: String,
    ) -> StatusCode {
        let headers = headers
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        received.requests.lock().unwrap().push((name.clone(), headers, body));
        if name == "broken" {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::ACCEPTED
        }
    }

    async fn serve() -> (String, Arc<Received>) {
        let received = Arc::new(Received::default());
        let app = Router::new()
            .route("/api/v1/workflows/{name}", post(capture))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/"), received)
    }

    fn continuation(workflow: &str) -> Continuation {
        Continuation {
            run_id: "wfr_1".to_string(),
            workflow_name: workflow.to_string(),
            step_index: 2,
            marker: "sleep:2".to_string(),
            deliver_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_delivers_signed_continuation() {
        let (base_url, received) = serve().await;
        let key = SecretString::from("k".to_string());
        let broker = HttpContinuationBroker::new(
            reqwest::Client::new(),
            base_url,
            Some(key.clone()),
            Arc::new(SystemClock),
        );

        broker.deliver(&continuation("ci")).await.unwrap();

        let requests = received.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let (name, headers, body) = &requests[0];
        assert_eq!(name, "ci");
        assert_eq!(headers[RUN_ID_HEADER], "wfr_1");
        assert_eq!(headers[RESUME_HEADER], "sleep:2");

        let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(parsed["runId"], "wfr_1");
        assert_eq!(parsed["stepIndex"], 2);

        let verifier = HmacRequestVerifier::new(key);
        assert!(verifier.verify(headers, body.as_bytes()).is_ok());
    }

    #[tokio::test]
    async fn test_rejected_delivery_reports_status() {
        let (base_url, _received) = serve().await;
        let broker =
            HttpContinuationBroker::new(reqwest::Client::new(), base_url, None, Arc::new(SystemClock));

        let err = broker.deliver(&continuation("broken")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(500)));
    }

    #[tokio::test]
    async fn test_far_continuation_is_left_to_the_sweeper() {
        let (base_url, received) = serve().await;
        let broker =
            HttpContinuationBroker::new(reqwest::Client::new(), base_url, None, Arc::new(SystemClock))
                .with_horizon(Duration::from_secs(30));

        let mut far = continuation("ci");
        far.deliver_at = Utc::now() + chrono::Duration::days(3);
        tokio::time::timeout(Duration::from_secs(5), broker.deliver(&far))
            .await
            .expect("far continuation must not be held in-process")
            .unwrap();
        assert!(received.requests.lock().unwrap().is_empty());

        let mut near = continuation("ci");
        near.deliver_at = Utc::now() + chrono::Duration::milliseconds(50);
        broker.deliver(&near).await.unwrap();
        assert_eq!(received.requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_trigger_url_strips_trailing_slash() {
        let broker = HttpContinuationBroker::new(
            reqwest::Client::new(),
            "http://engine.local:3000/",
            None,
            Arc::new(SystemClock),
        );
        assert_eq!(
            broker.trigger_url("ci"),
            "http://engine.local:3000/api/v1/workflows/ci"
        );
    }
}
