//! `CallTransport` backed by `reqwest`.
//!
//! The scheduler in core owns timeouts, retries and persistence; this type
//! only turns a `CallRequest` into one HTTP exchange. Any status code is a
//! response; only failures to get one are errors.

use std::time::Duration;

use waystation_core::workflow::call::CallTransport;
use waystation_core::workflow::error::CallError;
use waystation_core::workflow::registry::BoxFuture;
use waystation_types::call::{CallRequest, CallResult};
use waystation_types::step::HeaderValues;

const USER_AGENT: &str = concat!("waystation/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ReqwestCallTransport {
    client: reqwest::Client,
}

impl ReqwestCallTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl CallTransport for ReqwestCallTransport {
    fn send<'a>(&'a self, request: &'a CallRequest) -> BoxFuture<'a, Result<CallResult, CallError>> {
        Box::pin(async move {
            let method: reqwest::Method = request
                .method
                .parse()
                .map_err(|_| CallError::InvalidRequest(format!("invalid HTTP method: {}", request.method)))?;

            let mut builder = self.client.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_builder() {
                    CallError::InvalidRequest(e.to_string())
                } else {
                    CallError::Connect(format!("request to '{}' failed: {e}", request.url))
                }
            })?;

            let status = response.status().as_u16();
            let mut headers = HeaderValues::new();
            for (name, value) in response.headers() {
                headers
                    .entry(name.as_str().to_string())
                    .or_default()
                    .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
            }
            let body = response
                .text()
                .await
                .map_err(|e| CallError::Body(e.to_string()))?;

            tracing::debug!(
                method = %request.method,
                url = %request.url,
                status,
                body_len = body.len(),
                "call answered"
            );
            Ok(CallResult {
                status,
                headers,
                body,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::{HeaderMap, Method, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::any;

    async fn echo(method: Method, headers: HeaderMap, body: String) -> impl IntoResponse {
        let greeting = headers
            .get("greeting")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        match method {
            Method::PUT => (StatusCode::MULTIPLE_CHOICES, HeaderMap::new(), String::new()),
            Method::PATCH => {
                let mut out = HeaderMap::new();
                out.append("failing-header", "one".parse().unwrap());
                out.append("failing-header", "two".parse().unwrap());
                (StatusCode::UNAUTHORIZED, out, "failing request".to_string())
            }
            _ => (
                StatusCode::CREATED,
                HeaderMap::new(),
                format!("called {method} '{greeting}' '{body}'"),
            ),
        }
    }

    async fn serve() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/third-party", any(echo));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/third-party")
    }

    #[tokio::test]
    async fn test_sends_method_headers_and_body() {
        let url = serve().await;
        let transport = ReqwestCallTransport::new().unwrap();
        let request = CallRequest::get(&url)
            .method("POST")
            .header("greeting", "hello")
            .body("payload");

        let result = transport.send(&request).await.unwrap();
        assert_eq!(result.status, 201);
        assert_eq!(result.body, "called POST 'hello' 'payload'");
    }

    #[tokio::test]
    async fn test_non_success_status_is_a_response() {
        let url = serve().await;
        let transport = ReqwestCallTransport::new().unwrap();

        let patch = transport
            .send(&CallRequest::get(&url).method("PATCH"))
            .await
            .unwrap();
        assert_eq!(patch.status, 401);
        assert_eq!(patch.body, "failing request");
        assert_eq!(
            patch.headers["failing-header"],
            vec!["one".to_string(), "two".to_string()]
        );

        let put = transport
            .send(&CallRequest::get(&url).method("PUT"))
            .await
            .unwrap();
        assert_eq!(put.status, 300);
        assert_eq!(put.body, "");
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = ReqwestCallTransport::new().unwrap();
        let err = transport
            .send(&CallRequest::get(format!("http://{addr}/gone")))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Connect(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_invalid_method_is_not_retryable() {
        let transport = ReqwestCallTransport::new().unwrap();
        let err = transport
            .send(&CallRequest::get("http://127.0.0.1:1/").method("BAD METHOD"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::InvalidRequest(_)));
    }
}
