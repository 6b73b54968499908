//! Built-in stand-in for a third-party service, used by the `ci` demo
//! workflow so the engine can be exercised without outside endpoints.

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};

pub const THIRD_PARTY_RESULT: &str = "third-party-result";
pub const FAILING_HEADER: &str = "failing-header";
pub const FAILING_HEADER_VALUE: &str = "failing-header-value";

/// ANY /demo/third-party
///
/// - POST answers 201 with the `post-header` value and the body echoed.
/// - GET answers 200 and echoes `get-header` back as a response header.
/// - PATCH always fails with 401.
/// - PUT answers 300 with an empty body.
pub async fn third_party(method: Method, headers: HeaderMap, body: String) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };

    match method {
        Method::POST => (
            StatusCode::CREATED,
            format!(
                "called POST '{THIRD_PARTY_RESULT}' '{}' '{body}'",
                header("post-header")
            ),
        )
            .into_response(),
        Method::PATCH => (
            StatusCode::UNAUTHORIZED,
            [(FAILING_HEADER, FAILING_HEADER_VALUE)],
            "failing request",
        )
            .into_response(),
        Method::PUT => StatusCode::MULTIPLE_CHOICES.into_response(),
        other => {
            let value = header("get-header");
            let mut resp = format!("called {other} '{THIRD_PARTY_RESULT}' '{value}'").into_response();
            if let Ok(echo) = HeaderValue::from_str(&value) {
                resp.headers_mut()
                    .insert(HeaderName::from_static("get-header"), echo);
            }
            resp
        }
    }
}
