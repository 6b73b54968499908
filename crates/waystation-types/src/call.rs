//! Outbound call types.
//!
//! `CallRequest` is what workflow code hands to `context.call`; `CallResult`
//! is what it gets back. Every attempt made for a call step is persisted as a
//! `CallAttempt`, and only the terminal one becomes the step result.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::step::HeaderValues;

// ---------------------------------------------------------------------------
// CallRequest
// ---------------------------------------------------------------------------

/// An outbound HTTP request issued by a call step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    pub url: String,
    /// HTTP method, uppercase (defaults to GET).
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Transport-level retries allowed after the first attempt.
    #[serde(default)]
    pub retries: u32,
    /// Per-attempt timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl CallRequest {
    /// A GET request with no headers, body, or retries.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
            retries: 0,
            timeout_secs: None,
        }
    }

    pub fn method(mut self, method: impl AsRef<str>) -> Self {
        self.method = method.as_ref().to_ascii_uppercase();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Raw request body, sent as-is.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// JSON-encoded request body. A string value is sent as a quoted JSON string.
    pub fn json_body(mut self, value: &serde_json::Value) -> Self {
        self.body = Some(value.to_string());
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

// ---------------------------------------------------------------------------
// CallResult
// ---------------------------------------------------------------------------

/// The terminal response of a call step.
///
/// Any HTTP response is terminal, including 4xx/5xx and 3xx statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResult {
    pub status: u16,
    #[serde(default)]
    pub headers: HeaderValues,
    /// Response text; an absent body is always `""`.
    #[serde(default)]
    pub body: String,
}

impl CallResult {
    /// First value of a response header (case-insensitive name).
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase() == name)
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// ---------------------------------------------------------------------------
// CallAttempt
// ---------------------------------------------------------------------------

/// The observed outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The endpoint answered (any status).
    Response {
        status: u16,
        #[serde(default)]
        headers: HeaderValues,
        #[serde(default)]
        body: String,
    },
    /// No response: connect failure, timeout, or unreadable body.
    TransportError { message: String },
}

impl AttemptOutcome {
    pub fn is_response(&self) -> bool {
        matches!(self, AttemptOutcome::Response { .. })
    }

    /// Convert a response outcome into the call result it represents.
    pub fn as_call_result(&self) -> Option<CallResult> {
        match self {
            AttemptOutcome::Response {
                status,
                headers,
                body,
            } => Some(CallResult {
                status: *status,
                headers: headers.clone(),
                body: body.clone(),
            }),
            AttemptOutcome::TransportError { .. } => None,
        }
    }
}

/// One persisted attempt of a call step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAttempt {
    pub run_id: String,
    pub step_index: u32,
    /// 1-based attempt number.
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    /// When the next attempt may run (transport errors with retries left).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}
