//! Observability for Waystation: tracing subscriber setup with optional
//! JSON output and OpenTelemetry export.

pub mod tracing_setup;
