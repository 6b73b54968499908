//! Workflow engine core: step ledger, deterministic replay, durable calls and timers.
//!
//! - `ledger` -- append-only step ledger for one run
//! - `fingerprint` -- step input digests
//! - `context` -- `WorkflowContext`, the API workflow code issues steps through
//! - `replay` -- replay executor classifying each invocation
//! - `call` -- outbound call scheduler with per-call retry and backoff
//! - `timer` -- durable sleep
//! - `retry` -- retry policy and backoff schedules
//! - `gateway` -- trigger entry point (auth, run resolution, lease, emission)
//! - `registry` -- `Workflow` trait and name registry
//! - `clock` -- time source
//! - `error` -- engine error taxonomy

pub mod call;
pub mod clock;
pub mod context;
pub mod error;
pub mod fingerprint;
pub mod gateway;
pub mod ledger;
pub mod registry;
pub mod replay;
pub mod retry;
pub mod timer;

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod scenarios;
