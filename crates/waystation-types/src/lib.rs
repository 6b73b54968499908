//! Shared domain types for Waystation.
//!
//! This crate contains the durable records the engine reads and writes:
//! workflow runs, step ledger records, outbound call attempts, timers, and
//! the engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod call;
pub mod config;
pub mod error;
pub mod run;
pub mod step;
