//! Infrastructure layer for Waystation.
//!
//! Implements the ports defined in `waystation-core`: the SQLite step
//! ledger, the `reqwest` call transport, HTTP continuation delivery, HMAC
//! trigger signatures and the timer sweeper, plus the config file loader.

pub mod config;
pub mod sqlite;
pub mod workflow;
