//! Replay engine and repository trait definitions for Waystation.
//!
//! This crate defines the "ports" (repository, transport, broker, verifier
//! traits) that the infrastructure layer implements, plus the engine that
//! drives workflow code through them. It depends only on `waystation-types`
//! -- never on `waystation-infra` or any database/IO crate.

pub mod repository;
pub mod workflow;
