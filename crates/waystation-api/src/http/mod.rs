//! HTTP surface of the engine.
//!
//! The trigger endpoint at `/api/v1/workflows/{name}` answers with the
//! workflow's own result; the run inspection endpoints use the envelope
//! format from [`response`].

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
