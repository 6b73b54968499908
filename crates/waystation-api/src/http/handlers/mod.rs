//! Request handlers, one module per resource.

pub mod demo;
pub mod run;
pub mod trigger;
