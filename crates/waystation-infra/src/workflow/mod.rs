//! Engine adapters: outbound HTTP transport, continuation delivery,
//! trigger signatures and the timer sweeper.

pub mod continuation;
pub mod http_transport;
pub mod signature;
pub mod sweeper;
