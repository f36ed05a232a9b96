//! Realtime event stream modules.
//!
//! - `proto`: requests, payloads and their JSON wire messages.
//! - `transport`: the seam that opens duplex streams, plus its error type.
//! - `call`: one duplex stream session with no retry logic.
//! - `connection`: lifecycle manager owning calls, retries and subscriptions.
//! - `client`: connection factory and the websocket transport.
//! - `session`: channel-backed wrapper exposing events as an async stream.

/// Single duplex stream session.
pub mod call;
/// Connection factory and websocket transport.
pub mod client;
/// Connection state machine.
pub mod connection;
/// Stream protocol messages.
pub mod proto;
/// Session wrapper that buffers events and tracks the latest payloads.
pub mod session;
/// Transport trait and error classification.
pub mod transport;

#[cfg(test)]
mod testing;
