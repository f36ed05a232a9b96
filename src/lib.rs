//! Resilient client SDK for the Plasma event-streaming protocol.
//!
//! The crate is organized by concern:
//! - `stream`: duplex stream calls, the connection lifecycle manager, the
//!   websocket client and session helpers.
//! - `reachability`: network reachability signal consumed by connections.
//! - `retry`: retry budget, fixed reconnect delay and timeout helpers.

/// Network reachability signal.
pub mod reachability;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// Realtime stream client, protocol types, and connection lifecycle.
pub mod stream;

pub use reachability::{ManualReachability, Reachability};
pub use retry::{ReconnectPolicy, RetryBudget};
pub use stream::client::{ClientError, PlasmaClient, StreamDefaults, TransportSecurity};
pub use stream::connection::{Connection, ConnectionState, Event, EventHandler};
pub use stream::proto::{EventType, Payload};
pub use stream::session::StreamSession;
pub use stream::transport::TransportError;
