//! Transport seam between stream connections and the wire.
//!
//! A [`Transport`] opens duplex streams. Each [`DuplexStream`] is split into a
//! request sink and a payload stream so the receive loop and outbound sends
//! never contend for the same handle. Closing the sink releases the transport
//! side of the stream; dropping the payload stream releases the receive side.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::Sink;
use thiserror::Error;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::stream::proto::{Payload, Request};

/// Outbound half of a duplex stream.
pub type RequestSink = Pin<Box<dyn Sink<Request, Error = TransportError> + Send>>;

/// Inbound half of a duplex stream; `None` marks the end of the stream.
pub type PayloadStream = BoxStream<'static, Result<Payload, TransportError>>;

/// An opened duplex stream session.
pub struct DuplexStream {
    pub requests: RequestSink,
    pub payloads: PayloadStream,
}

impl DuplexStream {
    pub fn new(requests: RequestSink, payloads: PayloadStream) -> Self {
        Self { requests, payloads }
    }
}

impl fmt::Debug for DuplexStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexStream").finish_non_exhaustive()
    }
}

/// Opens duplex streams against a remote event service.
///
/// Implementations are shared read-only across connections.
pub trait Transport: Send + Sync + 'static {
    fn open_duplex(&self) -> BoxFuture<'static, Result<DuplexStream, TransportError>>;
}

/// Errors produced while opening, sending on, or receiving from a stream.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Service unavailable or a transient network failure.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Opening the stream did not finish in time.
    #[error("stream open timed out after {0:?}")]
    Timeout(Duration),

    /// The service refused the stream.
    #[error("stream rejected: {0}")]
    Rejected(String),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The stream was already closed.
    #[error("stream closed")]
    Closed,
}

impl TransportError {
    /// Returns `true` for causes worth a reconnect.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_) | Self::Closed)
    }
}

impl From<WsError> for TransportError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::Closed,
            WsError::Io(err) => Self::Unavailable(err.to_string()),
            WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                Self::Unavailable("connection reset without closing handshake".to_string())
            }
            WsError::Http(response) => {
                let status = response.status();
                if matches!(status.as_u16(), 502..=504) {
                    Self::Unavailable(format!("http status {status}"))
                } else {
                    Self::Rejected(format!("http status {status}"))
                }
            }
            err @ (WsError::Url(_) | WsError::HttpFormat(_)) => Self::Rejected(err.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
