//! Stream client factory and websocket transport.
//!
//! [`PlasmaClient`] holds the endpoint description and connection defaults.
//! Each call to [`PlasmaClient::connect`] hands out an independent
//! [`Connection`]; connections share only the read-only [`WsSession`]
//! descriptor and the reachability signal.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use futures_util::{FutureExt, SinkExt, StreamExt};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::reachability::{ManualReachability, Reachability};
use crate::retry::{with_timeout, DEFAULT_RECONNECT_DELAY};
use crate::stream::connection::{Connection, ConnectionOptions, DebugLog, EventHandler};
use crate::stream::proto::{Payload, PayloadMsg, Request};
use crate::stream::transport::{DuplexStream, Transport, TransportError};

/// Defaults applied by [`PlasmaClient::new`].
pub struct StreamDefaults;

impl StreamDefaults {
    /// Fixed delay before every automatic reconnect.
    pub const RETRY_DELAY: Duration = DEFAULT_RECONNECT_DELAY;
    /// Upper bound on opening one websocket stream.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Request path of the event stream.
    pub const PATH: &'static str = "/events";
}

/// Channel security for the websocket endpoint.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TransportSecurity {
    /// Plain `ws://`, for local and test services.
    Insecure,
    /// `wss://` verified against the bundled web PKI roots.
    #[default]
    Tls,
}

impl TransportSecurity {
    fn scheme(self) -> &'static str {
        match self {
            Self::Insecure => "ws",
            Self::Tls => "wss",
        }
    }
}

/// Errors returned when a client cannot hand out a connection.
#[derive(Debug, Error)]
pub enum ClientError {
    /// `connect` ran outside a tokio runtime and none was configured.
    #[error("no tokio runtime available; connect from within a runtime or set one with with_runtime")]
    NoRuntime,

    /// The configured host, port or path does not form a valid websocket URL.
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
}

/// Entry point for creating stream connections.
#[derive(Clone)]
pub struct PlasmaClient {
    host: String,
    port: u16,
    security: TransportSecurity,
    path: String,
    connect_timeout: Duration,
    retry_delay: Duration,
    reachability: Arc<dyn Reachability>,
    transport_override: Option<Arc<dyn Transport>>,
    runtime: Option<Handle>,
    debug_log: Option<DebugLog>,
}

impl PlasmaClient {
    /// Creates a client for `host:port` using TLS and the default path.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().trim().to_string(),
            port,
            security: TransportSecurity::default(),
            path: StreamDefaults::PATH.to_string(),
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
            retry_delay: StreamDefaults::RETRY_DELAY,
            reachability: Arc::new(ManualReachability::default()),
            transport_override: None,
            runtime: None,
            debug_log: None,
        }
    }

    pub fn with_security(mut self, security: TransportSecurity) -> Self {
        self.security = security;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the request path. A missing leading `/` is added.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        self
    }

    /// Overrides the fixed delay before each automatic reconnect.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the reachability signal shared by every connection from this
    /// client. Defaults to an always-reachable signal.
    pub fn with_reachability(mut self, reachability: Arc<dyn Reachability>) -> Self {
        self.reachability = reachability;
        self
    }

    /// Sets the runtime that drives connection tasks. Without it, `connect`
    /// uses the runtime it is called from.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Enables human-readable trace lines for every connection.
    pub fn with_debug_log(mut self, log: DebugLog) -> Self {
        self.debug_log = Some(log);
        self
    }

    /// Replaces the websocket transport, for example with an in-process one.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport_override = Some(transport);
        self
    }

    /// Websocket URL connections are opened against.
    pub fn endpoint(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.security.scheme(),
            self.host,
            self.port,
            self.path
        )
    }

    /// Builds the read-only session descriptor, validating the endpoint.
    pub fn session(&self) -> Result<WsSession, ClientError> {
        let endpoint = self.endpoint();
        let invalid = |reason: String| ClientError::InvalidEndpoint {
            endpoint: endpoint.clone(),
            reason,
        };
        if self.host.is_empty() {
            return Err(invalid("host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(invalid("port must be non-zero".to_string()));
        }
        endpoint
            .as_str()
            .into_client_request()
            .map_err(|err| invalid(err.to_string()))?;

        Ok(WsSession {
            url: endpoint.clone(),
            connect_timeout: self.connect_timeout,
        })
    }

    /// Opens a new connection allowing `retry_budget` automatic reconnects.
    ///
    /// Returns immediately; the first stream opens in the background and its
    /// outcome is reported through `handler` like any later failure.
    pub fn connect<H>(&self, retry_budget: u32, handler: H) -> Result<Connection, ClientError>
    where
        H: EventHandler,
    {
        let runtime = match &self.runtime {
            Some(runtime) => runtime.clone(),
            None => Handle::try_current().map_err(|_| ClientError::NoRuntime)?,
        };
        let transport: Arc<dyn Transport> = match &self.transport_override {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(self.session()?),
        };

        let mut options = ConnectionOptions::new(retry_budget).with_retry_delay(self.retry_delay);
        options.debug_log = self.debug_log.clone();

        debug!(
            event = "client_connect",
            endpoint = %self.endpoint(),
            retry_budget
        );
        Ok(Connection::open(
            &runtime,
            transport,
            Arc::clone(&self.reachability),
            options,
            handler,
        ))
    }
}

impl fmt::Debug for PlasmaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlasmaClient")
            .field("endpoint", &self.endpoint())
            .field("connect_timeout", &self.connect_timeout)
            .field("retry_delay", &self.retry_delay)
            .field("custom_transport", &self.transport_override.is_some())
            .finish_non_exhaustive()
    }
}

/// Websocket session descriptor: where and how to open one stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsSession {
    url: String,
    connect_timeout: Duration,
}

impl WsSession {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Transport for WsSession {
    fn open_duplex(&self) -> BoxFuture<'static, Result<DuplexStream, TransportError>> {
        open_websocket(self.url.clone(), self.connect_timeout).boxed()
    }
}

async fn open_websocket(url: String, timeout: Duration) -> Result<DuplexStream, TransportError> {
    let (socket, _) = with_timeout(timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;
    debug!(event = "websocket_open", url = %url);

    let (write, read) = socket.split::<Message>();
    let requests = write
        .sink_map_err(TransportError::from)
        .with(|request: Request| future::ready(encode_request(&request)));

    let payloads = futures_util::stream::unfold(read, |mut read| async move {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => return Some((decode_payload(&text), read)),
                Some(Ok(Message::Binary(bytes))) => {
                    let decoded = serde_json::from_slice::<PayloadMsg>(&bytes)
                        .map(PayloadMsg::into_payload)
                        .map_err(TransportError::from);
                    return Some((decoded, read));
                }
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Some((Err(TransportError::from(err)), read)),
            }
        }
    })
    .boxed();

    Ok(DuplexStream::new(Box::pin(requests), payloads))
}

fn encode_request(request: &Request) -> Result<Message, TransportError> {
    Ok(Message::Text(request.to_text()?))
}

fn decode_payload(text: &str) -> Result<Payload, TransportError> {
    Ok(PayloadMsg::from_text(text)?.into_payload())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_tungstenite::tungstenite::Message;

    use super::{
        decode_payload, encode_request, ClientError, PlasmaClient, StreamDefaults,
        TransportSecurity,
    };
    use crate::stream::connection::{ConnectionState, Event};
    use crate::stream::proto::{Payload, Request};
    use crate::stream::testing::{settle, FakeTransport, Recorder};
    use crate::stream::transport::{Transport, TransportError};

    #[test]
    fn endpoint_defaults_to_tls_and_events_path() {
        let client = PlasmaClient::new("events.example.com", 443);
        assert_eq!(client.endpoint(), "wss://events.example.com:443/events");
        assert_eq!(
            client.session().expect("session").connect_timeout(),
            StreamDefaults::CONNECT_TIMEOUT
        );
    }

    #[test]
    fn endpoint_honours_security_and_path() {
        let client = PlasmaClient::new(" localhost \n", 8080)
            .with_security(TransportSecurity::Insecure)
            .with_path("v2/stream");
        assert_eq!(client.endpoint(), "ws://localhost:8080/v2/stream");
    }

    #[test]
    fn invalid_endpoints_are_rejected() {
        let empty = PlasmaClient::new("", 443).session();
        assert!(matches!(empty, Err(ClientError::InvalidEndpoint { .. })));

        let zero_port = PlasmaClient::new("localhost", 0).session();
        assert!(matches!(zero_port, Err(ClientError::InvalidEndpoint { .. })));

        let spaced = PlasmaClient::new("bad host", 443).session();
        assert!(matches!(spaced, Err(ClientError::InvalidEndpoint { .. })));
    }

    #[test]
    fn connect_outside_a_runtime_fails() {
        let client = PlasmaClient::new("localhost", 8080);
        let result = client.connect(1, |_event: Event| {});
        assert!(matches!(result, Err(ClientError::NoRuntime)));
    }

    #[test]
    fn requests_encode_as_text_frames() {
        let frame = encode_request(&Request::ForceClose).expect("encode");
        assert_eq!(
            frame,
            Message::Text(r#"{"events":[],"forceClose":true}"#.to_string())
        );
    }

    #[test]
    fn text_frames_decode_to_payloads() {
        let payload =
            decode_payload(r#"{"eventType":{"type":"price"},"data":"42"}"#).expect("decode");
        assert_eq!(payload, Payload::new("price", "42"));
        assert!(matches!(
            decode_payload("not json"),
            Err(TransportError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let session = PlasmaClient::new("127.0.0.1", port)
            .with_security(TransportSecurity::Insecure)
            .with_connect_timeout(Duration::from_secs(2))
            .session()
            .expect("session");
        let err = session.open_duplex().await.expect_err("nothing listens");
        assert!(matches!(err, TransportError::Unavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn connections_from_one_client_are_independent() {
        let transport = FakeTransport::new();
        let client = PlasmaClient::new("localhost", 8080)
            .with_transport(Arc::new(transport.clone()))
            .with_retry_delay(Duration::from_millis(100));

        let first_events = Recorder::new();
        let second_events = Recorder::new();
        let first = client.connect(1, first_events.handler()).expect("connect");
        let second = client.connect(1, second_events.handler()).expect("connect");
        first.subscribe(["a"]);
        second.subscribe(["b"]);
        settle().await;

        let streams = transport.streams();
        assert_eq!(streams.len(), 2);
        let (first_stream, second_stream) =
            if streams[0].requests() == vec![Request::Subscribe(["a"].into_iter().collect())] {
                (&streams[0], &streams[1])
            } else {
                (&streams[1], &streams[0])
            };
        first_stream.push_payload("a", "only first");
        settle().await;
        first.shutdown();
        first_stream.push_payload("a", "after shutdown");
        second_stream.push_payload("b", "only second");
        settle().await;

        assert_eq!(first_events.payloads(), vec![Payload::new("a", "only first")]);
        assert_eq!(
            second_events.payloads(),
            vec![Payload::new("b", "only second")]
        );
        assert_eq!(first.state(), ConnectionState::Closed);
        assert_eq!(second.state(), ConnectionState::Streaming);
    }
}
