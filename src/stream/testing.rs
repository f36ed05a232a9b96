//! In-memory transport and helpers for connection and call tests.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Sink, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::stream::connection::Event;
use crate::stream::proto::{Payload, Request};
use crate::stream::transport::{DuplexStream, Transport, TransportError};

type Inbound = Option<Result<Payload, TransportError>>;

/// Lets spawned tasks run and nudges paused time forward by a millisecond.
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
struct FakeState {
    open_failures: VecDeque<TransportError>,
    streams: Vec<FakeStream>,
    failed_opens: usize,
}

/// Transport whose streams are driven by the test.
#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Makes the next open attempt fail with `err`.
    pub(crate) fn fail_next_open(&self, err: TransportError) {
        self.state.lock().open_failures.push_back(err);
    }

    pub(crate) fn streams(&self) -> Vec<FakeStream> {
        self.state.lock().streams.clone()
    }

    pub(crate) fn latest(&self) -> FakeStream {
        self.state
            .lock()
            .streams
            .last()
            .cloned()
            .expect("no stream has been opened")
    }

    pub(crate) fn open_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    pub(crate) fn failed_open_count(&self) -> usize {
        self.state.lock().failed_opens
    }

    /// Streams whose receive side is still held by a call.
    pub(crate) fn live_count(&self) -> usize {
        self.state
            .lock()
            .streams
            .iter()
            .filter(|stream| !stream.is_released())
            .count()
    }

    fn open_now(&self) -> Result<DuplexStream, TransportError> {
        let mut state = self.state.lock();
        if let Some(err) = state.open_failures.pop_front() {
            state.failed_opens += 1;
            return Err(err);
        }

        let (payload_tx, payload_rx) = mpsc::unbounded_channel::<Inbound>();
        let stream = FakeStream {
            payload_tx,
            requests: Arc::new(Mutex::new(Vec::new())),
            fail_sends: Arc::new(AtomicBool::new(false)),
            sink_closed: Arc::new(AtomicBool::new(false)),
        };
        state.streams.push(stream.clone());

        let sink = FakeSink {
            requests: Arc::clone(&stream.requests),
            fail_sends: Arc::clone(&stream.fail_sends),
            closed: Arc::clone(&stream.sink_closed),
        };
        let payloads = futures_util::stream::unfold(payload_rx, |mut rx| async move {
            match rx.recv().await {
                Some(Some(item)) => Some((item, rx)),
                _ => None,
            }
        })
        .boxed();

        Ok(DuplexStream::new(Box::pin(sink), payloads))
    }
}

impl Transport for FakeTransport {
    fn open_duplex(&self) -> BoxFuture<'static, Result<DuplexStream, TransportError>> {
        let result = self.open_now();
        async move { result }.boxed()
    }
}

/// Server side of one fake stream.
#[derive(Clone)]
pub(crate) struct FakeStream {
    payload_tx: mpsc::UnboundedSender<Inbound>,
    requests: Arc<Mutex<Vec<Request>>>,
    fail_sends: Arc<AtomicBool>,
    sink_closed: Arc<AtomicBool>,
}

impl FakeStream {
    pub(crate) fn push_payload(&self, event_type: &str, data: &str) {
        let _ = self
            .payload_tx
            .send(Some(Ok(Payload::new(event_type, data))));
    }

    pub(crate) fn push_error(&self, err: TransportError) {
        let _ = self.payload_tx.send(Some(Err(err)));
    }

    pub(crate) fn end(&self) {
        let _ = self.payload_tx.send(None);
    }

    pub(crate) fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Requests that reached the "server", in order.
    pub(crate) fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    /// `true` once the receive side has been dropped.
    pub(crate) fn is_released(&self) -> bool {
        self.payload_tx.is_closed()
    }

    pub(crate) fn sink_closed(&self) -> bool {
        self.sink_closed.load(Ordering::SeqCst)
    }
}

struct FakeSink {
    requests: Arc<Mutex<Vec<Request>>>,
    fail_sends: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl Sink<Request> for FakeSink {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Request) -> Result<(), Self::Error> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("send failed".to_string()));
        }
        self.requests.lock().push(item);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.closed.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

/// Handler that records every delivered event.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn handler(&self) -> impl Fn(Event) + Send + Sync + 'static {
        let events = Arc::clone(&self.events);
        move |event| events.lock().push(event)
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub(crate) fn errors(&self) -> Vec<TransportError> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Error(err) => Some(err.clone()),
                Event::Next(_) => None,
            })
            .collect()
    }

    pub(crate) fn payloads(&self) -> Vec<Payload> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Next(payload) => Some(payload.clone()),
                Event::Error(_) => None,
            })
            .collect()
    }
}
