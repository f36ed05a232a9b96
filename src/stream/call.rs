//! Single duplex stream session.
//!
//! A `Call` knows nothing about retries. It opens one stream, pushes requests
//! through a writer task, runs one receive loop, and reports everything it
//! sees through a [`CallEvents`] callback. Cancelling consumes the call.

use std::fmt;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::stream::proto::{Payload, Request, SubscriptionSet};
use crate::stream::transport::{PayloadStream, RequestSink, Transport, TransportError};

/// Notifications a call reports to its owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallEvent {
    /// Payload with a recognized event type.
    Payload(Payload),
    /// A request could not be sent. The call keeps running.
    SendFailed(TransportError),
    /// The stream failed to open or failed mid-session. Always the last event.
    Failed(TransportError),
    /// The stream ended or delivered an untagged payload. Always the last event.
    Ended,
}

/// Callback receiving [`CallEvent`]s from the writer and receive tasks.
pub type CallEvents = Arc<dyn Fn(CallEvent) + Send + Sync>;

/// One duplex stream session.
pub struct Call {
    requests: mpsc::UnboundedSender<Request>,
    payloads: Option<PayloadStream>,
    receiver: Option<JoinHandle<()>>,
    events: CallEvents,
    runtime: Handle,
}

impl Call {
    /// Opens a duplex stream and starts the request writer.
    ///
    /// On failure the cause is reported as [`CallEvent::Failed`] before it is
    /// returned, and no call is produced. The receive loop does not run until
    /// [`Call::start`].
    pub async fn open(
        transport: &dyn Transport,
        events: CallEvents,
    ) -> Result<Self, TransportError> {
        let duplex = match transport.open_duplex().await {
            Ok(duplex) => duplex,
            Err(err) => {
                debug!(event = "call_open_failed", error = %err);
                events(CallEvent::Failed(err.clone()));
                return Err(err);
            }
        };

        let runtime = Handle::current();
        let (requests, queue) = mpsc::unbounded_channel();
        runtime.spawn(run_writer(duplex.requests, queue, Arc::clone(&events)));

        Ok(Self {
            requests,
            payloads: Some(duplex.payloads),
            receiver: None,
            events,
            runtime,
        })
    }

    /// Sends the initial subscription (when non-empty) and arms the receive loop.
    ///
    /// Only the first call has any effect.
    pub fn start(&mut self, initial_events: &SubscriptionSet) {
        let Some(payloads) = self.payloads.take() else {
            return;
        };
        self.subscribe(initial_events);
        self.receiver = Some(
            self.runtime
                .spawn(run_receiver(payloads, Arc::clone(&self.events))),
        );
    }

    /// Returns `true` once the receive loop has been armed.
    pub fn is_streaming(&self) -> bool {
        self.receiver.is_some()
    }

    /// Replaces the server-side subscription. Empty sets are not sent.
    pub fn subscribe(&self, events: &SubscriptionSet) {
        if events.is_empty() {
            return;
        }
        self.send(Request::Subscribe(events.clone()));
    }

    /// Sends one `ForceClose` and releases the stream.
    ///
    /// The receive loop stops immediately; the writer flushes the force-close
    /// and closes the transport sink in the background.
    pub fn cancel(mut self) {
        debug!(event = "call_cancel", streaming = self.is_streaming());
        self.send(Request::ForceClose);
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
    }

    fn send(&self, request: Request) {
        if self.requests.send(request).is_err() {
            // Reported from a task: the owner may be holding its own lock here.
            let events = Arc::clone(&self.events);
            self.runtime.spawn(async move {
                events(CallEvent::SendFailed(TransportError::Closed));
            });
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("streaming", &self.is_streaming())
            .finish_non_exhaustive()
    }
}

async fn run_writer(
    mut sink: RequestSink,
    mut queue: mpsc::UnboundedReceiver<Request>,
    events: CallEvents,
) {
    while let Some(request) = queue.recv().await {
        let force_close = request.is_force_close();
        if let Err(err) = sink.send(request).await {
            debug!(event = "call_send_failed", force_close, error = %err);
            events(CallEvent::SendFailed(err));
        }
        if force_close {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn run_receiver(mut payloads: PayloadStream, events: CallEvents) {
    while let Some(item) = payloads.next().await {
        match item {
            Ok(payload) if payload.event_type.is_recognized() => {
                events(CallEvent::Payload(payload));
            }
            Ok(_) => break,
            Err(err) => {
                events(CallEvent::Failed(err));
                return;
            }
        }
    }
    events(CallEvent::Ended);
}
