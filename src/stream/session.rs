//! Channel-backed session over a single connection.
//!
//! `StreamSession` installs a handler that forwards every [`Event`] into an
//! unbounded channel, so callers can consume the flow with `recv().await` or
//! as a [`Stream`]. It also remembers the latest payload seen per event type.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

use crate::stream::client::{ClientError, PlasmaClient};
use crate::stream::connection::{Connection, ConnectionState, Event};
use crate::stream::proto::{EventType, Payload};

/// Stateful wrapper around a [`Connection`].
#[derive(Debug)]
pub struct StreamSession {
    connection: Connection,
    receiver: mpsc::UnboundedReceiver<Event>,
    latest: HashMap<EventType, Payload>,
}

impl StreamSession {
    /// Opens a connection from `client` whose events feed this session.
    pub fn connect(client: &PlasmaClient, retry_budget: u32) -> Result<Self, ClientError> {
        let (tx, receiver) = mpsc::unbounded_channel();
        let connection = client.connect(retry_budget, move |event: Event| {
            let _ = tx.send(event);
        })?;
        Ok(Self {
            connection,
            receiver,
            latest: HashMap::new(),
        })
    }

    /// Replaces the subscription set of the underlying connection.
    pub fn subscribe<I, T>(&self, event_types: I) -> &Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EventType>,
    {
        self.connection.subscribe(event_types);
        self
    }

    /// Receives the next event.
    ///
    /// Returns `None` after [`StreamSession::close`] once events queued before
    /// the close have been drained.
    pub async fn recv(&mut self) -> Option<Event> {
        let event = self.receiver.recv().await?;
        self.observe(&event);
        Some(event)
    }

    /// Latest payload received for `event_type`, if any.
    pub fn latest(&self, event_type: &str) -> Option<&Payload> {
        self.latest.get(event_type)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Shuts the connection down. Idempotent.
    pub fn close(&self) {
        self.connection.shutdown();
    }

    fn observe(&mut self, event: &Event) {
        if let Event::Next(payload) = event {
            self.latest
                .insert(payload.event_type.clone(), payload.clone());
        }
    }
}

impl Stream for StreamSession {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        let this = self.get_mut();
        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                this.observe(&event);
                Poll::Ready(Some(event))
            }
            other => other,
        }
    }
}
