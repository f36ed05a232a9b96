//! Connection lifecycle manager.
//!
//! A [`Connection`] owns at most one live [`Call`], the caller's subscription
//! set and a retry budget. Every event a call produces passes through one
//! interception point: payloads go straight to the caller's handler, stream
//! failures are retried after a fixed delay while budget remains, suppressed
//! while the network is unreachable, and surfaced otherwise.
//!
//! State lives in a plain struct behind a single mutex. Work decided under the
//! lock is collected as [`Effects`] and carried out after the lock is released,
//! so handlers and the debug-log sink may call back into the connection.
//! Each attempt captures a generation number; callbacks from a call that has
//! since been replaced or cancelled carry a stale generation and are dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::reachability::Reachability;
use crate::retry::{ReconnectPolicy, RetryBudget};
use crate::stream::call::{Call, CallEvent, CallEvents};
use crate::stream::proto::{EventType, Payload, SubscriptionSet};
use crate::stream::transport::{Transport, TransportError};

/// Event delivered to the caller's handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Payload from the active stream.
    Next(Payload),
    /// A fault the connection will not hide. No `Next` follows unless the
    /// connection reconnects.
    Error(TransportError),
}

/// Receives events from a [`Connection`].
///
/// Handlers run outside the connection lock and may call `subscribe` or
/// `shutdown` on the connection that invoked them.
pub trait EventHandler: Send + Sync + 'static {
    fn on_event(&self, event: Event);
}

impl<F> EventHandler for F
where
    F: Fn(Event) + Send + Sync + 'static,
{
    fn on_event(&self, event: Event) {
        self(event)
    }
}

/// Optional sink for human-readable trace lines.
pub type DebugLog = Arc<dyn Fn(&str) + Send + Sync>;

/// Lifecycle state of a [`Connection`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// A stream is being opened.
    Connecting,
    /// A stream is open and its receive loop is running.
    Streaming,
    /// A reconnect is scheduled.
    Backoff,
    /// No stream and no reconnect pending. Waiting for the network to become
    /// reachable or for [`Connection::reconnect`].
    Disconnected,
    /// Terminal.
    Closed,
}

/// Per-connection settings.
#[derive(Clone, Default)]
pub struct ConnectionOptions {
    pub reconnect: ReconnectPolicy,
    /// Receives a trace line for connect, subscribe, error and reconnect
    /// activity. Disabled when `None`.
    pub debug_log: Option<DebugLog>,
}

impl ConnectionOptions {
    /// Options allowing `max_retries` automatic reconnects.
    pub fn new(max_retries: u32) -> Self {
        Self {
            reconnect: ReconnectPolicy::new(max_retries),
            debug_log: None,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.reconnect.delay = delay;
        self
    }

    pub fn with_debug_log(mut self, log: DebugLog) -> Self {
        self.debug_log = Some(log);
        self
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("reconnect", &self.reconnect)
            .field("debug_log", &self.debug_log.is_some())
            .finish()
    }
}

/// Caller-facing handle managing call lifecycle, retries and subscriptions.
///
/// Dropping the handle shuts the connection down.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Creates a connection and immediately starts opening its first stream.
    ///
    /// Background work (stream tasks, reconnect timers, the reachability
    /// watcher) is spawned on `runtime`.
    pub fn open<H>(
        runtime: &Handle,
        transport: Arc<dyn Transport>,
        reachability: Arc<dyn Reachability>,
        options: ConnectionOptions,
        handler: H,
    ) -> Self
    where
        H: EventHandler,
    {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            transport,
            reachability,
            budget_limit: options.reconnect.max_retries,
            retry_delay: options.reconnect.delay,
            runtime: runtime.clone(),
            debug_log: options.debug_log,
            delivery: ReentrantMutex::new(()),
            state_tx,
            inner: Mutex::new(Inner {
                state: ConnectionState::Connecting,
                generation: 0,
                call: None,
                subscription: SubscriptionSet::new(),
                budget: options.reconnect.budget(),
                exhausted: false,
                handler: Some(Arc::new(handler) as Arc<dyn EventHandler>),
                retry_timer: None,
                monitor: None,
            }),
        });

        let mut fx = Effects::default();
        {
            let mut inner = shared.inner.lock();
            inner.monitor = Some(shared.spawn_reachability_monitor());
            shared.begin_attempt(&mut inner, &mut fx);
        }
        shared.apply(fx);

        Self { shared }
    }

    /// Replaces the subscription set.
    ///
    /// The new set goes to the active stream right away; while no stream is
    /// active it is stored and sent when the next one opens. Returns `self`
    /// for chaining.
    pub fn subscribe<I, T>(&self, event_types: I) -> &Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EventType>,
    {
        let events: SubscriptionSet = event_types.into_iter().collect();
        let mut fx = Effects::default();
        {
            let mut inner = self.shared.inner.lock();
            if let Some(call) = &inner.call {
                call.subscribe(&events);
            }
            fx.trace("subscribe", format!("subscribed to {events}"));
            inner.subscription = events;
        }
        self.shared.apply(fx);
        self
    }

    /// Cancels the active stream and closes the connection for good.
    ///
    /// Idempotent. Once this returns the handler receives nothing further,
    /// whatever the transport or the network does next. The transport may
    /// still be finishing its own teardown in the background.
    pub fn shutdown(&self) {
        let mut fx = Effects::default();
        {
            let mut inner = self.shared.inner.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            self.shared.close(&mut inner);
            fx.trace("shutdown", "connection closed".to_string());
        }
        self.shared.apply(fx);

        // Wait out a delivery that is running on another thread.
        drop(self.shared.delivery.lock());
    }

    /// Restores the retry budget and opens a fresh stream.
    ///
    /// Returns `false` when the connection is already closed.
    pub fn reconnect(&self) -> bool {
        let mut fx = Effects::default();
        {
            let mut inner = self.shared.inner.lock();
            if inner.state == ConnectionState::Closed {
                return false;
            }
            inner.budget.reset();
            inner.exhausted = false;
            fx.trace("reconnect", "reconnect requested by caller".to_string());
            self.shared.begin_attempt(&mut inner, &mut fx);
        }
        self.shared.apply(fx);
        true
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Observes state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// The stored subscription set.
    pub fn subscriptions(&self) -> SubscriptionSet {
        self.shared.inner.lock().subscription.clone()
    }

    /// Automatic reconnects left before the next retryable failure is surfaced.
    pub fn retries_remaining(&self) -> u32 {
        self.shared.inner.lock().budget.remaining()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Connection")
            .field("state", &inner.state)
            .field("subscription", &inner.subscription)
            .field("retries_remaining", &inner.budget.remaining())
            .finish_non_exhaustive()
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    reachability: Arc<dyn Reachability>,
    budget_limit: u32,
    retry_delay: Duration,
    runtime: Handle,
    debug_log: Option<DebugLog>,
    /// Held while the handler runs; `shutdown` passes through it.
    delivery: ReentrantMutex<()>,
    state_tx: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
}

struct Inner {
    state: ConnectionState,
    generation: u64,
    call: Option<Call>,
    subscription: SubscriptionSet,
    budget: RetryBudget,
    exhausted: bool,
    handler: Option<Arc<dyn EventHandler>>,
    retry_timer: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

enum Delivery {
    Next { generation: u64, payload: Payload },
    Error(TransportError),
}

/// Work decided under the lock, performed after it is released.
#[derive(Default)]
struct Effects {
    traces: Vec<(&'static str, String)>,
    delivery: Option<Delivery>,
}

impl Effects {
    fn trace(&mut self, event: &'static str, detail: String) {
        self.traces.push((event, detail));
    }

    fn next(&mut self, generation: u64, payload: Payload) {
        self.delivery = Some(Delivery::Next {
            generation,
            payload,
        });
    }

    fn error(&mut self, err: TransportError) {
        self.delivery = Some(Delivery::Error(err));
    }
}

impl Shared {
    fn apply(&self, fx: Effects) {
        for (event, detail) in fx.traces {
            debug!(event, detail = %detail);
            if let Some(log) = &self.debug_log {
                log(&format!("{event}: {detail}"));
            }
        }
        if let Some(delivery) = fx.delivery {
            self.deliver(delivery);
        }
    }

    fn deliver(&self, delivery: Delivery) {
        let _gate = self.delivery.lock();
        let handler = {
            let inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            if let Delivery::Next { generation, .. } = &delivery {
                if *generation != inner.generation {
                    return;
                }
            }
            match &inner.handler {
                Some(handler) => Arc::clone(handler),
                None => return,
            }
        };

        match delivery {
            Delivery::Next { payload, .. } => handler.on_event(Event::Next(payload)),
            Delivery::Error(err) => {
                warn!(event = "stream_error_forwarded", error = %err);
                handler.on_event(Event::Error(err));
            }
        }
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        inner.state = state;
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Cancels the active call (if any) and invalidates every callback and
    /// timer tied to the current generation.
    fn release_call(&self, inner: &mut Inner) {
        inner.generation += 1;
        if let Some(timer) = inner.retry_timer.take() {
            timer.abort();
        }
        if let Some(call) = inner.call.take() {
            call.cancel();
        }
    }

    fn close(&self, inner: &mut Inner) {
        self.release_call(inner);
        if let Some(monitor) = inner.monitor.take() {
            monitor.abort();
        }
        inner.handler = None;
        self.set_state(inner, ConnectionState::Closed);
    }

    fn begin_attempt(self: &Arc<Self>, inner: &mut Inner, fx: &mut Effects) {
        self.release_call(inner);
        let generation = inner.generation;
        self.set_state(inner, ConnectionState::Connecting);
        fx.trace("connect", format!("opening stream (generation {generation})"));

        let shared = Arc::clone(self);
        self.runtime.spawn(shared.run_attempt(generation));
    }

    async fn run_attempt(self: Arc<Self>, generation: u64) {
        let events = self.call_events(generation);
        // An open failure has already been reported through `events`.
        let Ok(mut call) = Call::open(self.transport.as_ref(), events).await else {
            return;
        };

        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != ConnectionState::Connecting {
                fx.trace(
                    "connect",
                    format!("discarding stream opened for superseded generation {generation}"),
                );
                call.cancel();
            } else {
                call.start(&inner.subscription);
                fx.trace(
                    "connected",
                    format!("streaming with subscription {}", inner.subscription),
                );
                inner.call = Some(call);
                self.set_state(&mut inner, ConnectionState::Streaming);
            }
        }
        self.apply(fx);
    }

    fn call_events(self: &Arc<Self>, generation: u64) -> CallEvents {
        let shared = Arc::clone(self);
        Arc::new(move |event: CallEvent| shared.on_call_event(generation, event))
    }

    fn on_call_event(self: &Arc<Self>, generation: u64, event: CallEvent) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state == ConnectionState::Closed {
                return;
            }
            match event {
                CallEvent::Payload(payload) => fx.next(generation, payload),
                CallEvent::SendFailed(err) => {
                    if self.reachability.currently_reachable() {
                        fx.trace("send_failed", err.to_string());
                        fx.error(err);
                    } else {
                        fx.trace("suppressed", format!("send failure while unreachable: {err}"));
                    }
                }
                CallEvent::Failed(err) => self.on_failure(&mut inner, err, &mut fx),
                CallEvent::Ended => {
                    fx.trace("ended", "stream ended by the service".to_string());
                    self.on_failure(&mut inner, TransportError::Closed, &mut fx);
                }
            }
        }
        self.apply(fx);
    }

    fn on_failure(self: &Arc<Self>, inner: &mut Inner, err: TransportError, fx: &mut Effects) {
        self.release_call(inner);

        if !self.reachability.currently_reachable() {
            self.set_state(inner, ConnectionState::Disconnected);
            fx.trace("suppressed", format!("stream error while unreachable: {err}"));
            return;
        }

        if !err.is_retryable() {
            self.set_state(inner, ConnectionState::Disconnected);
            fx.trace("error", format!("non-retryable stream error: {err}"));
            fx.error(err);
            return;
        }

        match inner.budget.try_consume() {
            Some(attempt) => {
                self.schedule_retry(inner);
                fx.trace(
                    "reconnect",
                    format!(
                        "retry {attempt} of {} in {:?} after: {err}",
                        self.budget_limit, self.retry_delay
                    ),
                );
            }
            None => {
                inner.exhausted = true;
                self.set_state(inner, ConnectionState::Disconnected);
                fx.trace("error", format!("retry budget exhausted: {err}"));
                fx.error(err);
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, inner: &mut Inner) {
        self.set_state(inner, ConnectionState::Backoff);
        let generation = inner.generation;
        let delay = self.retry_delay;
        let shared = Arc::clone(self);
        inner.retry_timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            shared.fire_retry(generation);
        }));
    }

    fn fire_retry(self: &Arc<Self>, generation: u64) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != ConnectionState::Backoff {
                return;
            }
            // This task is the timer; let it finish on its own.
            inner.retry_timer = None;
            self.begin_attempt(&mut inner, &mut fx);
        }
        self.apply(fx);
    }

    fn spawn_reachability_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.reachability.watch();
        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            // Every wake follows at least one transition. A false/true pair
            // coalesced into `true` must still reach `on_reachability`, since a
            // failure may have been suppressed while the signal read false.
            while changes.changed().await.is_ok() {
                let reachable = *changes.borrow_and_update();
                shared.on_reachability(reachable);
            }
        })
    }

    fn on_reachability(self: &Arc<Self>, reachable: bool) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            match (reachable, inner.state) {
                (_, ConnectionState::Closed) => return,
                (true, ConnectionState::Connecting | ConnectionState::Streaming) => {
                    fx.trace("reachability", "reachable; stream already active".to_string());
                }
                (true, _) if inner.exhausted => {
                    fx.trace(
                        "reachability",
                        "reachable; retry budget exhausted, not reconnecting".to_string(),
                    );
                }
                (true, _) => {
                    fx.trace("reachability", "reachable; reconnecting".to_string());
                    self.begin_attempt(&mut inner, &mut fx);
                }
                (false, _) if inner.exhausted => {
                    fx.trace(
                        "reachability",
                        "unreachable after retry budget exhausted; closing".to_string(),
                    );
                    self.close(&mut inner);
                }
                (false, _) => {
                    self.release_call(&mut inner);
                    self.set_state(&mut inner, ConnectionState::Disconnected);
                    fx.trace("reachability", "unreachable; stream torn down".to_string());
                }
            }
        }
        self.apply(fx);
    }
}
