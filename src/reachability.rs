//! Network reachability signal consumed by stream connections.
//!
//! Detecting reachability is platform work and lives outside this crate. A
//! connection only needs the current value and a way to observe changes, which
//! is what [`Reachability`] exposes. [`ManualReachability`] is a settable
//! implementation: callers with their own platform monitor can feed it, and
//! tests use it to flip reachability deterministically.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// Source of "is the network currently reachable" notifications.
pub trait Reachability: Send + Sync + 'static {
    /// Returns the latest known reachability.
    fn currently_reachable(&self) -> bool;

    /// Returns a receiver that observes every reachability change.
    fn watch(&self) -> watch::Receiver<bool>;
}

/// Reachability signal driven explicitly through [`ManualReachability::set_reachable`].
///
/// Clones share the same underlying signal.
#[derive(Clone)]
pub struct ManualReachability {
    tx: Arc<watch::Sender<bool>>,
}

impl ManualReachability {
    /// Creates a signal with the given initial value.
    pub fn new(reachable: bool) -> Self {
        let (tx, _rx) = watch::channel(reachable);
        Self { tx: Arc::new(tx) }
    }

    /// Publishes a new reachability value.
    ///
    /// Setting the value it already holds does not notify watchers, so only
    /// real transitions reach connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.tx.send_if_modified(|current| {
            if *current == reachable {
                return false;
            }
            *current = reachable;
            true
        });
    }
}

impl Default for ManualReachability {
    fn default() -> Self {
        Self::new(true)
    }
}

impl fmt::Debug for ManualReachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualReachability")
            .field("reachable", &*self.tx.borrow())
            .finish()
    }
}

impl Reachability for ManualReachability {
    fn currently_reachable(&self) -> bool {
        *self.tx.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
