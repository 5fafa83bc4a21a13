//! In-process publish point between the watcher side and the hub side.

use loopwatch_core::ChangeEvent;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

/// Everything the watcher side reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchNotification {
    /// A watch was registered and is delivering events.
    Ready { project_id: String },
    /// A debounced, classified change.
    Change(ChangeEvent),
    /// Runtime failure on an active watch. The watch stays registered.
    Error { project_id: String, message: String },
}

/// Cloneable handle to the change bus. Listeners register with
/// [`ChangeBus::subscribe`].
#[derive(Debug, Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<WatchNotification>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish without waiting. Having no listeners is not an error.
    pub fn publish(&self, notification: WatchNotification) {
        if self.tx.send(notification).is_err() {
            tracing::trace!("bus: no listeners");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchNotification> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}
