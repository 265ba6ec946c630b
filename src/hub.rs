//! The real-time push hub.
//!
//! The transport that carries these events to external UIs is out of scope;
//! this crate only produces them. Modeled as a `tokio::sync::broadcast`
//! channel for fan-out event delivery to any number of subscribers.

use tokio::sync::broadcast;

use crate::search::SearchRecord;
use crate::transfers::Transfer;

/// Events published for external user interfaces and automation scripts to
/// observe. The three `Search.*` events are the daemon's primary push
/// surface; the analogous `Transfer.*` events are supplemented here since
/// the Transfer Tracker/Store produces the same kind of change notification
/// the Search Service does.
#[derive(Debug, Clone)]
pub enum HubEvent {
    SearchCreated(SearchRecord),
    SearchUpdated(SearchRecord),
    SearchDeleted(SearchRecord),
    TransferAdded(Transfer),
    TransferUpdated(Transfer),
    TransferRemoved(Transfer),
}

#[derive(Clone)]
pub struct Hub {
    tx: broadcast::Sender<HubEvent>,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    /// Broadcasts are best-effort: a lagging or absent receiver never blocks
    /// or fails the publisher.
    pub fn publish(&self, event: HubEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(256)
    }
}
