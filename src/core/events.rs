// src/core/events.rs

//! Defines the event bus used to notify listeners about cluster lifecycle
//! changes, topology refreshes, and per-node failures.

use crate::core::cluster::ClusterStatus;
use tokio::sync::broadcast;
use tracing::trace;

/// The capacity of the broadcast channel for cluster events.
/// Large enough to absorb bursts of node add/remove events during a
/// full topology reconcile without lagging slow listeners.
const EVENT_BUS_CAPACITY: usize = 1024;

/// An observable event emitted by the cluster.
///
/// Status events carry the new status and fire on every transition; delivery
/// is asynchronous, so listeners registered in the same call path still
/// observe the transition.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// The cluster status changed; the payload names the new state.
    Status(ClusterStatus),
    /// A node client was added to the connection pool (`+node`).
    NodeAdded(String),
    /// A node client was removed from the connection pool (`-node`).
    NodeRemoved(String),
    /// A node client reported an unrecoverable error (`node error`).
    NodeError { node: String, message: String },
    /// The slot-to-node topology was rebuilt.
    Refresh,
    /// A fatal topology failure (e.g. every refresh candidate failed).
    Error(String),
    /// The connection pool went from non-empty to empty.
    Drain,
}

/// The `EventBus` is the distribution hub for all cluster events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClusterEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Publishes an event to all subscribers. It's okay if there are none.
    pub fn publish(&self, event: ClusterEvent) {
        if self.sender.send(event.clone()).is_err() {
            trace!("published {:?} with no active listeners", event);
        }
    }

    /// Provides a new receiver subscribed to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
