//! In-memory update event bus.
//!
//! Signals "a fetch or invalidation for this key just finished" to every
//! repository, independently of the store's change feed: a pure cache hit
//! writes nothing yet must still end a loading state.
//!
//! Built on a tokio broadcast channel. Publishing never blocks; events are
//! delivered to every subscriber active at publish time in publish order.
//! A subscriber that falls more than `capacity` events behind is told how
//! many it missed and should resynchronize from the store.

use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default number of buffered events per subscriber.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Completed,
    Invalidated,
}

/// A bus event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEvent {
    pub key: String,
    pub kind: UpdateKind,
}

/// Multicast notification channel shared by the orchestrator and
/// repositories.
#[derive(Debug, Clone)]
pub struct UpdateBus {
    tx: broadcast::Sender<UpdateEvent>,
}

impl Default for UpdateBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl UpdateBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; `CacheConfig::validate` rejects that.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers reached.
    pub fn publish(&self, event: UpdateEvent) -> usize {
        match self.tx.send(event) {
            Ok(receivers) => {
                debug!(receivers, "update event published");
                receivers
            }
            Err(broadcast::error::SendError(event)) => {
                debug!(key = %event.key, "update event dropped: no subscribers");
                0
            }
        }
    }

    pub fn completed(&self, key: &str) -> usize {
        self.publish(UpdateEvent {
            key: key.to_string(),
            kind: UpdateKind::Completed,
        })
    }

    pub fn invalidated(&self, key: &str) -> usize {
        self.publish(UpdateEvent {
            key: key.to_string(),
            kind: UpdateKind::Invalidated,
        })
    }

    pub fn subscribe(&self) -> UpdateSubscription {
        UpdateSubscription {
            rx: self.tx.subscribe(),
        }
    }
}

/// Result of waiting on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    Event(UpdateEvent),
    /// Events were dropped for this subscriber.
    Lagged(u64),
}

/// One subscriber's view of the bus.
#[derive(Debug)]
pub struct UpdateSubscription {
    rx: broadcast::Receiver<UpdateEvent>,
}

impl UpdateSubscription {
    /// Next message, or `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        match self.rx.recv().await {
            Ok(event) => Some(BusMessage::Event(event)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "update bus subscriber lagged");
                Some(BusMessage::Lagged(skipped))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
