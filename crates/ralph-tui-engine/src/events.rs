//! Engine event bus.
//!
//! Fan-out over a bounded broadcast channel: each subscriber gets its
//! own queue, a slow subscriber drops its oldest events and observes a
//! lag marker, and nothing a subscriber does can stall the loop.

use tokio::sync::broadcast;

use ralph_tui_core::EngineEvent;

/// Default per-subscriber queue depth.
const DEFAULT_CAPACITY: usize = 1024;

/// What a subscription yields.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// An engine event, in emission order.
    Event(EngineEvent),
    /// The subscriber fell behind and `skipped` events were dropped.
    Lagged(u64),
}

/// Broadcast-backed event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Bus with the given per-subscriber queue depth.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to every live subscriber.
    pub fn emit(&self, event: EngineEvent) {
        // No subscribers is fine; events are fire-and-forget.
        let _ = self.sender.send(event);
    }

    /// Open a new subscription starting at the next event.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.sender.subscribe(),
            lagging: false,
        }
    }
}

/// One subscriber's view of the event stream.
pub struct EventSubscription {
    rx: broadcast::Receiver<EngineEvent>,
    lagging: bool,
}

impl EventSubscription {
    /// Next bus event; `None` once the engine is gone.
    pub async fn next(&mut self) -> Option<BusEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(BusEvent::Event(event)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                self.lagging = true;
                tracing::warn!(skipped, "event subscriber lagged, dropping oldest events");
                Some(BusEvent::Lagged(skipped))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Whether this subscription has ever dropped events.
    #[must_use]
    pub const fn is_lagging(&self) -> bool {
        self.lagging
    }
}
