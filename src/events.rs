//! Event notifications for balancer state changes.
//!
//! Observers subscribe through [`EventBus::subscribe`] and receive
//! events over a broadcast channel. A slow subscriber lags and loses
//! old events; it never blocks the selection or probing paths.

use tokio::sync::broadcast;

/// Default broadcast channel capacity.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A state-change notification from a balancer instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalancerEvent {
    /// A backend was added to a balancer.
    ServerAdded {
        /// Balancer name.
        balancer: String,
        /// Backend id.
        server: String,
    },
    /// A backend was removed from a balancer.
    ServerRemoved {
        /// Balancer name.
        balancer: String,
        /// Backend id.
        server: String,
    },
    /// A backend's administrator-enabled flag changed.
    ServerEnabledChanged {
        /// Balancer name.
        balancer: String,
        /// Backend id.
        server: String,
        /// New enabled state.
        enabled: bool,
    },
    /// A backend was quarantined after repeated failures.
    ServerFailed {
        /// Balancer name.
        balancer: String,
        /// Backend id.
        server: String,
    },
    /// A backend recovered to the healthy state.
    ServerRecovered {
        /// Balancer name.
        balancer: String,
        /// Backend id.
        server: String,
    },
    /// A single health probe failed.
    HealthCheckFailed {
        /// Balancer name.
        balancer: String,
        /// Backend id.
        server: String,
    },
    /// A backend was chosen for a connection.
    ServerSelected {
        /// Balancer name.
        balancer: String,
        /// Backend id.
        server: String,
    },
}

/// Broadcast fan-out for balancer events.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<BalancerEvent>,
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Subscribe to balancer events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BalancerEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Dropped silently when nobody listens.
    pub fn publish(&self, event: BalancerEvent) {
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
