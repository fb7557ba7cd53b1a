//! Typed broadcast event bus.
//!
//! Each published payload is wrapped in an [`Envelope`] carrying a
//! monotonically increasing sequence number. Subscribers get their own
//! receiver; a slow or dropped subscriber never blocks the publisher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing sequence number assigned by EventBus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// Sequence of the first event.
    pub fn zero() -> Self {
        Self(0)
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Published event with bus metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Event id.
    pub id: EventId,
    /// Position in publish order.
    pub sequence: SequenceNumber,
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// The event.
    pub payload: T,
}

/// Configuration for the EventBus.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Capacity of the broadcast channel.
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Broadcast bus for one event type.
pub struct EventBus<T: Clone> {
    sender: broadcast::Sender<Envelope<T>>,
    sequence: AtomicU64,
}

impl<T: Clone> std::fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("sequence", &self.sequence.load(Ordering::SeqCst))
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl<T: Clone> EventBus<T> {
    /// Bus with the configured channel capacity.
    pub fn new(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Publish a payload and return the sequence number it was given.
    pub fn publish(&self, payload: T) -> SequenceNumber {
        let sequence = SequenceNumber(self.sequence.fetch_add(1, Ordering::SeqCst));
        let envelope = Envelope {
            id: EventId::new(),
            sequence,
            timestamp: Utc::now(),
            payload,
        };
        // no subscribers is fine
        let _ = self.sender.send(envelope);
        sequence
    }

    /// New receiver; sees events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope<T>> {
        self.sender.subscribe()
    }

    /// Sequence the next event will get.
    pub fn current_sequence(&self) -> SequenceNumber {
        SequenceNumber(self.sequence.load(Ordering::SeqCst))
    }

    /// Live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_sequence_assignment() {
        let bus: EventBus<&'static str> = EventBus::default();
        assert_eq!(bus.current_sequence(), SequenceNumber::zero());

        let mut rx = bus.subscribe();
        bus.publish("started");
        bus.publish("stopped");

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.sequence.0, 0);
        assert_eq!(first.payload, "started");
        assert_eq!(second.sequence.0, 1);
        assert_eq!(bus.current_sequence().0, 2);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus: EventBus<u32> = EventBus::new(EventBusConfig { channel_capacity: 4 });
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(1);

        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        bus.publish(2);
        assert_eq!(a.recv().await.unwrap().payload, 2);
        assert_eq!(b.recv().await.unwrap().payload, 2);
    }
}
