//! Event dispatch for engine observers
//!
//! Provides:
//! - A broadcast-based dispatcher generic over the event type
//! - Subscription via `tokio::sync::broadcast` receivers
//!
//! The socket fan-out layer subscribes here and forwards events to
//! connected clients; the dispatcher itself never blocks the engine.

use tokio::sync::broadcast;

/// Event dispatcher for publishing events to subscribers
pub struct EventDispatcher<E> {
    /// Broadcast sender channel for events.
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventDispatcher<E> {
    /// Create a new event dispatcher
    ///
    /// # Arguments
    /// * `buffer_size` - Size of the broadcast buffer (default 256)
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size);
        Self { tx }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers
    ///
    /// A send error only means there are no live receivers, which is a
    /// normal condition while no client is attached; it is ignored.
    pub fn publish(&self, event: E) {
        let _ = self.tx.send(event);
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone> Clone for EventDispatcher<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: Clone> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatches_to_all_subscribers() {
        let dispatcher: EventDispatcher<String> = EventDispatcher::default();
        let mut a = dispatcher.subscribe();
        let mut b = dispatcher.subscribe();

        dispatcher.publish("hello".to_string());

        assert_eq!(a.recv().await.unwrap(), "hello");
        assert_eq!(b.recv().await.unwrap(), "hello");
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let dispatcher: EventDispatcher<u32> = EventDispatcher::new(8);
        dispatcher.publish(42);
        assert_eq!(dispatcher.subscriber_count(), 0);
    }
}
