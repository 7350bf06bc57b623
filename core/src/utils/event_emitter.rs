//! Event bus: subscribe/notify channel between the chat core and UI views
use crate::chat_types::ChatEvent;
use tokio::sync::broadcast;
use tracing::trace;

/// Cloneable handle onto one broadcast channel per chat session
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChatEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ChatEvent) {
        if self.tx.send(event).is_err() {
            trace!("chat event dropped: no subscribers");
        }
    }

    /// New receiver; it sees events emitted from now on.
    /// A receiver that falls behind gets `RecvError::Lagged` and may resync
    /// by reading a fresh snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(ChatEvent::ConversationsChanged);
        assert!(matches!(a.recv().await.unwrap(), ChatEvent::ConversationsChanged));
        assert!(matches!(b.recv().await.unwrap(), ChatEvent::ConversationsChanged));
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(8);
        bus.emit(ChatEvent::ConversationsChanged);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
