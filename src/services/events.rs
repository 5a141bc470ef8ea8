//! Event system for hierarchy operations
//!
//! Services announce completed mutations on a broadcast bus. Subscribers
//! use them for audit trails and cache invalidation; nothing in the core
//! depends on anyone listening.

use tokio::sync::broadcast;
use tracing::trace;

use crate::entities::OrgType;
use crate::store::DocPath;

/// Events emitted by services after a successful commit
#[derive(Debug, Clone, PartialEq)]
pub enum HierarchyEvent {
    ReferencesRepaired {
        parent_id: String,
        parent_type: OrgType,
        cleared: Vec<DocPath>,
    },
    CascadeCompleted {
        chain: String,
        root: DocPath,
        archived: usize,
    },
    ClaimsChanged {
        user_id: String,
        claim: String,
    },
    ClaimsPublished {
        user_id: String,
    },
}

/// Broadcast bus for hierarchy events
pub struct EventBus {
    sender: broadcast::Sender<HierarchyEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: HierarchyEvent) {
        trace!(event = ?event, "Emitting hierarchy event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HierarchyEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(HierarchyEvent::ClaimsChanged {
            user_id: "u1".into(),
            claim: "super_admin".into(),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, HierarchyEvent::ClaimsChanged { ref user_id, .. } if user_id == "u1"));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::with_capacity(4);
        bus.emit(HierarchyEvent::ClaimsPublished { user_id: "u1".into() });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
