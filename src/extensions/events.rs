//! Typed management events.

use tokio::sync::broadcast;

use super::permissions::PermissionSet;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementEvent {
    Startup { id: String },
    Ready { id: String },
    Shutdown { id: String },
    PermissionsChanged {
        id: String,
        added: PermissionSet,
        removed: PermissionSet,
    },
}

impl ManagementEvent {
    pub fn extension_id(&self) -> &str {
        match self {
            ManagementEvent::Startup { id }
            | ManagementEvent::Ready { id }
            | ManagementEvent::Shutdown { id }
            | ManagementEvent::PermissionsChanged { id, .. } => id,
        }
    }
}

/// Publish/subscribe bus for [`ManagementEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ManagementEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagementEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ManagementEvent) {
        tracing::trace!(?event, "management event");
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        bus.emit(ManagementEvent::Startup { id: "early".into() });

        let mut rx = bus.subscribe();
        bus.emit(ManagementEvent::Ready { id: "a".into() });
        let event = rx.recv().await.unwrap();
        assert_eq!(event, ManagementEvent::Ready { id: "a".into() });
        assert_eq!(event.extension_id(), "a");
    }
}
