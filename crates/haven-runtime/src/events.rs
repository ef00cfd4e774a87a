//! Event bus for decoupled notification of host surfaces.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use haven_core::{OperationKind, QueuedOperation};

/// Events published by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HavenEvent {
    /// A write was durably queued for later replay
    OfflineOperationQueued {
        id: Uuid,
        kind: OperationKind,
        collection: String,
        record_id: String,
        pending: usize,
    },

    /// A drain cycle finished with nothing left to replay
    SyncCompleted { synced: usize },

    /// A drain cycle left work behind
    SyncFailed {
        synced: usize,
        failed: usize,
        remaining: usize,
        reason: String,
    },

    CircuitOpened { service: String, failures: u32 },

    CircuitClosed { service: String },

    /// The primary store failed and the alternate path took the write
    StorageDegraded { region: String, reason: String },

    /// Both persistence paths failed
    DataAtRisk { region: String, reason: String },
}

impl HavenEvent {
    pub fn queued(op: &QueuedOperation, pending: usize) -> Self {
        HavenEvent::OfflineOperationQueued {
            id: op.id,
            kind: op.kind,
            collection: op.collection.clone(),
            record_id: op.record_id.clone(),
            pending,
        }
    }

    /// Wire name, matching the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            HavenEvent::OfflineOperationQueued { .. } => "offline-operation-queued",
            HavenEvent::SyncCompleted { .. } => "sync-completed",
            HavenEvent::SyncFailed { .. } => "sync-failed",
            HavenEvent::CircuitOpened { .. } => "circuit-opened",
            HavenEvent::CircuitClosed { .. } => "circuit-closed",
            HavenEvent::StorageDegraded { .. } => "storage-degraded",
            HavenEvent::DataAtRisk { .. } => "data-at-risk",
        }
    }
}

/// Broadcasts [`HavenEvent`]s to any number of subscribers.
///
/// Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HavenEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: HavenEvent) {
        tracing::debug!(event = event.name(), "Emitting event");
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HavenEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
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
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(HavenEvent::CircuitClosed {
            service: "insight-service".to_string(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "circuit-closed");
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(1);
        bus.emit(HavenEvent::SyncCompleted { synced: 0 });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_serialized_tag_matches_name() {
        let event = HavenEvent::DataAtRisk {
            region: "offlineQueue".to_string(),
            reason: "disk full".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.name());
    }
}
