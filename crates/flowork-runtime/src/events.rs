//! Event publishing for runtime notifications.
//!
//! The runtime only publishes; whoever embeds it decides what listens. The
//! default [`BroadcastEventBus`] fans events out over a tokio broadcast
//! channel.

use crate::component::ComponentKind;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default channel capacity for the broadcast bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Topic published after every discovery scan.
pub const COMPONENT_LIST_CHANGED: &str = "COMPONENT_LIST_CHANGED";

/// Payload of [`COMPONENT_LIST_CHANGED`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentListChanged {
    #[serde(rename = "type")]
    pub kind: ComponentKind,
    pub count: usize,
}

/// A published event.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeEvent {
    pub topic: String,
    pub payload: serde_json::Value,
}

/// Sink for runtime events.
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, payload: serde_json::Value);
}

/// Event bus backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<Arc<RuntimeEvent>>,
}

impl BroadcastEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RuntimeEvent>> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, topic: &str, payload: serde_json::Value) {
        let event = Arc::new(RuntimeEvent {
            topic: topic.to_string(),
            payload,
        });
        match self.sender.send(event) {
            Ok(receivers) => debug!(topic, receivers, "Event published"),
            // No receivers - this is fine
            Err(_) => trace!(topic, "No receivers for event"),
        }
    }
}

/// Publish a [`ComponentListChanged`] event.
pub fn publish_list_changed(bus: &dyn EventBus, kind: ComponentKind, count: usize) {
    let payload = ComponentListChanged { kind, count };
    match serde_json::to_value(&payload) {
        Ok(value) => bus.publish(COMPONENT_LIST_CHANGED, value),
        Err(e) => debug!("Failed to serialize list change event: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_delivers_list_changed() {
        let bus = BroadcastEventBus::new();
        let mut receiver = bus.subscribe();

        publish_list_changed(&bus, ComponentKind::Tool, 3);

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.topic, COMPONENT_LIST_CHANGED);
        assert_eq!(event.payload["type"], "tool");
        assert_eq!(event.payload["count"], 3);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = BroadcastEventBus::new();
        bus.publish("anything", serde_json::json!({}));
    }
}
