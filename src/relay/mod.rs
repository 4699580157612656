//! Cross-instance event relay.
//!
//! Room events are republished on a shared pub/sub backbone so users connected
//! to different server instances still see each other's traffic. The backbone
//! is a capability interface: a no-op implementation serves single-instance
//! deployments, an in-process bus serves multi-instance tests, and the Redis
//! implementation serves production.

pub mod redis;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::chat::registry::ChatRegistry;

/// Envelope published on the backbone for every room broadcast.
/// `origen` tags the publishing instance; an instance drops events carrying
/// its own tag instead of re-broadcasting them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEvent {
    pub origen: String,
    pub chat_id: i64,
    pub evento: serde_json::Value,
}

/// One message received from a backbone subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Shared pub/sub backbone. Publishing is best-effort: implementations log
/// failures and never propagate them into the broadcast path.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>);

    /// Subscribe to all channels matching a glob pattern. The receiver ends
    /// when the backbone goes away for good.
    async fn subscribe(&self, pattern: &str) -> mpsc::UnboundedReceiver<BusMessage>;
}

/// Channel name for one room's events.
pub fn event_channel(chat_id: i64) -> String {
    format!("chat:events:{chat_id}")
}

/// Subscription pattern covering every room channel.
pub const EVENT_CHANNEL_PATTERN: &str = "chat:events:*";

/// Backbone for single-instance deployments: publishes into the void,
/// subscriptions yield nothing.
pub struct NoopBus;

#[async_trait]
impl EventBus for NoopBus {
    async fn publish(&self, _channel: &str, _payload: Vec<u8>) {}

    async fn subscribe(&self, _pattern: &str) -> mpsc::UnboundedReceiver<BusMessage> {
        let (_tx, rx) = mpsc::unbounded_channel();
        rx
    }
}

/// In-process backbone: every publish is delivered to every matching
/// subscriber, including ones registered by the publishing instance — exactly
/// the loopback shape a shared broker has, which is what the relay's
/// origin-filtering is tested against.
#[derive(Default)]
pub struct MemoryBus {
    subscribers: Mutex<Vec<(String, mpsc::UnboundedSender<BusMessage>)>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|(pattern, tx)| {
            if !glob_match(pattern, channel) {
                return !tx.is_closed();
            }
            tx.send(BusMessage {
                channel: channel.to_string(),
                payload: payload.clone(),
            })
            .is_ok()
        });
    }

    async fn subscribe(&self, pattern: &str) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((pattern.to_string(), tx));
        rx
    }
}

/// Minimal glob matching for channel patterns: `*` matches any suffix.
fn glob_match(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

/// Spawn the relay listener: consume backbone events and replay foreign ones
/// into the local registry. Stops on registry shutdown or backbone loss.
pub fn spawn_relay_listener(
    bus: Arc<dyn EventBus>,
    registry: Arc<ChatRegistry>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = bus.subscribe(EVENT_CHANNEL_PATTERN).await;
        let cancel = registry.shutdown_token();

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    match serde_json::from_slice::<RelayEvent>(&msg.payload) {
                        Ok(event) => {
                            if event.origen == registry.instance_id() {
                                // Own event already delivered locally
                                continue;
                            }
                            tracing::debug!(
                                chat_id = event.chat_id,
                                origen = %event.origen,
                                "Relaying event to local room members"
                            );
                            registry.broadcast_relayed(event.chat_id, &event.evento);
                        }
                        Err(e) => {
                            tracing::warn!(channel = %msg.channel, error = %e, "Undecodable relay event");
                        }
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_room_channels() {
        assert!(glob_match("chat:events:*", "chat:events:42"));
        assert!(glob_match("chat:events:42", "chat:events:42"));
        assert!(!glob_match("chat:events:42", "chat:events:43"));
        assert!(!glob_match("chat:events:*", "otros:events:42"));
    }

    #[test]
    fn relay_event_roundtrip() {
        let event = RelayEvent {
            origen: "instancia-a".into(),
            chat_id: 42,
            evento: serde_json::json!({"tipo": "user_typing", "user_id": 1}),
        };
        let bytes = serde_json::to_vec(&event).unwrap();
        let decoded: RelayEvent = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.origen, "instancia-a");
        assert_eq!(decoded.chat_id, 42);
        assert_eq!(decoded.evento["tipo"], "user_typing");
    }

    #[tokio::test]
    async fn memory_bus_delivers_to_matching_subscribers() {
        let bus = MemoryBus::new();
        let mut room_rx = bus.subscribe("chat:events:*").await;
        let mut other_rx = bus.subscribe("otros:*").await;

        bus.publish(&event_channel(7), b"payload".to_vec()).await;

        let msg = room_rx.try_recv().unwrap();
        assert_eq!(msg.channel, "chat:events:7");
        assert_eq!(msg.payload, b"payload");
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn noop_bus_subscription_is_silent() {
        let bus = NoopBus;
        bus.publish("chat:events:1", b"x".to_vec()).await;
        let mut rx = bus.subscribe(EVENT_CHANNEL_PATTERN).await;
        assert!(rx.recv().await.is_none());
    }
}
