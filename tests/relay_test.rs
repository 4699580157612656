//! Integration tests for the cross-instance relay: two registries sharing a
//! backbone must exchange room events without duplicate delivery or loops.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use tokio::sync::mpsc;

use taller_chat_server::auth::Identity;
use taller_chat_server::chat::protocol::{now_iso, ServerFrame};
use taller_chat_server::chat::registry::ChatRegistry;
use taller_chat_server::relay::{
    self, event_channel, EventBus, MemoryBus, RelayEvent, EVENT_CHANNEL_PATTERN,
};

fn identity(user_id: i64, nombre: &str) -> Identity {
    Identity {
        user_id,
        nombre: nombre.to_string(),
        role: "cliente".to_string(),
    }
}

fn connect(reg: &Arc<ChatRegistry>, chat_id: i64, user_id: i64, nombre: &str) -> mpsc::Receiver<Message> {
    let (tx, rx) = mpsc::channel(64);
    reg.register(chat_id, &identity(user_id, nombre), tx);
    rx
}

fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let Message::Text(text) = msg {
            frames.push(serde_json::from_str(text.as_str()).expect("valid frame JSON"));
        }
    }
    frames
}

fn notification(texto: &str) -> ServerFrame {
    ServerFrame::SystemNotification {
        mensaje: texto.to_string(),
        notification_type: "info".to_string(),
        timestamp: now_iso(),
    }
}

fn count_tipo(frames: &[serde_json::Value], tipo: &str) -> usize {
    frames.iter().filter(|f| f["tipo"] == tipo).count()
}

/// Give spawned listeners and publish tasks a moment to settle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn room_events_cross_instances_exactly_once() {
    let bus: Arc<dyn EventBus> = Arc::new(MemoryBus::new());
    let a = ChatRegistry::new(bus.clone(), "instancia-a".to_string());
    let b = ChatRegistry::new(bus.clone(), "instancia-b".to_string());
    relay::spawn_relay_listener(bus.clone(), a.clone());
    relay::spawn_relay_listener(bus.clone(), b.clone());
    settle().await;

    let mut rx_ana = connect(&a, 42, 1, "Ana");
    settle().await;
    let mut rx_luis = connect(&b, 42, 2, "Luis");
    settle().await;

    // Luis's arrival on B was announced to Ana on A through the backbone.
    let ana_frames = drain(&mut rx_ana);
    assert_eq!(count_tipo(&ana_frames, "user_connected"), 1);
    drain(&mut rx_luis);

    a.broadcast_to_room(42, &notification("hola desde A"), None);
    settle().await;

    // Ana (local) and Luis (relayed) each receive exactly one copy: the
    // origin filter drops A's own event when it comes back off the bus.
    assert_eq!(count_tipo(&drain(&mut rx_ana), "system_notification"), 1);
    assert_eq!(count_tipo(&drain(&mut rx_luis), "system_notification"), 1);
}

#[tokio::test]
async fn relayed_events_are_not_republished() {
    let bus: Arc<dyn EventBus> = Arc::new(MemoryBus::new());
    let b = ChatRegistry::new(bus.clone(), "instancia-b".to_string());
    relay::spawn_relay_listener(bus.clone(), b.clone());

    // Observe everything that crosses the backbone.
    let mut spy = bus.subscribe(EVENT_CHANNEL_PATTERN).await;
    settle().await;

    let mut rx_luis = connect(&b, 42, 2, "Luis");
    settle().await;
    drain(&mut rx_luis);
    // Luis's registration published exactly one event (user_connected).
    assert!(spy.try_recv().is_ok());
    assert!(spy.try_recv().is_err());

    // A foreign event arrives on the shared channel.
    let foreign = RelayEvent {
        origen: "instancia-a".to_string(),
        chat_id: 42,
        evento: serde_json::to_value(notification("hola desde A")).unwrap(),
    };
    bus.publish(&event_channel(42), serde_json::to_vec(&foreign).unwrap())
        .await;
    settle().await;

    // B delivered it locally...
    assert_eq!(count_tipo(&drain(&mut rx_luis), "system_notification"), 1);
    // ...and put nothing back on the bus beyond the original.
    assert!(spy.try_recv().is_ok(), "the foreign event itself");
    assert!(
        spy.try_recv().is_err(),
        "a relayed event must never be republished"
    );
}

#[tokio::test]
async fn backbone_events_with_own_origin_are_dropped() {
    let bus: Arc<dyn EventBus> = Arc::new(MemoryBus::new());
    let a = ChatRegistry::new(bus.clone(), "instancia-a".to_string());
    relay::spawn_relay_listener(bus.clone(), a.clone());
    settle().await;

    let mut rx_ana = connect(&a, 42, 1, "Ana");
    settle().await;
    drain(&mut rx_ana);

    a.broadcast_to_room(42, &notification("hola"), None);
    settle().await;

    // The MemoryBus loops the event straight back to A's own listener;
    // delivery must still happen exactly once.
    assert_eq!(count_tipo(&drain(&mut rx_ana), "system_notification"), 1);
}

#[tokio::test]
async fn relay_listener_stops_on_registry_shutdown() {
    let bus: Arc<dyn EventBus> = Arc::new(MemoryBus::new());
    let a = ChatRegistry::new(bus.clone(), "instancia-a".to_string());
    let handle = relay::spawn_relay_listener(bus.clone(), a.clone());
    settle().await;

    a.close();
    settle().await;
    assert!(handle.is_finished());
}
