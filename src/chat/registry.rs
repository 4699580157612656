//! Connection registry: owns every live chat connection and both of its
//! indices (room membership and the reverse handle index), guarded together
//! by a single mutex so no reader ever observes them torn.
//!
//! All fan-out goes through per-connection outbound queues; the registry
//! never awaits while holding the lock. A failed queue push degrades to a
//! disconnect of that one connection and never aborts delivery to the rest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::Identity;
use crate::chat::protocol::{now_iso, ActiveUser, ServerFrame};
use crate::relay::{event_channel, EventBus, RelayEvent};

/// Opaque handle for one registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

/// Outbound queue sender for one connection. The actor's writer task owns
/// the receiving end and is the only writer on the socket.
pub type WsSender = mpsc::Sender<Message>;

/// Everything the router needs to service a frame from a connection,
/// resolved in O(1) from the reverse index.
#[derive(Debug, Clone)]
pub struct ConnContext {
    pub chat_id: i64,
    pub user_id: i64,
    pub user_name: String,
    pub user_role: String,
}

struct ConnectionEntry {
    sender: WsSender,
    chat_id: i64,
    user_id: i64,
    user_name: String,
    user_role: String,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryInner {
    /// Room membership index: chat_id -> connections in that room.
    /// A key is removed, not emptied, when its last member leaves.
    rooms: HashMap<i64, Vec<ConnId>>,
    /// Reverse index: handle -> connection record.
    conns: HashMap<ConnId, ConnectionEntry>,
}

/// Point-in-time connection statistics. Key names follow the wire vocabulary.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub active_chats: usize,
    pub chats: HashMap<i64, usize>,
}

pub struct ChatRegistry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
    bus: Arc<dyn EventBus>,
    instance_id: String,
    shutdown: CancellationToken,
}

impl ChatRegistry {
    pub fn new(bus: Arc<dyn EventBus>, instance_id: String) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner::default()),
            next_id: AtomicU64::new(0),
            bus,
            instance_id,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Token cancelled on `close()`; the reaper and relay listener stop on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an accepted connection: insert into both indices, announce
    /// `user_connected` to the rest of the room, then send the newcomer an
    /// `active_users` snapshot of the other current members.
    pub fn register(&self, chat_id: i64, identity: &Identity, sender: WsSender) -> ConnId {
        let conn_id = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let now = Utc::now();

        {
            let mut inner = self.lock();
            inner.conns.insert(
                conn_id,
                ConnectionEntry {
                    sender: sender.clone(),
                    chat_id,
                    user_id: identity.user_id,
                    user_name: identity.nombre.clone(),
                    user_role: identity.role.clone(),
                    connected_at: now,
                    last_activity: now,
                },
            );
            inner.rooms.entry(chat_id).or_default().push(conn_id);
        }

        tracing::info!(
            user = %identity.nombre,
            user_id = identity.user_id,
            chat_id,
            "User connected to chat"
        );

        self.broadcast_to_room(
            chat_id,
            &ServerFrame::UserConnected {
                user_id: identity.user_id,
                user_name: identity.nombre.clone(),
                user_role: identity.role.clone(),
                timestamp: now_iso(),
            },
            Some(identity.user_id),
        );

        let usuarios = self.room_members_except(chat_id, conn_id);
        let _ = sender.try_send(
            ServerFrame::ActiveUsers {
                usuarios,
                timestamp: now_iso(),
            }
            .to_message(),
        );

        conn_id
    }

    /// Disconnect a connection. Idempotent: an unknown or already-removed
    /// handle is a no-op, never an error — disconnect races are expected.
    pub fn disconnect(&self, conn_id: ConnId, reason: &str) {
        let entry = {
            let mut inner = self.lock();
            let Some(entry) = inner.conns.remove(&conn_id) else {
                return;
            };
            if let Some(members) = inner.rooms.get_mut(&entry.chat_id) {
                members.retain(|id| *id != conn_id);
                if members.is_empty() {
                    inner.rooms.remove(&entry.chat_id);
                }
            }
            entry
        };

        // Best-effort transport close through the outbound queue; if the
        // writer is already gone this is a no-op.
        let _ = entry.sender.try_send(Message::Close(Some(CloseFrame {
            code: 1000,
            reason: reason.to_string().into(),
        })));

        tracing::info!(
            user = %entry.user_name,
            user_id = entry.user_id,
            chat_id = entry.chat_id,
            reason,
            "User disconnected from chat"
        );

        self.broadcast_to_room(
            entry.chat_id,
            &ServerFrame::UserDisconnected {
                user_id: entry.user_id,
                user_name: entry.user_name,
                reason: reason.to_string(),
                timestamp: now_iso(),
            },
            None,
        );
    }

    /// Broadcast a frame to every live connection in a room, except those
    /// belonging to `exclude_user`, and republish it on the relay backbone.
    pub fn broadcast_to_room(&self, chat_id: i64, frame: &ServerFrame, exclude_user: Option<i64>) {
        self.broadcast_local(chat_id, frame, exclude_user);
        self.publish_relay(chat_id, frame);
    }

    /// Room fan-out without relay republishing. The relay listener uses this
    /// for externally-originated events so they never loop back onto the bus.
    pub fn broadcast_local(&self, chat_id: i64, frame: &ServerFrame, exclude_user: Option<i64>) {
        self.fanout(chat_id, frame.to_message(), exclude_user);
    }

    /// Deliver an already-serialized relayed event to local room members.
    pub fn broadcast_relayed(&self, chat_id: i64, evento: &serde_json::Value) {
        self.fanout(chat_id, Message::Text(evento.to_string().into()), None);
    }

    /// Send to every connection of one user, across all rooms. Used for
    /// notifications that are not room-scoped.
    pub fn broadcast_to_user(&self, user_id: i64, frame: &ServerFrame) {
        let targets: Vec<(ConnId, WsSender)> = {
            let inner = self.lock();
            inner
                .conns
                .iter()
                .filter(|(_, e)| e.user_id == user_id)
                .map(|(id, e)| (*id, e.sender.clone()))
                .collect()
        };
        self.deliver(targets, frame.to_message());
    }

    /// Direct reply to a single connection (pong replies).
    pub fn send_personal(&self, conn_id: ConnId, frame: &ServerFrame) {
        let target = {
            let inner = self.lock();
            inner.conns.get(&conn_id).map(|e| (conn_id, e.sender.clone()))
        };
        if let Some(target) = target {
            self.deliver(vec![target], frame.to_message());
        }
    }

    /// Refresh a connection's activity stamp on inbound traffic.
    pub fn touch(&self, conn_id: ConnId) {
        let mut inner = self.lock();
        if let Some(entry) = inner.conns.get_mut(&conn_id) {
            entry.last_activity = Utc::now();
        }
    }

    pub fn context(&self, conn_id: ConnId) -> Option<ConnContext> {
        let inner = self.lock();
        inner.conns.get(&conn_id).map(|e| ConnContext {
            chat_id: e.chat_id,
            user_id: e.user_id,
            user_name: e.user_name.clone(),
            user_role: e.user_role.clone(),
        })
    }

    /// Point-in-time snapshot of a room's live members, in acquisition order.
    pub fn room_members(&self, chat_id: i64) -> Vec<ActiveUser> {
        self.collect_members(chat_id, None)
    }

    fn room_members_except(&self, chat_id: i64, exclude: ConnId) -> Vec<ActiveUser> {
        self.collect_members(chat_id, Some(exclude))
    }

    fn collect_members(&self, chat_id: i64, exclude: Option<ConnId>) -> Vec<ActiveUser> {
        let inner = self.lock();
        let Some(ids) = inner.rooms.get(&chat_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter(|id| Some(**id) != exclude)
            .filter_map(|id| inner.conns.get(id))
            .map(|e| ActiveUser {
                user_id: e.user_id,
                user_name: e.user_name.clone(),
                user_role: e.user_role.clone(),
                connected_at: e.connected_at.to_rfc3339(),
                last_activity: e.last_activity.to_rfc3339(),
                is_active: !e.sender.is_closed(),
            })
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.lock();
        RegistryStats {
            total_connections: inner.conns.len(),
            active_chats: inner.rooms.len(),
            chats: inner
                .rooms
                .iter()
                .map(|(chat_id, members)| (*chat_id, members.len()))
                .collect(),
        }
    }

    /// Snapshot of connections idle longer than `timeout`. The reaper acts
    /// on the returned handles after this lock is released.
    pub fn idle_connections(&self, timeout: Duration) -> Vec<ConnId> {
        let now = Utc::now();
        let inner = self.lock();
        inner
            .conns
            .iter()
            .filter(|(_, e)| {
                (now - e.last_activity).to_std().unwrap_or_default() > timeout
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Shut the registry down: stop the reaper and relay listener, then
    /// disconnect every connection.
    pub fn close(&self) {
        self.shutdown.cancel();
        let ids: Vec<ConnId> = {
            let inner = self.lock();
            inner.conns.keys().copied().collect()
        };
        for conn_id in ids {
            self.disconnect(conn_id, "server_shutdown");
        }
        tracing::info!("Chat registry closed");
    }

    fn fanout(&self, chat_id: i64, msg: Message, exclude_user: Option<i64>) {
        let targets: Vec<(ConnId, WsSender)> = {
            let inner = self.lock();
            let Some(ids) = inner.rooms.get(&chat_id) else {
                return;
            };
            ids.iter()
                .filter_map(|id| {
                    let entry = inner.conns.get(id)?;
                    if exclude_user == Some(entry.user_id) {
                        return None;
                    }
                    Some((*id, entry.sender.clone()))
                })
                .collect()
        };
        self.deliver(targets, msg);
    }

    /// Push a message onto each target's outbound queue. A full or closed
    /// queue marks that connection broken; the rest still get the message.
    fn deliver(&self, targets: Vec<(ConnId, WsSender)>, msg: Message) {
        let mut delivered = Vec::new();
        let mut broken = Vec::new();

        for (conn_id, sender) in targets {
            match sender.try_send(msg.clone()) {
                Ok(()) => delivered.push(conn_id),
                Err(e) => {
                    tracing::warn!(?conn_id, error = %e, "Broken connection detected during send");
                    broken.push(conn_id);
                }
            }
        }

        if !delivered.is_empty() {
            let now = Utc::now();
            let mut inner = self.lock();
            for conn_id in &delivered {
                if let Some(entry) = inner.conns.get_mut(conn_id) {
                    entry.last_activity = now;
                }
            }
        }

        for conn_id in broken {
            self.disconnect(conn_id, "connection_broken");
        }
    }

    fn publish_relay(&self, chat_id: i64, frame: &ServerFrame) {
        let Ok(evento) = serde_json::to_value(frame) else {
            return;
        };
        let event = RelayEvent {
            origen: self.instance_id.clone(),
            chat_id,
            evento,
        };
        let Ok(payload) = serde_json::to_vec(&event) else {
            return;
        };
        let bus = self.bus.clone();
        let channel = event_channel(chat_id);
        tokio::spawn(async move {
            bus.publish(&channel, payload).await;
        });
    }
}
