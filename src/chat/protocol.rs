//! JSON wire protocol for the live chat: client frame decoding, server frame
//! types, and the per-frame dispatch that turns inbound frames into registry
//! broadcasts or persistence hand-offs.

use axum::extract::ws::Message;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::chat::registry::ConnId;
use crate::chat::store::PersistedMessage;
use crate::state::AppState;

/// Maximum chat message content length (chars).
const MAX_CONTENT_LENGTH: usize = 4000;

/// Wall-clock timestamp carried by every server frame.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Inbound client frame, tagged by `tipo`.
#[derive(Debug, Deserialize)]
#[serde(tag = "tipo", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    Typing,
    StopTyping,
    MessageRead {
        mensaje_id: i64,
    },
    ChatMessage {
        contenido: String,
        #[serde(default = "default_tipo_mensaje")]
        tipo_mensaje: String,
        #[serde(default)]
        archivo_url: Option<String>,
    },
}

fn default_tipo_mensaje() -> String {
    "texto".to_string()
}

/// One live member of a room, as reported in `active_users` snapshots and the
/// participants endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveUser {
    pub user_id: i64,
    pub user_name: String,
    pub user_role: String,
    pub connected_at: String,
    pub last_activity: String,
    pub is_active: bool,
}

/// Chat message payload inside a `nuevo_mensaje` frame. Carries the persisted
/// id and created_at, never client-supplied ones.
#[derive(Debug, Clone, Serialize)]
pub struct MensajePayload {
    pub id: i64,
    pub contenido: String,
    pub tipo_mensaje: String,
    pub remitente_id: i64,
    pub remitente_nombre: String,
    pub created_at: String,
    pub archivo_url: Option<String>,
}

impl From<&PersistedMessage> for MensajePayload {
    fn from(m: &PersistedMessage) -> Self {
        Self {
            id: m.id,
            contenido: m.contenido.clone(),
            tipo_mensaje: m.tipo_mensaje.clone(),
            remitente_id: m.remitente_id,
            remitente_nombre: m.remitente_nombre.clone(),
            created_at: m.created_at.clone(),
            archivo_url: m.archivo_url.clone(),
        }
    }
}

/// Outbound server frame, tagged by `tipo`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "tipo", rename_all = "snake_case")]
pub enum ServerFrame {
    UserConnected {
        user_id: i64,
        user_name: String,
        user_role: String,
        timestamp: String,
    },
    UserDisconnected {
        user_id: i64,
        user_name: String,
        reason: String,
        timestamp: String,
    },
    ActiveUsers {
        usuarios: Vec<ActiveUser>,
        timestamp: String,
    },
    UserTyping {
        user_id: i64,
        user_name: String,
        timestamp: String,
    },
    UserStopTyping {
        user_id: i64,
        user_name: String,
        timestamp: String,
    },
    NuevoMensaje {
        chat_id: i64,
        mensaje: MensajePayload,
        timestamp: String,
    },
    MessageRead {
        mensaje_id: i64,
        user_id: i64,
        timestamp: String,
    },
    Pong {
        timestamp: String,
    },
    SystemNotification {
        mensaje: String,
        notification_type: String,
        timestamp: String,
    },
    Error {
        mensaje: String,
        timestamp: String,
    },
}

impl ServerFrame {
    pub fn error(mensaje: &str) -> Self {
        Self::Error {
            mensaje: mensaje.to_string(),
            timestamp: now_iso(),
        }
    }

    /// Serialize into a WebSocket text message.
    pub fn to_message(&self) -> Message {
        // Serialization of these frames cannot fail; fall back to a bare error
        // object rather than panicking in a broadcast path.
        let text = serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"tipo":"error","mensaje":"Error interno del servidor"}"#.into());
        Message::Text(text.into())
    }
}

/// What the actor should do with the connection after a frame is handled.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    /// Defensive boundary: the frame came from a connection the registry does
    /// not know. The actor must tear the connection down.
    Terminate,
}

/// Handle one inbound text frame: decode, resolve connection context through
/// the reverse index, dispatch.
pub async fn handle_text(
    state: &AppState,
    conn_id: ConnId,
    tx: &mpsc::Sender<Message>,
    text: &str,
) -> Dispatch {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(error = %e, "Undecodable client frame");
            send_error(tx, "Formato de mensaje inválido");
            return Dispatch::Continue;
        }
    };

    // O(1) context lookup; a miss means the connection was never registered
    // (or was already evicted) and must not be serviced.
    let Some(ctx) = state.registry.context(conn_id) else {
        send_error(tx, "Conexión no autorizada");
        return Dispatch::Terminate;
    };

    match frame {
        ClientFrame::Ping => {
            state.registry.send_personal(
                conn_id,
                &ServerFrame::Pong {
                    timestamp: now_iso(),
                },
            );
        }
        ClientFrame::Typing => {
            state.registry.broadcast_to_room(
                ctx.chat_id,
                &ServerFrame::UserTyping {
                    user_id: ctx.user_id,
                    user_name: ctx.user_name.clone(),
                    timestamp: now_iso(),
                },
                Some(ctx.user_id),
            );
        }
        ClientFrame::StopTyping => {
            state.registry.broadcast_to_room(
                ctx.chat_id,
                &ServerFrame::UserStopTyping {
                    user_id: ctx.user_id,
                    user_name: ctx.user_name.clone(),
                    timestamp: now_iso(),
                },
                Some(ctx.user_id),
            );
        }
        ClientFrame::MessageRead { mensaje_id } => {
            match state.store.mark_message_read(mensaje_id, ctx.user_id).await {
                Ok(true) => {
                    state.registry.broadcast_to_room(
                        ctx.chat_id,
                        &ServerFrame::MessageRead {
                            mensaje_id,
                            user_id: ctx.user_id,
                            timestamp: now_iso(),
                        },
                        Some(ctx.user_id),
                    );
                }
                Ok(false) => send_error(tx, "Mensaje no encontrado"),
                Err(e) => {
                    tracing::error!(mensaje_id, error = %e, "Failed to mark message read");
                    send_error(tx, "Error interno del servidor");
                }
            }
        }
        ClientFrame::ChatMessage {
            contenido,
            tipo_mensaje,
            archivo_url,
        } => {
            let contenido = contenido.trim().to_string();
            if contenido.is_empty() {
                send_error(tx, "El mensaje no puede estar vacío");
                return Dispatch::Continue;
            }
            if contenido.len() > MAX_CONTENT_LENGTH {
                send_error(tx, "Mensaje demasiado largo");
                return Dispatch::Continue;
            }

            // Persist first: recipients must see the canonical id/timestamp,
            // never a client-supplied one.
            let nuevo = crate::chat::store::NewMessage {
                chat_id: ctx.chat_id,
                remitente_id: ctx.user_id,
                remitente_nombre: ctx.user_name.clone(),
                contenido,
                tipo_mensaje,
                archivo_url,
            };
            match state.store.persist_message(nuevo).await {
                Ok(persisted) => {
                    state.registry.broadcast_to_room(
                        ctx.chat_id,
                        &ServerFrame::NuevoMensaje {
                            chat_id: ctx.chat_id,
                            mensaje: MensajePayload::from(&persisted),
                            timestamp: now_iso(),
                        },
                        Some(ctx.user_id),
                    );
                    notify_absent_participants(state, ctx.chat_id, &persisted);
                }
                Err(e) => {
                    tracing::error!(chat_id = ctx.chat_id, error = %e, "Failed to persist message");
                    send_error(tx, "Error interno del servidor");
                }
            }
        }
    }

    Dispatch::Continue
}

/// Send an error frame directly to one connection's outbound queue.
/// The connection stays open — one bad frame never costs the session.
fn send_error(tx: &mpsc::Sender<Message>, mensaje: &str) {
    let _ = tx.try_send(ServerFrame::error(mensaje).to_message());
}

/// Fire-and-forget offline notification for room participants with no live
/// connection on this instance.
fn notify_absent_participants(state: &AppState, chat_id: i64, mensaje: &PersistedMessage) {
    let store = state.store.clone();
    let registry = state.registry.clone();
    let notifier = state.notifier.clone();
    let resumen = format!(
        "Nuevo mensaje de {} en el chat {}",
        mensaje.remitente_nombre, chat_id
    );

    tokio::spawn(async move {
        let participantes = match store.room_participants(chat_id).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(chat_id, error = %e, "Could not resolve participants for offline notify");
                return;
            }
        };

        let conectados: std::collections::HashSet<i64> = registry
            .room_members(chat_id)
            .into_iter()
            .map(|u| u.user_id)
            .collect();

        for user_id in participantes {
            if !conectados.contains(&user_id) {
                notifier.notify_offline(user_id, &resumen).await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_tipo_dispatch() {
        let frame: ClientFrame = serde_json::from_str(r#"{"tipo":"ping"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Ping));

        let frame: ClientFrame =
            serde_json::from_str(r#"{"tipo":"message_read","mensaje_id":7}"#).unwrap();
        assert!(matches!(frame, ClientFrame::MessageRead { mensaje_id: 7 }));
    }

    #[test]
    fn chat_message_defaults() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"tipo":"chat_message","contenido":"hola"}"#).unwrap();
        match frame {
            ClientFrame::ChatMessage {
                contenido,
                tipo_mensaje,
                archivo_url,
            } => {
                assert_eq!(contenido, "hola");
                assert_eq!(tipo_mensaje, "texto");
                assert!(archivo_url.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_tipo_is_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"tipo":"sabotage"}"#).is_err());
    }

    #[test]
    fn server_frames_carry_tipo_and_timestamp() {
        let frame = ServerFrame::Pong {
            timestamp: now_iso(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(value["tipo"], "pong");
        assert!(value["timestamp"].is_string());

        let value: serde_json::Value =
            serde_json::to_value(ServerFrame::error("algo falló")).unwrap();
        assert_eq!(value["tipo"], "error");
        assert_eq!(value["mensaje"], "algo falló");
    }
}
