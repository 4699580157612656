use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use serde::Deserialize;

use crate::chat::actor;
use crate::state::AppState;

/// Query parameters for WebSocket connection. Auth is via query param
/// ?token=JWT because browsers cannot set headers on WebSocket upgrades.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: String,
}

/// WebSocket close codes:
/// 4001 = token invalid
/// 4003 = access to the chat denied
const CLOSE_TOKEN_INVALID: u16 = 4001;
const CLOSE_ACCESS_DENIED: u16 = 4003;

/// GET /api/v1/chat/{chat_id}/ws?token=JWT
/// WebSocket upgrade endpoint. Authenticates via query parameter and checks
/// room access before any connection is registered. On failure, upgrades
/// then immediately closes with the policy code.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(identity) = state.validator.validate(&params.token) else {
        tracing::warn!(chat_id, "WebSocket auth failed");
        return close_with(ws, CLOSE_TOKEN_INVALID, "Token inválido");
    };

    match state.store.room_access(chat_id, identity.user_id).await {
        Ok(true) => {
            tracing::info!(
                user_id = identity.user_id,
                chat_id,
                "WebSocket connection authenticated"
            );
            ws.on_upgrade(move |socket| actor::run_connection(socket, state, chat_id, identity))
        }
        Ok(false) => {
            tracing::warn!(user_id = identity.user_id, chat_id, "Chat access denied");
            close_with(ws, CLOSE_ACCESS_DENIED, "Acceso denegado al chat")
        }
        Err(e) => {
            // Cannot establish access — deny rather than admit blind.
            tracing::error!(chat_id, error = %e, "Room access check failed");
            close_with(ws, CLOSE_ACCESS_DENIED, "Acceso denegado al chat")
        }
    }
}

/// Upgrade the connection, then immediately close it with a policy code.
fn close_with(ws: WebSocketUpgrade, code: u16, reason: &'static str) -> Response {
    ws.on_upgrade(move |mut socket| async move {
        let close_frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let _ = socket.send(Message::Close(Some(close_frame))).await;
    })
}
