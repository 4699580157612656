use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::auth::Identity;
use crate::chat::protocol::{self, Dispatch};
use crate::state::AppState;

/// Outbound queue depth per connection. A consumer that falls this far
/// behind is treated as broken rather than allowed to stall broadcasts.
const OUTBOUND_QUEUE: usize = 64;

/// Upper bound on one socket write; a peer blocked longer is torn down.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the actor-per-connection pattern for an authenticated WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, drains the connection's outbound queue —
///   the only writer on this socket, so frames never interleave
/// - Reader loop: stamps activity and dispatches frames to the router
pub async fn run_connection(socket: WebSocket, state: AppState, chat_id: i64, identity: Identity) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

    // Registration also announces user_connected and sends the active_users
    // snapshot through the queue just created.
    let conn_id = state.registry.register(chat_id, &identity, tx.clone());

    tracing::info!(
        user_id = identity.user_id,
        chat_id,
        "WebSocket actor started"
    );

    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    let mut reason = "normal";
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    state.registry.touch(conn_id);
                    let outcome = protocol::handle_text(&state, conn_id, &tx, text.as_str()).await;
                    if outcome == Dispatch::Terminate {
                        reason = "unauthorized";
                        break;
                    }
                }
                Message::Binary(_) => {
                    // Protocol is JSON text; binary frames are ignored.
                    tracing::debug!(
                        user_id = identity.user_id,
                        "Received binary frame (expected JSON text)"
                    );
                }
                Message::Ping(data) => {
                    let _ = tx.try_send(Message::Pong(data));
                }
                Message::Pong(_) => {
                    state.registry.touch(conn_id);
                }
                Message::Close(frame) => {
                    tracing::info!(
                        user_id = identity.user_id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    user_id = identity.user_id,
                    error = %e,
                    "WebSocket receive error"
                );
                reason = "connection_broken";
                break;
            }
            None => {
                // Stream ended — client disconnected
                break;
            }
        }
    }

    // Idempotent: a reaper eviction or broken-send disconnect that raced the
    // reader's exit already removed the handle.
    state.registry.disconnect(conn_id, reason);
    writer_handle.abort();

    tracing::info!(
        user_id = identity.user_id,
        chat_id,
        "WebSocket actor stopped"
    );
}

/// Writer task: drains the outbound queue into the WebSocket sink, one write
/// at a time, each bounded by WRITE_TIMEOUT.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        match timeout(WRITE_TIMEOUT, ws_sender.send(msg)).await {
            Ok(Ok(())) => {
                if is_close {
                    break;
                }
            }
            Ok(Err(_)) => break,
            Err(_) => {
                tracing::warn!("Socket write timed out, abandoning connection");
                break;
            }
        }
    }
}
