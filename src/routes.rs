use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{any, get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::auth::middleware::{Claims, JwtSecret};
use crate::chat::handler as ws_handler;
use crate::chat::protocol::{now_iso, ActiveUser, ServerFrame};
use crate::chat::registry::RegistryStats;
use crate::state::AppState;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    State(state): State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// GET /api/v1/chat/estadisticas — connection statistics. JWT auth required.
async fn estadisticas(State(state): State<AppState>, _claims: Claims) -> Json<RegistryStats> {
    Json(state.registry.stats())
}

/// GET /api/v1/chat/{chat_id}/participantes — users currently connected to a
/// chat. JWT auth required; caller must have access to the chat.
async fn participantes(
    State(state): State<AppState>,
    claims: Claims,
    Path(chat_id): Path<i64>,
) -> Result<Json<Vec<ActiveUser>>, StatusCode> {
    let permitted = claims.role == "admin"
        || state
            .store
            .room_access(chat_id, claims.user_id)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if !permitted {
        return Err(StatusCode::FORBIDDEN);
    }

    Ok(Json(state.registry.room_members(chat_id)))
}

#[derive(Debug, Deserialize)]
struct NotificationRequest {
    mensaje: String,
    #[serde(default = "default_notification_type")]
    notification_type: String,
}

fn default_notification_type() -> String {
    "info".to_string()
}

/// POST /api/v1/chat/{chat_id}/notificaciones — broadcast a system
/// notification to a room. Entry point for workshop-process events
/// (status changes, assignments). JWT auth required.
async fn notificar_chat(
    State(state): State<AppState>,
    _claims: Claims,
    Path(chat_id): Path<i64>,
    Json(body): Json<NotificationRequest>,
) -> StatusCode {
    state.registry.broadcast_to_room(
        chat_id,
        &ServerFrame::SystemNotification {
            mensaje: body.mensaje,
            notification_type: body.notification_type,
            timestamp: now_iso(),
        },
        None,
    );
    StatusCode::OK
}

/// POST /api/v1/chat/usuarios/{user_id}/notificaciones — send a system
/// notification to every connection of one user, across all chats.
async fn notificar_usuario(
    State(state): State<AppState>,
    _claims: Claims,
    Path(user_id): Path<i64>,
    Json(body): Json<NotificationRequest>,
) -> StatusCode {
    state.registry.broadcast_to_user(
        user_id,
        &ServerFrame::SystemNotification {
            mensaje: body.mensaje,
            notification_type: body.notification_type,
            timestamp: now_iso(),
        },
    );
    StatusCode::OK
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/chat/estadisticas", get(estadisticas))
        .route("/api/v1/chat/{chat_id}/participantes", get(participantes))
        .route("/api/v1/chat/{chat_id}/notificaciones", post(notificar_chat))
        .route(
            "/api/v1/chat/usuarios/{user_id}/notificaciones",
            post(notificar_usuario),
        )
        .route("/api/v1/chat/{chat_id}/ws", any(ws_handler::ws_upgrade))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}
