//! WebSocket bridge between dashboard clients and the connection registry.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use payhook_common::error::AppError;
use payhook_notifier::realtime::ConnectionRegistry;

use crate::middleware::auth::{AuthUser, authenticate};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
}

/// GET /ws?token=<jwt>: Browsers cannot set headers on WebSocket upgrades.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Result<Response, AppError> {
    let auth = authenticate(&query.token, &state.config.jwt_secret)?;
    let registry = state.registry.clone();
    Ok(ws.on_upgrade(move |socket| serve_socket(socket, registry, auth)))
}

async fn serve_socket(socket: WebSocket, registry: Arc<ConnectionRegistry>, auth: AuthUser) {
    let (id, mut outbound) = match registry.register(auth.user_id, auth.role) {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(user_id = %auth.user_id, error = %e, "Failed to register realtime connection");
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if sink.send(Message::Text(message.into())).await.is_err() {
                break;
            }
        }
    });

    // Inbound frames are ignored; the channel is push-only.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = stream.next().await {
            if matches!(frame, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    registry.unregister(id);
}
