//! HTTP -> WebSocket upgrade for `/ws/relay`, plus the plain `/healthz`
//! liveness route served alongside it.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};

use crate::auth::verify_token;
use crate::config::RelayServerConfig;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::server::registry::{ConnectionHandle, Outbound};
use crate::server::router::{DeviceRole, ServerState};

pub struct AppState {
    pub config: RelayServerConfig,
    pub relay: ServerState,
    pub started_at: Instant,
}

#[derive(Debug, Deserialize)]
pub struct RelayQuery {
    token: String,
    #[serde(rename = "deviceType")]
    device_type: String,
    #[serde(rename = "deviceId")]
    device_id: String,
    #[serde(rename = "deviceName")]
    device_name: Option<String>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = if state.config.allow_origins.is_empty() {
        CorsLayer::new()
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .allow_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    Router::new()
        .route("/ws/relay", get(ws_handler))
        .route("/healthz", get(healthz))
        .layer(cors)
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connections = state.relay.registry.lock().await.connection_count();
    Json(serde_json::json!({
        "status": "ok",
        "connections": connections,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<RelayQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let role = match DeviceRole::from_str(&query.device_type) {
        Ok(role) => role,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, "deviceType must be 'desktop' or 'mobile'")
                .into_response();
        }
    };

    if query.device_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "deviceId is required").into_response();
    }

    let user_id = match verify_token(&query.token, &state.config.jwt_secret) {
        Some(user_id) => user_id,
        None => return (StatusCode::UNAUTHORIZED, "invalid or expired token").into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id, role, query.device_id, query.device_name))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    user_id: String,
    role: DeviceRole,
    device_id: String,
    device_name: Option<String>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

    let outcome = state
        .relay
        .registry
        .lock()
        .await
        .attach(user_id.clone(), device_id.clone(), device_name, out_tx);

    if let Some(displaced) = outcome.displaced {
        displaced.close("replaced");
    }

    let handle: ConnectionHandle = outcome.handle;
    info!(device_id = %device_id, role = ?role, "relay: device attached");
    state.relay.on_attach(&handle, role).await;

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            match msg {
                Outbound::Frame(frame) => {
                    if ws_tx.send(Message::Text(frame.to_json())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: axum::extract::ws::close_code::NORMAL,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => state.relay.handle_frame(&handle, role, frame).await,
            Err(e) => {
                warn!("relay: malformed frame from {device_id}: {e}");
                handle.send(ServerFrame::error(format!("malformed frame: {e}")));
            }
        }
    }

    writer.abort();
    let now_offline = state
        .relay
        .registry
        .lock()
        .await
        .detach(&device_id, handle.generation());
    if now_offline {
        state.relay.on_detach(&user_id, &device_id).await;
        info!(device_id = %device_id, "relay: device detached");
    } else {
        debug!(device_id = %device_id, "relay: displaced connection's read loop exited, device still online");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_role_parses_known_values_only() {
        assert_eq!(DeviceRole::from_str("desktop"), Ok(DeviceRole::Desktop));
        assert_eq!(DeviceRole::from_str("mobile"), Ok(DeviceRole::Mobile));
        assert!(DeviceRole::from_str("tablet").is_err());
    }
}
