//! HTTP and WebSocket handlers.
//!
//! The heartbeat endpoint is the inbound half of the liveness fabric; the
//! remaining routes are operator shortcuts the control plane itself never
//! depends on.

use std::net::Ipv4Addr;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use super::state::AppState;
use crate::model::Vm;

pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// `GET /heartbeats/{token}`: upgrade and register every received frame
/// as a beat for `token`.
pub async fn heartbeats(
    ws: WebSocketUpgrade,
    Path(token): Path<Uuid>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| heartbeat_sink(socket, token, state))
}

async fn heartbeat_sink(mut socket: WebSocket, token: Uuid, state: AppState) {
    while let Some(Ok(message)) = socket.recv().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
        if !state.manager.heartbeat(token) {
            debug!(%token, "closing heartbeat stream for unexpected token");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: format!("Did not expect token '{token}'").into(),
                })))
                .await;
            break;
        }
    }
}

#[derive(Deserialize)]
pub struct CreateParams {
    pub ip: Ipv4Addr,
}

/// `GET /create_time/{service}?ip=`: ad-hoc worker creation, outside the
/// plan. The next convergence pass garbage-collects it.
pub async fn create_vm(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Query(params): Query<CreateParams>,
) -> Response {
    let config = state.manager.config().await;
    let Some(service_config) = config.service(&service) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown service '{service}'") })),
        )
            .into_response();
    };

    let vm = Vm::Worker {
        service: service.clone(),
        manager: state.manager.name().to_string(),
        address: params.ip,
        port: service_config.port,
        token: Uuid::new_v4(),
    };
    let name = vm.name();

    let reconciler = state.reconciler.clone();
    tokio::spawn(async move {
        if let Err(error) = reconciler.create_vm(&config, &vm).await {
            warn!(vm = %vm.name(), %error, "ad-hoc creation failed");
        }
    });

    Json(json!({ "status": "ok", "name": name })).into_response()
}

/// `GET /ip/{domain_name}`: the guest's agent-reported address.
pub async fn get_ip(State(state): State<AppState>, Path(domain_name): Path<String>) -> Response {
    match state.reconciler.discover_address(&domain_name).await {
        Ok(ip) => Json(json!({ "ip": ip })).into_response(),
        Err(error) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": error.to_string() })),
        )
            .into_response(),
    }
}

/// `GET /delete/{name}`: destroy a domain and drop its disk.
pub async fn delete_vm(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.reconciler.delete_vm(&name).await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": error.to_string() })),
        )
            .into_response(),
    }
}
