// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! HTTP control/event API (§6).
//!
//! Endpoints:
//!   POST   /cameras                → register a camera (hot)
//!   DELETE /cameras/{id}           → remove a camera (hot)
//!   GET    /cameras                → list active cameras
//!   POST   /relationships          → register a monitor relationship (symmetric)
//!   GET    /stats                  → aggregate worker + engine statistics
//!   GET    /events                 → WebSocket event stream (§6 event envelope)

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Deserialize;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::config::CameraConfig;
use crate::error::SentryError;
use crate::manager::SentryManager;
use crate::types::{MonitorRelationship, RelationshipKind};

/// Shared state passed to all handlers. `SentryManager` is wrapped in an async
/// mutex since `add_camera`/`remove_camera` hold it across `.await` points.
pub struct AppState {
    pub manager: Arc<Mutex<SentryManager>>,
}

#[derive(Deserialize)]
struct RelationshipBody {
    monitor_a: String,
    monitor_b: String,
    kind: RelationshipKind,
    confidence_multiplier: f64,
}

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/cameras", get(handle_list_cameras).post(handle_add_camera))
        .route("/cameras/{camera_id}", delete(handle_remove_camera))
        .route("/relationships", post(handle_add_relationship))
        .route("/stats", get(handle_stats))
        .route("/events", get(handle_events_ws))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(state: Arc<AppState>, port: u16) {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{port}");
    info!(port, "HTTP API listening on http://{addr}");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "Failed to bind HTTP server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "HTTP server error");
    }
}

async fn handle_list_cameras(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mgr = state.manager.lock().await;
    let cameras: Vec<&CameraConfig> = mgr.list_cameras();
    (StatusCode::OK, axum::Json(serde_json::json!({
        "cameras": cameras,
        "total": cameras.len(),
    })))
}

async fn handle_add_camera(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<CameraConfig>,
) -> impl IntoResponse {
    let mut mgr = state.manager.lock().await;
    match mgr.add_camera(body.clone()) {
        Ok(()) => (
            StatusCode::CREATED,
            axum::Json(serde_json::json!({
                "status": "added",
                "camera_id": body.camera_id,
            })),
        ),
        Err(e @ SentryError::CameraExists { .. }) => (
            StatusCode::CONFLICT,
            axum::Json(serde_json::json!({ "error": e.to_string() })),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            axum::Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn handle_remove_camera(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
) -> impl IntoResponse {
    let mut mgr = state.manager.lock().await;
    match mgr.remove_camera(&camera_id).await {
        Ok(()) => (StatusCode::NO_CONTENT, axum::Json(serde_json::json!({}))),
        Err(e @ SentryError::CameraNotFound { .. }) => (
            StatusCode::NOT_FOUND,
            axum::Json(serde_json::json!({ "error": e.to_string() })),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            axum::Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn handle_add_relationship(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<RelationshipBody>,
) -> impl IntoResponse {
    let mgr = state.manager.lock().await;
    let rel = MonitorRelationship {
        monitor_a: body.monitor_a,
        monitor_b: body.monitor_b,
        kind: body.kind,
        confidence_multiplier: body.confidence_multiplier,
    };
    match mgr.register_relationship(rel).await {
        Ok(()) => (
            StatusCode::CREATED,
            axum::Json(serde_json::json!({ "status": "registered" })),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            axum::Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mgr = state.manager.lock().await;
    let stats = mgr.stats().await;
    (StatusCode::OK, axum::Json(serde_json::to_value(stats).unwrap()))
}

async fn handle_events_ws(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_events(socket, state))
}

async fn stream_events(mut socket: WebSocket, state: Arc<AppState>) {
    let (subscription_id, mut rx) = {
        let mgr = state.manager.lock().await;
        mgr.publisher().subscribe()
    };
    info!(subscription_id = %subscription_id, "Event subscriber connected via WebSocket");

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break; };
                let payload = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        error!(error = %e, "Failed to serialize event envelope");
                        continue;
                    }
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => continue,
                }
            }
        }
    }

    let mgr = state.manager.lock().await;
    mgr.publisher().unsubscribe(subscription_id);
    info!(subscription_id = %subscription_id, "Event subscriber disconnected");
}
