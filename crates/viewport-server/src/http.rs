//! HTTP/WebSocket surface (SPEC_FULL.md §6). Thin axum wrapper around
//! `viewport_core::ApplicationState`; handlers only ever read bus/metrics
//! snapshots or call the small set of mutating entry points the core
//! exposes (`reset_tracking`, `reload_collectibles`, `match_once`) —
//! none of this runs CPU work on the producer thread (spec.md §9).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Multipart, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use viewport_core::collectibles::Collectible;
use viewport_core::ApplicationState;

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<ApplicationState>,
}

pub fn router(core: Arc<ApplicationState>) -> Router {
    Router::new()
        .route("/api/latest", get(get_latest))
        .route("/api/stats", get(get_stats))
        .route("/api/reset_tracking", post(post_reset_tracking))
        .route("/api/match_once", post(post_match_once))
        .route("/api/collectibles", post(post_collectibles))
        .route("/ws", get(ws_handler))
        .with_state(AppState { core })
}

async fn get_latest(State(state): State<AppState>) -> impl IntoResponse {
    match state.core.get_latest() {
        Some(published) => Json(serde_json::to_value(&*published).unwrap_or_default()).into_response(),
        None => axum::http::StatusCode::NO_CONTENT.into_response(),
    }
}

async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.core.get_stats())
}

async fn post_reset_tracking(State(state): State<AppState>) -> impl IntoResponse {
    state.core.reset_tracking();
    axum::http::StatusCode::NO_CONTENT
}

/// Detection-space floats, matching `Collectible` — see spec.md's open
/// question on `map_x`/`map_y` scale, resolved as detection-space.
#[derive(Debug, Deserialize)]
struct CollectiblePayload {
    det_x: f64,
    det_y: f64,
    category: String,
    payload: String,
}

async fn post_collectibles(
    State(state): State<AppState>,
    Json(items): Json<Vec<CollectiblePayload>>,
) -> impl IntoResponse {
    let collectibles = items
        .into_iter()
        .map(|c| Collectible {
            det_x: c.det_x,
            det_y: c.det_y,
            category: c.category,
            payload: c.payload,
        })
        .collect();
    state.core.reload_collectibles(collectibles);
    axum::http::StatusCode::NO_CONTENT
}

/// `match_once`: synchronous manual alignment against an uploaded image
/// (spec.md §6). Multipart body with a single image field.
async fn post_match_once(State(state): State<AppState>, mut multipart: Multipart) -> impl IntoResponse {
    let Ok(Some(field)) = multipart.next_field().await else {
        return axum::http::StatusCode::BAD_REQUEST.into_response();
    };
    let Ok(bytes) = field.bytes().await else {
        return axum::http::StatusCode::BAD_REQUEST.into_response();
    };
    let Ok(decoded) = image::load_from_memory(&bytes) else {
        return axum::http::StatusCode::UNPROCESSABLE_ENTITY.into_response();
    };
    let gray = decoded.to_luma8();
    let preprocessed = match viewport_core::cv_backend::preprocess(&gray) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "match_once preprocessing failed");
            return axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match state.core.match_once(&preprocessed) {
        Ok(Some(result)) => Json(serde_json::json!({
            "viewport": result.viewport,
            "confidence": result.confidence,
            "inliers": result.inliers,
            "level_used": result.level_used,
            "elapsed_ms": result.elapsed_ms,
            "method": result.method,
        }))
        .into_response(),
        Ok(None) => axum::http::StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "match_once failed");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: WebSocket, state: AppState) {
    if let Some(published) = state.core.get_latest() {
        if let Ok(json) = serde_json::to_string(&*published) {
            if socket.send(Message::Text(json)).await.is_err() {
                return;
            }
        }
    }

    let rx = state.core.subscribe();
    loop {
        // The bus is a sync `crossbeam_channel`; hop onto a blocking
        // thread so a slow WebSocket send never stalls the producer's
        // publish path (spec.md §9: transport never runs on the
        // producer thread, and must never block it either).
        let recv_result = tokio::task::spawn_blocking({
            let rx = rx.clone();
            move || rx.recv()
        })
        .await;

        match recv_result {
            Ok(Ok(published)) => {
                let Ok(json) = serde_json::to_string(&*published) else {
                    continue;
                };
                if socket.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            _ => break,
        }
    }
}
