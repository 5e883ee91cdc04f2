//! Health/ops surface.

use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

pub async fn health(State(_state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "healthy"})))
}

pub async fn live() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "alive"})))
}

/// Ready iff the API key secret is configured (the auth service can
/// actually verify keys) and the tunnel registry has spare capacity to
/// admit at least one more session.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let has_secret = !state.config.api_key_secret.is_empty();
    let has_capacity = state.registry.count() < state.config.max_tunnels;
    if has_secret && has_capacity {
        (StatusCode::OK, Json(serde_json::json!({"status": "ready"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "has_secret": has_secret,
                "has_capacity": has_capacity,
            })),
        )
    }
}
