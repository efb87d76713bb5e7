//! HTTP trigger API.
//!
//! Backend services inject events here instead of talking to Redis directly:
//! `POST /api/publish` pushes an opaque envelope onto a conversation or
//! personal channel through the broker bridge.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::metrics::encode_metrics;
use crate::orchestrator::channels;
use crate::server::AppState;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/stats", get(stats))
        .route("/api/publish", post(publish))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics() -> Result<impl IntoResponse, AppError> {
    let body = encode_metrics().map_err(|e| AppError::Internal(e.to_string()))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.stats())
}

/// Where to publish: a conversation channel or a user's personal channel.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub conversation_id: Option<String>,
    pub user_id: Option<String>,
    /// "messages" (default) or "typings"
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Opaque event envelope, forwarded unchanged
    pub event: Value,
}

fn default_kind() -> String {
    "messages".to_string()
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub channel: String,
}

async fn publish(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, AppError> {
    let channel = resolve_channel(&request)?;

    state.orchestrator.publish(&channel, &request.event).await;

    Ok(Json(PublishResponse { channel }))
}

fn resolve_channel(request: &PublishRequest) -> Result<String, AppError> {
    let channel = match (&request.conversation_id, &request.user_id) {
        (Some(conversation_id), None) => match request.kind.as_str() {
            "messages" => channels::conversation_messages(conversation_id),
            "typings" => channels::conversation_typings(conversation_id),
            other => {
                return Err(AppError::Validation(format!("Unknown channel kind: {other}")));
            }
        },
        (None, Some(user_id)) => match request.kind.as_str() {
            "messages" => channels::user_messages(user_id),
            "typings" => channels::user_typings(user_id),
            other => {
                return Err(AppError::Validation(format!("Unknown channel kind: {other}")));
            }
        },
        _ => {
            return Err(AppError::Validation(
                "Exactly one of conversationId or userId is required".to_string(),
            ));
        }
    };
    Ok(channel)
}
