mod auth;
mod commands;
mod devices;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use crate::dispatch::{DispatchError, PartialBatch};
use crate::ids::DeviceId;
use crate::session::agent_socket;
use crate::state::AppState;
use crate::store::StoreError;

pub use auth::CallerIdentity;
pub use commands::*;
pub use devices::*;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/ws", get(agent_socket))
        .route("/commands", post(send_commands))
        .route("/pairing-code", get(pairing_code))
        .route("/system-information", get(system_information))
        // Paths used by existing dashboards.
        .route("/api/devices/send-commands", post(send_commands))
        .route("/api/devices/connection-code", get(pairing_code))
        .route("/api/devices/system-information", get(system_information))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.render_metrics(),
    )
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    instance_id: String,
    local_connections: usize,
    fanout_topic: String,
}

async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        instance_id: state.instance_id.to_string(),
        local_connections: state.fanout.local_connections(),
        fanout_topic: state.fanout.topic().to_string(),
    })
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    NotFound(&'static str),
    CommandTimeout {
        message: String,
        device_id: DeviceId,
        partial: PartialBatch,
    },
    CommandFailed(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TimeoutBody {
    success: bool,
    error: String,
    device_id: DeviceId,
    #[serde(flatten)]
    partial: PartialBatch,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(ApiErrorBody {
                    error: "unauthorized",
                    message: None,
                }),
            )
                .into_response(),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                Json(ApiErrorBody {
                    error: "bad_request",
                    message: Some(msg),
                }),
            )
                .into_response(),
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                Json(ApiErrorBody {
                    error: "not_found",
                    message: Some(msg.to_string()),
                }),
            )
                .into_response(),
            ApiError::CommandTimeout {
                message,
                device_id,
                partial,
            } => (
                StatusCode::REQUEST_TIMEOUT,
                Json(TimeoutBody {
                    success: false,
                    error: message,
                    device_id,
                    partial,
                }),
            )
                .into_response(),
            ApiError::CommandFailed(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "error": "command processing failed",
                    "message": msg,
                })),
            )
                .into_response(),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiErrorBody {
                    error: "internal",
                    message: Some(msg),
                }),
            )
                .into_response(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "store failure while serving request");
        ApiError::Internal(err.to_string())
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Validation(msg) => ApiError::BadRequest(msg),
            DispatchError::NotConnected => ApiError::NotFound("device not connected"),
            DispatchError::TimedOut { device_id, partial } => ApiError::CommandTimeout {
                message: "command execution timed out".into(),
                device_id,
                partial,
            },
            err @ DispatchError::Transport(_) => {
                error!(error = %err, "dispatch failed");
                ApiError::CommandFailed(err.to_string())
            }
        }
    }
}
