use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::{ApiError, CallerIdentity};
use crate::pairing::CodeFreshness;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingCodeResponse {
    pub msg: &'static str,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

pub async fn pairing_code(
    State(state): State<AppState>,
    CallerIdentity(user_id): CallerIdentity,
) -> Result<(StatusCode, Json<PairingCodeResponse>), ApiError> {
    let issued = state.pairing.issue_or_refresh(&user_id).await?;
    let (status, msg) = match issued.freshness {
        CodeFreshness::Existing => (StatusCode::OK, "Connection code exists"),
        CodeFreshness::Refreshed => (StatusCode::OK, "Code refreshed"),
        CodeFreshness::Minted => (StatusCode::CREATED, "New connection code"),
    };
    Ok((
        status,
        Json(PairingCodeResponse {
            msg,
            code: issued.code,
            expires_at: issued.expires_at,
        }),
    ))
}

pub async fn system_information(
    State(state): State<AppState>,
    CallerIdentity(user_id): CallerIdentity,
) -> Result<Json<Value>, ApiError> {
    let device = state
        .registry
        .live_device(&user_id)
        .await?
        .ok_or(ApiError::NotFound("no device found for user"))?;
    let snapshot = state
        .system_info
        .load(&device.device_id)
        .await?
        .ok_or(ApiError::NotFound("system information not found"))?;
    Ok(Json(snapshot))
}
