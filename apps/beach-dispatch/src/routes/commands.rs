use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiResult, CallerIdentity};
use crate::dispatch::CommandOutput;
use crate::ids::DeviceId;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendCommandsRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    pub commands: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendCommandsResponse {
    pub success: bool,
    pub device_id: DeviceId,
    pub results: Vec<CommandOutput>,
}

pub async fn send_commands(
    State(state): State<AppState>,
    CallerIdentity(user_id): CallerIdentity,
    body: Result<Json<SendCommandsRequest>, JsonRejection>,
) -> ApiResult<SendCommandsResponse> {
    let Json(request) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let target = request
        .device_id
        .as_deref()
        .map(DeviceId::parse)
        .transpose()
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;

    let outcome = state
        .dispatcher
        .dispatch(&user_id, target.as_ref(), request.commands)
        .await?;

    Ok(Json(SendCommandsResponse {
        success: true,
        device_id: outcome.device_id,
        results: outcome.results,
    }))
}
