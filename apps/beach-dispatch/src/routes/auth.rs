use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use tracing::debug;

use super::ApiError;
use crate::ids::UserId;
use crate::state::AppState;

/// The authenticated user behind an HTTP request.
#[derive(Clone, Debug)]
pub struct CallerIdentity(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for CallerIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        match state.auth.authenticate(&parts.headers) {
            Ok(user_id) => Ok(CallerIdentity(user_id)),
            Err(err) if err.is_credential_failure() => {
                debug!(error = %err, "rejected credential");
                Err(ApiError::Unauthorized)
            }
            Err(err) => Err(ApiError::BadRequest(format!("missing user id: {err}"))),
        }
    }
}
