use axum::http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::ids::{InvalidId, UserId};

pub const AUTH_TOKEN_HEADER: &str = "x-auth-token";

#[derive(Clone, Default)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    /// Development only: the presented token is taken verbatim as the user id.
    pub bypass: bool,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("bypass", &self.bypass)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing auth token")]
    MissingToken,
    #[error("jwt secret not configured")]
    MissingSecret,
    #[error("jwt validation failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("token carries no user id")]
    MissingIdentity,
    #[error(transparent)]
    InvalidIdentity(#[from] InvalidId),
}

impl AuthError {
    /// The credential itself was rejected, as opposed to a valid credential
    /// that does not name a usable identity.
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            AuthError::MissingToken | AuthError::MissingSecret | AuthError::Jwt(_)
        )
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    id: Option<Value>,
}

/// Resolves a caller's user id from the credential on a request. Fails
/// closed: without a secret every non-bypass token is rejected.
#[derive(Clone)]
pub struct AuthContext {
    config: AuthConfig,
    key: Option<DecodingKey>,
}

impl AuthContext {
    pub fn new(config: AuthConfig) -> Self {
        let key = config
            .jwt_secret
            .as_ref()
            .map(|secret| DecodingKey::from_secret(secret.as_bytes()));
        Self { config, key }
    }

    pub fn bypass(&self) -> bool {
        self.config.bypass
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<UserId, AuthError> {
        let token = extract_token(headers).ok_or(AuthError::MissingToken)?;
        self.verify(&token)
    }

    pub fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        if self.config.bypass {
            return Ok(UserId::parse(token)?);
        }

        let key = self.key.as_ref().ok_or(AuthError::MissingSecret)?;
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        let data = decode::<Claims>(token, key, &validation)?;

        let id = match data.claims.id {
            Some(Value::String(id)) => id,
            Some(Value::Number(id)) => id.to_string(),
            _ => return Err(AuthError::MissingIdentity),
        };
        Ok(UserId::parse(id)?)
    }
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get(AUTH_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        return Some(token.trim().to_owned());
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token.trim().to_owned())
}
