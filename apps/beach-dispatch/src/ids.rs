use std::fmt;

use serde::Serialize;
use thiserror::Error;

const MAX_ID_LEN: usize = 128;

/// Ids are embedded in store keys and scan patterns, so separators, glob
/// metacharacters and the `SCAN MATCH` escape are rejected up front.
const RESERVED: &[char] = &[':', '*', '?', '[', ']', '\\'];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind}: {reason}")]
pub struct InvalidId {
    pub kind: &'static str,
    pub reason: &'static str,
}

fn validate(kind: &'static str, raw: &str) -> Result<String, InvalidId> {
    let trimmed = raw.trim();
    let reason = if trimmed.is_empty() {
        "must not be empty"
    } else if trimmed.len() > MAX_ID_LEN {
        "too long"
    } else if trimmed.contains(RESERVED) {
        "contains reserved characters"
    } else {
        return Ok(trimmed.to_string());
    };
    Err(InvalidId { kind, reason })
}

/// Stable identity of an account, as resolved by the auth context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, InvalidId> {
        validate("user id", raw.as_ref()).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Agent-chosen device identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, InvalidId> {
        validate("device id", raw.as_ref()).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
