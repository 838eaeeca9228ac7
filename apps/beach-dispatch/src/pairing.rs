use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::ids::UserId;
use crate::store::{SharedStoreHandle, StoreResult};

pub const DEFAULT_PAIRING_TTL: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeFreshness {
    /// An unexpired code was already on file and is returned unchanged.
    Existing,
    /// A code was on file but carried no usable expiry; replaced.
    Refreshed,
    Minted,
}

#[derive(Debug, Clone)]
pub struct PairingCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub freshness: CodeFreshness,
}

/// Issues and resolves the short-lived codes an agent presents to claim a
/// user's device slot.
///
/// A code is stored twice: `user:{id}:connection_code` answers "does this
/// user already have a code" and `pairing:{code}` answers "whose code is
/// this" without scanning the keyspace. Both carry the same TTL. Codes are
/// not consumed on use; any number of registrations may present the same
/// code until it expires.
#[derive(Clone)]
pub struct PairingService {
    store: SharedStoreHandle,
    ttl: Duration,
}

impl PairingService {
    pub fn new(store: SharedStoreHandle, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn issue_or_refresh(&self, user_id: &UserId) -> StoreResult<PairingCode> {
        let key = code_key(user_id);
        let existing = self.store.get(&key).await?;

        if let Some(code) = existing.as_ref() {
            if let Some(remaining) = self.store.ttl(&key).await? {
                return Ok(PairingCode {
                    code: code.clone(),
                    expires_at: expires_in(remaining),
                    freshness: CodeFreshness::Existing,
                });
            }
        }

        // Concurrent callers may both land here; the last forward write wins
        // and every minted code stays resolvable until it expires.
        let code = Uuid::new_v4().to_string();
        self.store
            .set_ex(&reverse_key(&code), user_id.as_str(), self.ttl)
            .await?;
        self.store.set_ex(&key, &code, self.ttl).await?;
        debug!(user_id = %user_id, refreshed = existing.is_some(), "minted pairing code");

        Ok(PairingCode {
            code,
            expires_at: expires_in(self.ttl),
            freshness: if existing.is_some() {
                CodeFreshness::Refreshed
            } else {
                CodeFreshness::Minted
            },
        })
    }

    /// Owner of `code`, or `None` when the code is unknown or expired.
    pub async fn resolve(&self, code: &str) -> StoreResult<Option<UserId>> {
        let code = code.trim();
        if code.is_empty() {
            return Ok(None);
        }
        let owner = self.store.get(&reverse_key(code)).await?;
        Ok(owner.and_then(|raw| UserId::parse(raw).ok()))
    }
}

fn expires_in(remaining: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero())
}

fn code_key(user_id: &UserId) -> String {
    format!("user:{}:connection_code", user_id)
}

fn reverse_key(code: &str) -> String {
    format!("pairing:{}", code)
}
