//! Shared key/value + pub/sub store every instance talks to.
//!
//! The registry, pairing flow, fanout router and dispatcher only ever see the
//! [`SharedStore`] trait, so the same code runs against Redis in production and
//! against [`MemoryStore`] in single-instance mode and tests.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use thiserror::Error;

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store payload error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("invalid key pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("subscription to {0} closed")]
    SubscriptionClosed(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub type SharedStoreHandle = Arc<dyn SharedStore>;

#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Remaining lifetime of `key`. `None` when the key is missing or has no
    /// expiry attached.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    async fn delete(&self, keys: &[String]) -> StoreResult<()>;

    /// All keys matching a glob pattern (`*` and `?` wildcards).
    async fn scan_match(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Fire-and-forget publish; messages on channels without subscribers are
    /// lost.
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;

    /// Resolves once the subscription is confirmed by the store, so a publish
    /// issued after this returns is guaranteed to be observed.
    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;
}

/// Live subscription to one channel. Dropping it releases the underlying
/// subscription.
pub struct Subscription {
    channel: String,
    messages: BoxStream<'static, String>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, messages: BoxStream<'static, String>) -> Self {
        Self {
            channel: channel.into(),
            messages,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once the store side of the subscription ended.
    pub async fn next_message(&mut self) -> Option<String> {
        self.messages.next().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Compile a key pattern as understood by `SCAN MATCH` (`*` and `?`).
pub(crate) fn key_pattern(pattern: &str) -> StoreResult<glob::Pattern> {
    Ok(glob::Pattern::new(pattern)?)
}
