use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::warn;

use super::{SharedStore, StoreResult, Subscription};

/// Redis-backed store. Commands go through a shared [`ConnectionManager`];
/// every subscription gets its own dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    redis: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, redis })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.redis.clone();
        // -2 when the key is missing, -1 when it never expires.
        let seconds: i64 = conn.ttl(key).await?;
        Ok((seconds > 0).then(|| Duration::from_secs(seconds as u64)))
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(keys.to_vec()).await?;
        Ok(())
    }

    async fn scan_match(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut results = Vec::new();
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100u32)
                .query_async(&mut conn)
                .await?;
            results.extend(keys);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        // SCAN may return a key more than once across iterations.
        results.sort();
        results.dedup();
        Ok(results)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let channel_name = channel.to_string();
        let messages = pubsub
            .into_on_message()
            .filter_map(move |msg| {
                let channel = channel_name.clone();
                async move {
                    match msg.get_payload::<String>() {
                        Ok(payload) => Some(payload),
                        Err(err) => {
                            warn!(%channel, error = %err, "dropping non-utf8 pubsub payload");
                            None
                        }
                    }
                }
            })
            .boxed();
        Ok(Subscription::new(channel, messages))
    }
}
