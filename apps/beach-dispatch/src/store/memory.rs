use std::{
    collections::HashMap,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use super::{key_pattern, SharedStore, StoreResult, Subscription};

const CHANNEL_DEPTH: usize = 256;

type Channels = Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>;

/// Process-local store. Backs single-instance deployments and tests; several
/// routers sharing one `MemoryStore` behave like instances sharing one Redis.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Channels,
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Channels currently tracked. A channel is forgotten together with its
    /// last subscription.
    pub fn active_channels(&self) -> usize {
        self.channels.lock().len()
    }

    fn insert(&self, key: &str, value: &str, expires_at: Option<Instant>) {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        let mut guard = self.entries.lock();
        match guard.get(key) {
            Some(entry) if entry.live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                guard.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.insert(key, value, None);
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.insert(key, value, Some(Instant::now() + ttl));
        Ok(())
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = Instant::now();
        let guard = self.entries.lock();
        Ok(guard
            .get(key)
            .and_then(|entry| entry.expires_at)
            .filter(|at| *at > now)
            .map(|at| at - now))
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        let mut guard = self.entries.lock();
        for key in keys {
            guard.remove(key);
        }
        Ok(())
    }

    async fn scan_match(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let matcher = key_pattern(pattern)?;
        let mut guard = self.entries.lock();
        guard.retain(|_, entry| entry.live(now));
        let mut keys: Vec<String> = guard
            .keys()
            .filter(|key| matcher.matches(key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut guard = self.channels.lock();
        if let Some(sender) = guard.get(channel) {
            if sender.send(payload.to_string()).is_err() {
                // Every receiver is gone; forget the channel.
                guard.remove(channel);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let receiver = {
            let mut guard = self.channels.lock();
            guard
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_DEPTH).0)
                .subscribe()
        };
        let messages = BroadcastStream::new(receiver)
            .filter_map(|item| async move { item.ok() })
            .boxed();
        let messages = ForgetOnDrop {
            messages: Some(messages),
            channel: channel.to_string(),
            channels: self.channels.clone(),
        };
        Ok(Subscription::new(channel, messages.boxed()))
    }
}

/// Subscription stream that removes its channel from the table once the last
/// receiver is gone.
struct ForgetOnDrop {
    messages: Option<BoxStream<'static, String>>,
    channel: String,
    channels: Channels,
}

impl Stream for ForgetOnDrop {
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        match self.get_mut().messages.as_mut() {
            Some(messages) => messages.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for ForgetOnDrop {
    fn drop(&mut self) {
        // Release our receiver before counting.
        drop(self.messages.take());
        let mut guard = self.channels.lock();
        if guard
            .get(&self.channel)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            guard.remove(&self.channel);
        }
    }
}
