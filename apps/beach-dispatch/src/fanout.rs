//! Broadcast-and-filter routing to agent sockets.
//!
//! Every instance subscribes to one fleet-wide topic. Whoever wants to reach
//! a socket publishes `{connectionToken, payload}` there; the one instance
//! holding that token in its local table forwards the payload, everyone else
//! ignores it. Delivery is at-most-once with no acknowledgement: a lost
//! payload surfaces as the dispatcher's timeout.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use dispatch_proto::{ConnectionToken, FanoutEnvelope};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{SharedStoreHandle, StoreResult, Subscription};

pub const DEFAULT_FANOUT_TOPIC: &str = "ws:commands";

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Token owned by another instance (or by nobody).
    NotLocal,
    /// Socket buffer full; payload discarded.
    Dropped,
    /// Socket already gone; entry evicted.
    Closed,
    Malformed,
}

#[derive(Clone)]
pub struct FanoutRouter {
    inner: Arc<FanoutInner>,
}

struct FanoutInner {
    store: SharedStoreHandle,
    topic: String,
    local: DashMap<ConnectionToken, mpsc::Sender<String>>,
}

impl FanoutRouter {
    pub fn new(store: SharedStoreHandle, topic: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(FanoutInner {
                store,
                topic: topic.into(),
                local: DashMap::new(),
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Claim `token` for a socket owned by this instance. `outbound` feeds the
    /// socket's writer task.
    pub fn attach(&self, token: ConnectionToken, outbound: mpsc::Sender<String>) {
        self.inner.local.insert(token, outbound);
        gauge!("beach_dispatch_local_connections", self.inner.local.len() as f64);
    }

    pub fn detach(&self, token: &ConnectionToken) {
        self.inner.local.remove(token);
        gauge!("beach_dispatch_local_connections", self.inner.local.len() as f64);
    }

    pub fn local_connections(&self) -> usize {
        self.inner.local.len()
    }

    pub async fn publish<T: Serialize>(
        &self,
        connection_token: ConnectionToken,
        payload: &T,
    ) -> StoreResult<()> {
        let envelope = FanoutEnvelope {
            connection_token,
            payload: serde_json::to_value(payload)?,
        };
        let serialized = serde_json::to_string(&envelope)?;
        self.inner.store.publish(&self.inner.topic, &serialized).await?;
        counter!("beach_dispatch_fanout_published_total", 1);
        Ok(())
    }

    /// Forward one raw envelope from the topic if its token is ours.
    pub fn deliver(&self, raw: &str) -> Delivery {
        let envelope = match serde_json::from_str::<FanoutEnvelope>(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "discarding malformed fanout envelope");
                counter!("beach_dispatch_fanout_total", 1, "outcome" => "malformed");
                return Delivery::Malformed;
            }
        };

        let token = envelope.connection_token;
        let Some(sender) = self.inner.local.get(&token).map(|entry| entry.value().clone()) else {
            return Delivery::NotLocal;
        };

        let payload = envelope.payload.to_string();
        let outcome = match sender.try_send(payload) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                warn!(connection_token = %token, "socket buffer full; dropping fanout payload");
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_token = %token, "socket closed; evicting local route");
                self.detach(&token);
                Delivery::Closed
            }
        };
        counter!("beach_dispatch_fanout_total", 1, "outcome" => outcome.metric_label());
        outcome
    }

    /// Subscribe to the fanout topic and spawn the listener. Returns once the
    /// subscription is confirmed.
    pub async fn start(&self) -> StoreResult<JoinHandle<()>> {
        let subscription = self.inner.store.subscribe(&self.inner.topic).await?;
        info!(topic = %self.inner.topic, "fanout listener subscribed");
        let router = self.clone();
        Ok(tokio::spawn(async move {
            router.listen(subscription).await;
        }))
    }

    async fn listen(&self, mut subscription: Subscription) {
        loop {
            while let Some(raw) = subscription.next_message().await {
                self.deliver(&raw);
            }
            warn!(topic = %self.inner.topic, "fanout subscription ended; resubscribing");
            subscription = self.resubscribe().await;
        }
    }

    async fn resubscribe(&self) -> Subscription {
        loop {
            tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
            match self.inner.store.subscribe(&self.inner.topic).await {
                Ok(subscription) => {
                    info!(topic = %self.inner.topic, "fanout listener resubscribed");
                    return subscription;
                }
                Err(err) => {
                    warn!(topic = %self.inner.topic, error = %err, "fanout resubscribe failed");
                }
            }
        }
    }
}

impl Delivery {
    fn metric_label(&self) -> &'static str {
        match self {
            Delivery::Delivered => "delivered",
            Delivery::NotLocal => "not_local",
            Delivery::Dropped => "dropped",
            Delivery::Closed => "closed",
            Delivery::Malformed => "malformed",
        }
    }
}
