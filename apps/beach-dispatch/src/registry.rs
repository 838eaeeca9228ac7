//! Which device is live for which user, and which connection owns it.
//!
//! A user slot is the key `ws:{user_id}:{device_id}` holding the owning
//! socket's connection token. The registry never locks: re-pairing deletes
//! the user's existing slots before writing the new one, and teardown deletes
//! by device id. Between an old socket's teardown and a new pairing two slot
//! keys can briefly coexist for one user; lookups take the first match as
//! authoritative.

use dispatch_proto::ConnectionToken;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ids::{DeviceId, UserId};
use crate::pairing::PairingService;
use crate::store::{SharedStoreHandle, StoreError, StoreResult};
use crate::system_info::SystemInfoCache;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid or expired pairing code")]
    InvalidOrExpiredCode,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveDevice {
    pub device_id: DeviceId,
    pub connection_token: ConnectionToken,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    store: SharedStoreHandle,
    pairing: PairingService,
    system_info: SystemInfoCache,
}

impl ConnectionRegistry {
    pub fn new(
        store: SharedStoreHandle,
        pairing: PairingService,
        system_info: SystemInfoCache,
    ) -> Self {
        Self {
            store,
            pairing,
            system_info,
        }
    }

    /// Bind `device_id` on `connection_token` to whichever user issued
    /// `pairing_code`, replacing any device that user had before.
    pub async fn register(
        &self,
        device_id: &DeviceId,
        connection_token: ConnectionToken,
        pairing_code: &str,
    ) -> Result<UserId, RegistryError> {
        let user_id = self
            .pairing
            .resolve(pairing_code)
            .await?
            .ok_or(RegistryError::InvalidOrExpiredCode)?;

        let stale = self.store.scan_match(&user_pattern(&user_id)).await?;
        if !stale.is_empty() {
            debug!(user_id = %user_id, replaced = stale.len(), "clearing previous device slots");
            self.store.delete(&stale).await?;
        }
        self.store
            .set(
                &slot_key(&user_id, device_id),
                &connection_token.to_string(),
            )
            .await?;

        info!(
            user_id = %user_id,
            device_id = %device_id,
            connection_token = %connection_token,
            "device registered"
        );
        Ok(user_id)
    }

    /// Drop every slot held by `device_id` along with its telemetry snapshot.
    /// Safe to call for devices that are already gone.
    pub async fn unregister(&self, device_id: &DeviceId) -> StoreResult<()> {
        let slots = self.store.scan_match(&device_pattern(device_id)).await?;
        if !slots.is_empty() {
            self.store.delete(&slots).await?;
        }
        self.system_info.forget(device_id).await?;
        debug!(device_id = %device_id, removed = slots.len(), "device unregistered");
        Ok(())
    }

    pub async fn is_connected(&self, user_id: &UserId) -> StoreResult<bool> {
        Ok(!self.store.scan_match(&user_pattern(user_id)).await?.is_empty())
    }

    pub async fn connection_token(&self, user_id: &UserId) -> StoreResult<Option<ConnectionToken>> {
        Ok(self
            .live_device(user_id)
            .await?
            .map(|device| device.connection_token))
    }

    pub async fn live_device(&self, user_id: &UserId) -> StoreResult<Option<LiveDevice>> {
        let keys = self.store.scan_match(&user_pattern(user_id)).await?;
        if keys.len() > 1 {
            debug!(user_id = %user_id, slots = keys.len(), "multiple device slots visible; using first");
        }
        let prefix = format!("ws:{}:", user_id);

        for key in keys {
            let Some(raw_device) = key.strip_prefix(&prefix) else {
                continue;
            };
            // Deleted between scan and read.
            let Some(raw_token) = self.store.get(&key).await? else {
                continue;
            };
            let (Ok(device_id), Ok(connection_token)) =
                (DeviceId::parse(raw_device), raw_token.parse::<ConnectionToken>())
            else {
                warn!(%key, "ignoring malformed device slot");
                continue;
            };
            return Ok(Some(LiveDevice {
                device_id,
                connection_token,
            }));
        }
        Ok(None)
    }
}

fn slot_key(user_id: &UserId, device_id: &DeviceId) -> String {
    format!("ws:{}:{}", user_id, device_id)
}

fn user_pattern(user_id: &UserId) -> String {
    format!("ws:{}:*", user_id)
}

fn device_pattern(device_id: &DeviceId) -> String {
    format!("ws:*:{}", device_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::DEFAULT_PAIRING_TTL;
    use crate::store::{MemoryStore, SharedStore};
    use serde_json::json;
    use std::sync::Arc;

    fn services(store: Arc<MemoryStore>) -> (ConnectionRegistry, PairingService, SystemInfoCache) {
        let pairing = PairingService::new(store.clone(), DEFAULT_PAIRING_TTL);
        let system_info = SystemInfoCache::new(store.clone());
        (
            ConnectionRegistry::new(store, pairing.clone(), system_info.clone()),
            pairing,
            system_info,
        )
    }

    fn device(raw: &str) -> DeviceId {
        DeviceId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn register_binds_device_to_code_owner() {
        let store = MemoryStore::new();
        let (registry, pairing, _) = services(store);
        let user = UserId::parse("u1").unwrap();
        let code = pairing.issue_or_refresh(&user).await.unwrap().code;
        let token = ConnectionToken::mint();

        assert!(!registry.is_connected(&user).await.unwrap());
        let owner = registry.register(&device("dev-a"), token, &code).await.unwrap();
        assert_eq!(owner, user);
        assert!(registry.is_connected(&user).await.unwrap());
        assert_eq!(registry.connection_token(&user).await.unwrap(), Some(token));
    }

    #[tokio::test]
    async fn unknown_code_is_rejected_without_side_effects() {
        let store = MemoryStore::new();
        let (registry, _, _) = services(store.clone());
        let err = registry
            .register(&device("dev-a"), ConnectionToken::mint(), "abc123")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidOrExpiredCode));
        assert!(store.scan_match("ws:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn re_pairing_leaves_exactly_one_slot() {
        let store = MemoryStore::new();
        let (registry, pairing, _) = services(store.clone());
        let user = UserId::parse("u1").unwrap();
        let code = pairing.issue_or_refresh(&user).await.unwrap().code;

        registry
            .register(&device("old"), ConnectionToken::mint(), &code)
            .await
            .unwrap();
        let fresh = ConnectionToken::mint();
        registry.register(&device("new"), fresh, &code).await.unwrap();

        let slots = store.scan_match("ws:u1:*").await.unwrap();
        assert_eq!(slots, vec!["ws:u1:new".to_string()]);
        let live = registry.live_device(&user).await.unwrap().unwrap();
        assert_eq!(live.device_id, device("new"));
        assert_eq!(live.connection_token, fresh);
    }

    #[tokio::test]
    async fn unregister_clears_slot_and_snapshot_idempotently() {
        let store = MemoryStore::new();
        let (registry, pairing, system_info) = services(store);
        let user = UserId::parse("u1").unwrap();
        let code = pairing.issue_or_refresh(&user).await.unwrap().code;
        let dev = device("dev-a");

        registry.register(&dev, ConnectionToken::mint(), &code).await.unwrap();
        system_info.save(&dev, &json!({"hostname": "box"})).await.unwrap();

        registry.unregister(&dev).await.unwrap();
        assert!(!registry.is_connected(&user).await.unwrap());
        assert!(system_info.load(&dev).await.unwrap().is_none());
        registry.unregister(&dev).await.unwrap();
    }

    #[tokio::test]
    async fn first_valid_slot_wins_when_slots_overlap() {
        let store = MemoryStore::new();
        let (registry, _, _) = services(store.clone());
        let user = UserId::parse("u1").unwrap();
        let token = ConnectionToken::mint();
        store.set("ws:u1:a-dev", "not-a-token").await.unwrap();
        store.set("ws:u1:b-dev", &token.to_string()).await.unwrap();
        store.set("ws:u1:c-dev", &ConnectionToken::mint().to_string()).await.unwrap();

        let live = registry.live_device(&user).await.unwrap().unwrap();
        assert_eq!(live.device_id, device("b-dev"));
        assert_eq!(live.connection_token, token);
    }
}
