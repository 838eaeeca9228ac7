use serde_json::Value;

use crate::ids::DeviceId;
use crate::store::{SharedStoreHandle, StoreResult};

/// Last reported telemetry per device. Last write wins, no history, no
/// expiry; the snapshot is removed when the device's socket goes away.
#[derive(Clone)]
pub struct SystemInfoCache {
    store: SharedStoreHandle,
}

impl SystemInfoCache {
    pub fn new(store: SharedStoreHandle) -> Self {
        Self { store }
    }

    pub async fn save(&self, device_id: &DeviceId, snapshot: &Value) -> StoreResult<()> {
        let serialized = serde_json::to_string(snapshot)?;
        self.store.set(&system_key(device_id), &serialized).await
    }

    pub async fn load(&self, device_id: &DeviceId) -> StoreResult<Option<Value>> {
        match self.store.get(&system_key(device_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn forget(&self, device_id: &DeviceId) -> StoreResult<()> {
        self.store.delete(&[system_key(device_id)]).await
    }
}

fn system_key(device_id: &DeviceId) -> String {
    format!("system:{}", device_id)
}
