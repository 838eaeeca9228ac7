use std::{sync::Arc, time::Duration};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::auth::{AuthConfig, AuthContext};
use crate::dispatch::{CommandDispatcher, DEFAULT_COMMAND_TIMEOUT};
use crate::fanout::{FanoutRouter, DEFAULT_FANOUT_TOPIC};
use crate::pairing::{PairingService, DEFAULT_PAIRING_TTL};
use crate::registry::ConnectionRegistry;
use crate::store::SharedStoreHandle;
use crate::system_info::SystemInfoCache;

/// Tunables shared by every component built on top of the store.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub command_timeout: Duration,
    pub pairing_ttl: Duration,
    pub fanout_topic: String,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            pairing_ttl: DEFAULT_PAIRING_TTL,
            fanout_topic: DEFAULT_FANOUT_TOPIC.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub pairing: PairingService,
    pub system_info: SystemInfoCache,
    pub fanout: FanoutRouter,
    pub dispatcher: CommandDispatcher,
    pub auth: AuthContext,
    pub instance_id: Arc<str>,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        store: SharedStoreHandle,
        settings: &ServiceSettings,
        auth: AuthConfig,
        instance_id: impl Into<Arc<str>>,
    ) -> Self {
        let pairing = PairingService::new(store.clone(), settings.pairing_ttl);
        let system_info = SystemInfoCache::new(store.clone());
        let registry = ConnectionRegistry::new(store.clone(), pairing.clone(), system_info.clone());
        let fanout = FanoutRouter::new(store.clone(), settings.fanout_topic.clone());
        let dispatcher = CommandDispatcher::new(
            registry.clone(),
            fanout.clone(),
            store,
            settings.command_timeout,
        );
        Self {
            registry,
            pairing,
            system_info,
            fanout,
            dispatcher,
            auth: AuthContext::new(auth),
            instance_id: instance_id.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn render_metrics(&self) -> String {
        self.metrics
            .as_ref()
            .map(|handle| handle.render())
            .unwrap_or_default()
    }
}
