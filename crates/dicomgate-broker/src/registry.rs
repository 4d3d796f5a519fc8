use dashmap::DashMap;
use dicomgate_config::{BrokerBackend, BrokerConfig, ConfigStore};
use dicomgate_types::GatewayError;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::remote::RemoteAuth;
use crate::{Crosswalk, LocalBroker, RemoteBroker, ScriptBroker};

/// Owned registry of broker instances, built from configuration and
/// rebuilt lazily after a config generation bump (which also drops any
/// remote caches, satisfying invalidate-on-config-change).
pub struct BrokerRegistry {
    config: Arc<ConfigStore>,
    brokers: DashMap<String, Arc<dyn Crosswalk>>,
    /// Local instances kept by concrete type for the backup/restore/export
    /// surface the trait does not carry
    locals: DashMap<String, Arc<LocalBroker>>,
    generation: std::sync::atomic::AtomicU64,
}

impl BrokerRegistry {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            config,
            brokers: DashMap::new(),
            locals: DashMap::new(),
            generation: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn build(&self, broker: &BrokerConfig) -> Result<Arc<dyn Crosswalk>, GatewayError> {
        let built: Arc<dyn Crosswalk> = match &broker.backend {
            BrokerBackend::Local { path } => {
                let local = Arc::new(LocalBroker::open(&broker.name, path, &broker.prefix)?);
                self.locals.insert(broker.name.clone(), local.clone());
                local
            }
            BrokerBackend::Remote {
                url,
                token,
                username,
                password,
                cache_ttl_seconds,
                cache_max_entries,
            } => {
                let auth = match (token, username) {
                    (Some(token), _) => RemoteAuth::Token(token.clone()),
                    (None, Some(username)) => RemoteAuth::Basic {
                        username: username.clone(),
                        password: password.clone().unwrap_or_default(),
                    },
                    _ => RemoteAuth::None,
                };
                Arc::new(RemoteBroker::new(
                    &broker.name,
                    url,
                    auth,
                    Duration::from_secs(30),
                    Duration::from_secs(*cache_ttl_seconds),
                    *cache_max_entries,
                )?)
            }
            BrokerBackend::Script { command } => {
                Arc::new(ScriptBroker::new(&broker.name, command))
            }
        };
        info!(broker = %broker.name, "broker instance built");
        Ok(built)
    }

    /// Fetch (building on first use) the named broker.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Crosswalk>, GatewayError> {
        let current = *self.config.subscribe().borrow();
        let seen = self.generation.swap(current, std::sync::atomic::Ordering::SeqCst);
        if seen != current {
            self.brokers.clear();
            self.locals.clear();
        }

        if let Some(existing) = self.brokers.get(name) {
            return Ok(existing.value().clone());
        }
        let snapshot = self.config.snapshot();
        let config = snapshot
            .broker(name)
            .ok_or_else(|| GatewayError::not_found("broker", name))?;
        let built = self.build(config)?;
        self.brokers.insert(name.to_string(), built.clone());
        Ok(built)
    }

    /// Concrete local backend for the backup/restore/export surface.
    pub fn local(&self, name: &str) -> Result<Arc<LocalBroker>, GatewayError> {
        // ensure the instance is built and caches are generation-fresh
        self.get(name)?;
        self.locals
            .get(name)
            .map(|b| b.value().clone())
            .ok_or_else(|| {
                GatewayError::crosswalk(format!("broker {} is not a local backend", name))
            })
    }

    /// Admin surface: probe a broker end to end.
    pub async fn test(&self, name: &str) -> Result<(), GatewayError> {
        self.get(name)?.test().await
    }

    /// Admin surface: drop the named broker's cache (and instance).
    pub fn clear_cache(&self, name: &str) {
        if let Some(broker) = self.brokers.get(name) {
            broker.clear_cache();
        }
        self.brokers.remove(name);
        self.locals.remove(name);
    }
}
