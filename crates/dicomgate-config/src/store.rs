use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::model::{BrokerConfig, DestinationConfig, GatewayConfig, RouteConfig};

/// Configuration loading/validation errors. All of these belong to the
/// "refuse to start" class (process exit code 1) when raised at boot.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("destination {0} is referenced by a route and cannot be deleted")]
    DestinationInUse(String),

    #[error("unknown {entity}: {name}")]
    NotFound { entity: &'static str, name: String },
}

/// Hot-reloadable configuration store.
///
/// Readers take a cheap snapshot clone; mutations validate the candidate
/// document as a whole before swapping it in, then bump a generation
/// watch channel so long-lived components (health monitor, broker caches)
/// can rebuild.
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<GatewayConfig>>,
    generation_tx: watch::Sender<u64>,
    generation_rx: watch::Receiver<u64>,
}

impl ConfigStore {
    /// Load and validate the bootstrap TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: GatewayConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        validate(&config)?;
        info!(
            path = %path.display(),
            routes = config.routes.len(),
            destinations = config.destinations.len(),
            "configuration loaded"
        );
        Ok(Self::from_config(config, Some(path)))
    }

    /// Build a store around an already-validated in-memory document.
    pub fn new(config: GatewayConfig) -> Result<Self, ConfigError> {
        validate(&config)?;
        Ok(Self::from_config(config, None))
    }

    fn from_config(config: GatewayConfig, path: Option<PathBuf>) -> Self {
        let (generation_tx, generation_rx) = watch::channel(0);
        Self {
            path,
            current: RwLock::new(Arc::new(config)),
            generation_tx,
            generation_rx,
        }
    }

    /// Cheap snapshot of the current document.
    pub fn snapshot(&self) -> Arc<GatewayConfig> {
        self.current.read().clone()
    }

    /// Subscribe to config generation bumps.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation_rx.clone()
    }

    /// Re-read the bootstrap file, validate, and swap in.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Err(ConfigError::Invalid(
                "store was not created from a file".into(),
            ));
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: GatewayConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        self.apply(config)
    }

    /// Validate a candidate document and make it current.
    pub fn apply(&self, config: GatewayConfig) -> Result<(), ConfigError> {
        validate(&config)?;
        *self.current.write() = Arc::new(config);
        self.bump();
        Ok(())
    }

    /// Insert or replace a route.
    pub fn upsert_route(&self, route: RouteConfig) -> Result<(), ConfigError> {
        let mut config = (*self.snapshot()).clone();
        match config.routes.iter_mut().find(|r| r.ae_title == route.ae_title) {
            Some(existing) => *existing = route,
            None => config.routes.push(route),
        }
        self.apply(config)
    }

    pub fn delete_route(&self, ae_title: &str) -> Result<(), ConfigError> {
        let mut config = (*self.snapshot()).clone();
        let before = config.routes.len();
        config.routes.retain(|r| r.ae_title != ae_title);
        if config.routes.len() == before {
            return Err(ConfigError::NotFound {
                entity: "route",
                name: ae_title.into(),
            });
        }
        self.apply(config)
    }

    /// Insert or replace a destination.
    pub fn upsert_destination(&self, dest: DestinationConfig) -> Result<(), ConfigError> {
        let mut config = (*self.snapshot()).clone();
        match config
            .destinations
            .iter_mut()
            .find(|d| d.name() == dest.name())
        {
            Some(existing) => *existing = dest,
            None => config.destinations.push(dest),
        }
        self.apply(config)
    }

    /// Delete a destination; fails while any route references it.
    pub fn delete_destination(&self, name: &str) -> Result<(), ConfigError> {
        let mut config = (*self.snapshot()).clone();
        let referenced = config.routes.iter().any(|r| {
            r.destinations.iter().any(|rd| rd.destination == name)
                || r.routing_rules.iter().any(|rule| match &rule.action {
                    crate::rules::RuleAction::AddDestination { destination } => destination == name,
                    _ => false,
                })
        });
        if referenced {
            return Err(ConfigError::DestinationInUse(name.into()));
        }
        let before = config.destinations.len();
        config.destinations.retain(|d| d.name() != name);
        if config.destinations.len() == before {
            return Err(ConfigError::NotFound {
                entity: "destination",
                name: name.into(),
            });
        }
        self.apply(config)
    }

    pub fn upsert_broker(&self, broker: BrokerConfig) -> Result<(), ConfigError> {
        let mut config = (*self.snapshot()).clone();
        match config.brokers.iter_mut().find(|b| b.name == broker.name) {
            Some(existing) => *existing = broker,
            None => config.brokers.push(broker),
        }
        self.apply(config)
    }

    pub fn delete_broker(&self, name: &str) -> Result<(), ConfigError> {
        let mut config = (*self.snapshot()).clone();
        let referenced = config.routes.iter().any(|r| {
            r.destinations
                .iter()
                .any(|rd| rd.broker.as_deref() == Some(name))
        });
        if referenced {
            return Err(ConfigError::Invalid(format!(
                "broker {} is referenced by a route destination",
                name
            )));
        }
        let before = config.brokers.len();
        config.brokers.retain(|b| b.name != name);
        if config.brokers.len() == before {
            return Err(ConfigError::NotFound {
                entity: "broker",
                name: name.into(),
            });
        }
        self.apply(config)
    }

    fn bump(&self) {
        self.generation_tx.send_modify(|g| *g += 1);
    }
}

/// Whole-document validation. Called on load and before every mutation.
pub fn validate(config: &GatewayConfig) -> Result<(), ConfigError> {
    if config.data_root.as_os_str().is_empty() {
        return Err(ConfigError::Invalid("data_root must be set".into()));
    }

    let mut seen_ae = std::collections::HashSet::new();
    let mut seen_port = std::collections::HashSet::new();
    for route in &config.routes {
        if route.ae_title.is_empty() || route.ae_title.len() > 16 {
            return Err(ConfigError::Invalid(format!(
                "AE title {:?} must be 1-16 characters",
                route.ae_title
            )));
        }
        if !seen_ae.insert(&route.ae_title) {
            return Err(ConfigError::Invalid(format!(
                "duplicate AE title {}",
                route.ae_title
            )));
        }
        if route.enabled && !seen_port.insert(route.port) {
            return Err(ConfigError::Invalid(format!(
                "port {} is bound by more than one enabled route",
                route.port
            )));
        }
        if route.tls {
            return Err(ConfigError::Invalid(format!(
                "route {}: TLS listeners are not supported by this build",
                route.ae_title
            )));
        }
        if route.worker_threads == 0 {
            return Err(ConfigError::Invalid(format!(
                "route {}: worker_threads must be at least 1",
                route.ae_title
            )));
        }
        for rd in &route.destinations {
            if config.destination(&rd.destination).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "route {} references unknown destination {}",
                    route.ae_title, rd.destination
                )));
            }
            if rd.anonymize && rd.script.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "route {} destination {}: anonymize requires a script name",
                    route.ae_title, rd.destination
                )));
            }
            if let Some(broker) = &rd.broker {
                if config.broker(broker).is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "route {} destination {} references unknown broker {}",
                        route.ae_title, rd.destination, broker
                    )));
                }
            }
        }
    }

    let mut seen_dest = std::collections::HashSet::new();
    for dest in &config.destinations {
        if dest.name().is_empty() {
            return Err(ConfigError::Invalid("destination with empty name".into()));
        }
        if !seen_dest.insert(dest.name().to_string()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate destination name {}",
                dest.name()
            )));
        }
        if let DestinationConfig::Xnat { url, .. } = dest {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "destination {}: XNAT url must be http(s)",
                    dest.name()
                )));
            }
        }
    }

    for broker in &config.brokers {
        if let Some(shift) = &broker.date_shift {
            if shift.min_days > shift.max_days {
                return Err(ConfigError::Invalid(format!(
                    "broker {}: date_shift min_days exceeds max_days",
                    broker.name
                )));
            }
        }
    }

    if config.routes.iter().all(|r| !r.enabled) && !config.routes.is_empty() {
        warn!("all routes are disabled");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResilienceConfig, RouteDestinationConfig};

    fn base_config() -> GatewayConfig {
        GatewayConfig {
            data_root: "/tmp/dicomgate".into(),
            scripts_dir: None,
            resilience: ResilienceConfig::default(),
            routes: vec![RouteConfig {
                ae_title: "INGEST".into(),
                port: 11112,
                enabled: true,
                description: String::new(),
                worker_threads: 2,
                max_concurrent_transfers: 2,
                max_concurrent_studies: 8,
                study_timeout_seconds: 30,
                rate_limit_per_minute: None,
                webhook_url: None,
                webhook_events: Vec::new(),
                review_required: false,
                auto_import: true,
                tls: false,
                accepted_sop_classes: Vec::new(),
                destinations: vec![RouteDestinationConfig {
                    destination: "peer1".into(),
                    anonymize: false,
                    script: None,
                    project: None,
                    subject: None,
                    session: None,
                    priority: 0,
                    max_retries: None,
                    retry_delay_seconds: None,
                    broker: None,
                    detect_pixel_phi: false,
                }],
                routing_rules: Vec::new(),
                validation_rules: Vec::new(),
                filters: Vec::new(),
            }],
            destinations: vec![DestinationConfig::DicomAe {
                name: "peer1".into(),
                enabled: true,
                host: "127.0.0.1".into(),
                port: 104,
                ae_title: "PEER1".into(),
                calling_ae_title: "DICOMGATE".into(),
                tls: false,
                timeout_seconds: 30,
                max_retries: 2,
            }],
            brokers: Vec::new(),
            ocr: None,
        }
    }

    #[test]
    fn test_valid_config_accepted() {
        assert!(ConfigStore::new(base_config()).is_ok());
    }

    #[test]
    fn test_unknown_destination_rejected() {
        let mut config = base_config();
        config.routes[0].destinations[0].destination = "nope".into();
        assert!(matches!(
            ConfigStore::new(config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_referenced_destination_cannot_be_deleted() {
        let store = ConfigStore::new(base_config()).unwrap();
        assert!(matches!(
            store.delete_destination("peer1"),
            Err(ConfigError::DestinationInUse(_))
        ));
    }

    #[test]
    fn test_delete_after_route_removed() {
        let store = ConfigStore::new(base_config()).unwrap();
        store.delete_route("INGEST").unwrap();
        store.delete_destination("peer1").unwrap();
        assert!(store.snapshot().destinations.is_empty());
    }

    #[test]
    fn test_generation_bumps_on_apply() {
        let store = ConfigStore::new(base_config()).unwrap();
        let rx = store.subscribe();
        let before = *rx.borrow();
        store.upsert_broker(BrokerConfig {
            name: "b1".into(),
            backend: crate::model::BrokerBackend::Local {
                path: "/tmp/b1.db".into(),
            },
            prefix: "SUBJ_".into(),
            date_shift: None,
            hash_uids: false,
            uid_root: "2.25".into(),
        })
        .unwrap();
        assert!(*store.subscribe().borrow() > before);
    }

    #[test]
    fn test_anonymize_requires_script() {
        let mut config = base_config();
        config.routes[0].destinations[0].anonymize = true;
        assert!(ConfigStore::new(config).is_err());
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let mut config = base_config();
        let mut second = config.routes[0].clone();
        second.ae_title = "INGEST2".into();
        config.routes.push(second);
        assert!(ConfigStore::new(config).is_err());
    }
}
