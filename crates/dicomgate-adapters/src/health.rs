use dashmap::DashMap;
use dicomgate_types::DestinationHealth;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::AdapterRegistry;

/// Point-in-time view of every destination's health.
pub type HealthSnapshot = Vec<DestinationHealth>;

/// Periodic `echo()` prober. One loop covers every enabled destination,
/// probing in parallel up to a small bound; per-destination records are
/// updated atomically under their map entry. Consumers read the cached
/// `available` flag and never wait on a probe.
pub struct HealthMonitor {
    registry: Arc<AdapterRegistry>,
    records: Arc<DashMap<String, DestinationHealth>>,
    interval: Duration,
    probe_bound: usize,
}

impl HealthMonitor {
    pub fn new(registry: Arc<AdapterRegistry>, interval: Duration, probe_bound: usize) -> Self {
        Self {
            registry,
            records: Arc::new(DashMap::new()),
            interval,
            probe_bound: probe_bound.max(1),
        }
    }

    /// Cached availability; a destination never probed yet counts as
    /// available so the first fan-out is attempted.
    pub fn is_available(&self, destination: &str) -> bool {
        self.records
            .get(destination)
            .map(|h| h.available)
            .unwrap_or(true)
    }

    pub fn health_of(&self, destination: &str) -> Option<DestinationHealth> {
        self.records.get(destination).map(|h| h.value().clone())
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let mut all: Vec<_> = self.records.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.destination.cmp(&b.destination));
        all
    }

    /// One probe pass over every enabled destination.
    pub async fn probe_all(&self, cancel: &CancellationToken) {
        let destinations = self.registry.enabled_destinations();
        debug!(count = destinations.len(), "health probe pass");

        stream::iter(destinations)
            .for_each_concurrent(self.probe_bound, |name| {
                let cancel = cancel.clone();
                async move {
                    let ok = match self.registry.get(&name) {
                        Ok(adapter) => adapter.echo(&cancel).await,
                        Err(e) => {
                            warn!(destination = %name, error = %e, "cannot build adapter for probe");
                            false
                        }
                    };
                    let mut record = self
                        .records
                        .entry(name.clone())
                        .or_insert_with(|| DestinationHealth::new(&name));
                    let was_available = record.available;
                    if ok {
                        record.record_success();
                    } else {
                        record.record_failure();
                    }
                    if was_available != record.available {
                        info!(
                            destination = %name,
                            available = record.available,
                            consecutive_failures = record.consecutive_failures,
                            "destination availability changed"
                        );
                    }
                }
            })
            .await;
    }

    /// Probe loop; runs until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "health monitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_all(&cancel).await,
                _ = cancel.cancelled() => break,
            }
        }
        info!("health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicomgate_config::{ConfigStore, DestinationConfig, GatewayConfig, ResilienceConfig};

    fn store_with_fs_dest(path: std::path::PathBuf) -> Arc<ConfigStore> {
        let config = GatewayConfig {
            data_root: path.clone(),
            scripts_dir: None,
            resilience: ResilienceConfig::default(),
            routes: Vec::new(),
            destinations: vec![DestinationConfig::Filesystem {
                name: "fs1".into(),
                enabled: true,
                path: path.join("sink"),
                create_subdirs: true,
                naming_pattern: "{PatientID}".into(),
            }],
            brokers: Vec::new(),
            ocr: None,
        };
        Arc::new(ConfigStore::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_probe_updates_bookkeeping() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = store_with_fs_dest(tmp.path().to_path_buf());
        let registry = Arc::new(AdapterRegistry::new(store));
        let monitor = HealthMonitor::new(registry, Duration::from_secs(30), 2);

        // unknown destination defaults to available
        assert!(monitor.is_available("fs1"));

        monitor.probe_all(&CancellationToken::new()).await;
        let health = monitor.health_of("fs1").unwrap();
        assert!(health.available);
        assert_eq!(health.total_checks, 1);
        assert_eq!(health.successful_checks, 1);
        assert_eq!(health.availability_percent(), 100.0);
        assert!(health.unavailable_since.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_sorted() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = store_with_fs_dest(tmp.path().to_path_buf());
        let registry = Arc::new(AdapterRegistry::new(store));
        let monitor = HealthMonitor::new(registry, Duration::from_secs(30), 2);
        monitor.probe_all(&CancellationToken::new()).await;
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].destination, "fs1");
    }
}
