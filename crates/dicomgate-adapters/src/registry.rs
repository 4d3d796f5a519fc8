use dashmap::DashMap;
use dicomgate_config::{ConfigStore, DestinationConfig};
use dicomgate_types::GatewayError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::dicom::{DicomAeAdapter, DicomAeConfig};
use crate::filesystem::{FilesystemAdapter, FilesystemConfig};
use crate::xnat::{XnatAdapter, XnatConfig};
use crate::DestinationAdapter;

/// Owned registry of adapter instances, keyed by destination name and
/// rebuilt lazily after a configuration generation bump.
pub struct AdapterRegistry {
    config: Arc<ConfigStore>,
    cache_dir: PathBuf,
    adapters: DashMap<String, Arc<dyn DestinationAdapter>>,
    generation: AtomicU64,
}

impl AdapterRegistry {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        let cache_dir = config.snapshot().cache_dir();
        Self {
            config,
            cache_dir,
            adapters: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    fn build(&self, dest: &DestinationConfig) -> Result<Arc<dyn DestinationAdapter>, GatewayError> {
        let built: Arc<dyn DestinationAdapter> = match dest {
            DestinationConfig::DicomAe {
                name,
                host,
                port,
                ae_title,
                calling_ae_title,
                timeout_seconds,
                max_retries,
                ..
            } => Arc::new(DicomAeAdapter::new(DicomAeConfig {
                name: name.clone(),
                host: host.clone(),
                port: *port,
                peer_ae: ae_title.clone(),
                calling_ae: calling_ae_title.clone(),
                timeout: Duration::from_secs(*timeout_seconds),
                max_retries: *max_retries,
            })),
            DestinationConfig::Xnat {
                name,
                url,
                username,
                password,
                timeout_seconds,
                max_retries,
                pool_size,
                import_path,
                auto_archive,
                ..
            } => Arc::new(
                XnatAdapter::new(XnatConfig {
                    name: name.clone(),
                    url: url.clone(),
                    username: username.clone(),
                    password: password.clone(),
                    import_path: import_path.clone(),
                    auto_archive: *auto_archive,
                    timeout: Duration::from_secs(*timeout_seconds),
                    max_retries: *max_retries,
                    pool_size: *pool_size,
                    cache_dir: self.cache_dir.clone(),
                })
                .map_err(GatewayError::Transport)?,
            ),
            DestinationConfig::Filesystem {
                name,
                path,
                create_subdirs,
                naming_pattern,
                ..
            } => Arc::new(FilesystemAdapter::new(FilesystemConfig {
                name: name.clone(),
                base_path: path.clone(),
                create_subdirs: *create_subdirs,
                naming_pattern: naming_pattern.clone(),
            })),
        };
        info!(destination = %dest.name(), kind = dest.kind(), "adapter built");
        Ok(built)
    }

    /// Fetch (building on first use) the adapter for an enabled
    /// destination.
    pub fn get(&self, name: &str) -> Result<Arc<dyn DestinationAdapter>, GatewayError> {
        let current = *self.config.subscribe().borrow();
        let seen = self.generation.swap(current, Ordering::SeqCst);
        if seen != current {
            self.adapters.clear();
        }

        if let Some(existing) = self.adapters.get(name) {
            return Ok(existing.value().clone());
        }
        let snapshot = self.config.snapshot();
        let dest = snapshot
            .destination(name)
            .ok_or_else(|| GatewayError::not_found("destination", name))?;
        let built = self.build(dest)?;
        self.adapters.insert(name.to_string(), built.clone());
        Ok(built)
    }

    /// Names of all enabled destinations in the current config.
    pub fn enabled_destinations(&self) -> Vec<String> {
        self.config
            .snapshot()
            .destinations
            .iter()
            .filter(|d| d.enabled())
            .map(|d| d.name().to_string())
            .collect()
    }

    pub async fn close_all(&self) {
        for entry in self.adapters.iter() {
            entry.value().close().await;
        }
        self.adapters.clear();
    }
}
