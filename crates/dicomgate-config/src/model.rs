use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::rules::Rule;

fn default_worker_threads() -> usize {
    4
}

fn default_max_concurrent_transfers() -> usize {
    4
}

fn default_max_concurrent_studies() -> usize {
    16
}

fn default_study_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Inbound listener configuration (one per route).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// AE title announced on the association (max 16 chars)
    pub ae_title: String,
    /// TCP port the listener binds
    pub port: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    /// Worker pool size for the route's study pipeline
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Bound on concurrent adapter sends for this route
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,
    /// Studies in flight before the completion watchdog defers promotion
    #[serde(default = "default_max_concurrent_studies")]
    pub max_concurrent_studies: usize,
    /// Quiescence window for study-completion detection
    #[serde(default = "default_study_timeout")]
    pub study_timeout_seconds: u64,
    /// Associations admitted per rolling minute; absent means unlimited
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_events: Vec<String>,
    #[serde(default)]
    pub review_required: bool,
    #[serde(default = "default_true")]
    pub auto_import: bool,
    /// TLS for the inbound listener; must stay false on this build
    #[serde(default)]
    pub tls: bool,
    /// Storage SOP classes accepted in presentation contexts; empty means
    /// the common storage classes baked into the receiver
    #[serde(default)]
    pub accepted_sop_classes: Vec<String>,
    #[serde(default)]
    pub destinations: Vec<RouteDestinationConfig>,
    /// Rules that add or remove route destinations per study
    #[serde(default)]
    pub routing_rules: Vec<Rule>,
    /// Rules every instance must satisfy
    #[serde(default)]
    pub validation_rules: Vec<Rule>,
    /// Accept/reject filters applied before an instance is written
    #[serde(default)]
    pub filters: Vec<Rule>,
}

impl RouteConfig {
    pub fn quiescence(&self) -> Duration {
        Duration::from_secs(self.study_timeout_seconds)
    }
}

/// Binding of a route to a named destination, with processing options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDestinationConfig {
    /// Name of the referenced [`DestinationConfig`]
    pub destination: String,
    #[serde(default)]
    pub anonymize: bool,
    /// Anonymization script name; required when `anonymize` is set
    #[serde(default)]
    pub script: Option<String>,
    /// XNAT naming overrides; templates over DICOM tag values
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub session: Option<String>,
    /// Fan-out ordering; lower runs first, equal may run concurrently
    #[serde(default)]
    pub priority: u32,
    /// Override of the resilience-level retry budget
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_seconds: Option<u64>,
    /// Honest-broker binding applied during anonymization
    #[serde(default)]
    pub broker: Option<String>,
    /// Ask the OCR service for burned-in PHI regions
    #[serde(default)]
    pub detect_pixel_phi: bool,
}

/// Named sink. The variant set matches the three supported transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DestinationConfig {
    Xnat {
        name: String,
        #[serde(default = "default_true")]
        enabled: bool,
        url: String,
        username: String,
        password: String,
        #[serde(default = "default_xnat_timeout")]
        timeout_seconds: u64,
        #[serde(default = "default_transport_retries")]
        max_retries: u32,
        #[serde(default = "default_pool_size")]
        pool_size: usize,
        /// Import endpoint; the stock XNAT service path by default
        #[serde(default = "default_import_path")]
        import_path: String,
        #[serde(default = "default_true")]
        auto_archive: bool,
    },
    DicomAe {
        name: String,
        #[serde(default = "default_true")]
        enabled: bool,
        host: String,
        port: u16,
        /// Peer (called) AE title
        ae_title: String,
        /// Calling AE title presented to the peer
        #[serde(default = "default_calling_ae")]
        calling_ae_title: String,
        #[serde(default)]
        tls: bool,
        #[serde(default = "default_dicom_timeout")]
        timeout_seconds: u64,
        #[serde(default = "default_transport_retries")]
        max_retries: u32,
    },
    Filesystem {
        name: String,
        #[serde(default = "default_true")]
        enabled: bool,
        path: PathBuf,
        #[serde(default = "default_true")]
        create_subdirs: bool,
        /// `{Tag}` template, e.g. `{PatientID}/{StudyDate}`
        #[serde(default = "default_fs_pattern")]
        naming_pattern: String,
    },
}

fn default_xnat_timeout() -> u64 {
    120
}

fn default_dicom_timeout() -> u64 {
    30
}

fn default_transport_retries() -> u32 {
    2
}

fn default_pool_size() -> usize {
    4
}

fn default_import_path() -> String {
    "/data/services/import".to_string()
}

fn default_calling_ae() -> String {
    "DICOMGATE".to_string()
}

fn default_fs_pattern() -> String {
    "{PatientID}/{StudyDate}".to_string()
}

impl DestinationConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Xnat { name, .. } => name,
            Self::DicomAe { name, .. } => name,
            Self::Filesystem { name, .. } => name,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            Self::Xnat { enabled, .. } => *enabled,
            Self::DicomAe { enabled, .. } => *enabled,
            Self::Filesystem { enabled, .. } => *enabled,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Xnat { .. } => "xnat",
            Self::DicomAe { .. } => "dicom_ae",
            Self::Filesystem { .. } => "filesystem",
        }
    }
}

/// Stable random date-shift window, in days.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DateShiftConfig {
    pub min_days: i64,
    pub max_days: i64,
}

/// Honest-broker backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BrokerBackend {
    /// Embedded SQLite database
    Local { path: PathBuf },
    /// Remote HTTP API with in-memory TTL cache
    Remote {
        url: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default = "default_cache_ttl")]
        cache_ttl_seconds: u64,
        #[serde(default = "default_cache_max")]
        cache_max_entries: usize,
    },
    /// External lookup executable
    Script { command: String },
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_cache_max() -> usize {
    10_000
}

/// Honest-broker configuration: a backend plus the transforms the
/// anonymizer applies when a route destination binds this broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub name: String,
    #[serde(flatten)]
    pub backend: BrokerBackend,
    /// Prefix prepended to mapped identifiers
    #[serde(default = "default_subject_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub date_shift: Option<DateShiftConfig>,
    /// Replace Study/Series/SOP UIDs with hash-derived UIDs
    #[serde(default)]
    pub hash_uids: bool,
    /// Site-owned UID root for hashed UIDs
    #[serde(default = "default_uid_root")]
    pub uid_root: String,
}

fn default_subject_prefix() -> String {
    "SUBJ_".to_string()
}

fn default_uid_root() -> String {
    "2.25".to_string()
}

/// OCR text-detection service consumed by the anonymizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    pub url: String,
    #[serde(default = "default_ocr_timeout")]
    pub timeout_seconds: u64,
    /// Padding added around detected PHI boxes before merging
    #[serde(default = "default_ocr_padding")]
    pub region_padding: u32,
}

fn default_ocr_timeout() -> u64 {
    60
}

fn default_ocr_padding() -> u32 {
    4
}

/// Gateway-wide resilience knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_health_interval")]
    pub health_check_interval_seconds: u64,
    /// Bound on concurrent health probes
    #[serde(default = "default_probe_bound")]
    pub health_probe_concurrency: usize,
    /// Scratch space for temp zips and staging
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_pipeline_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_seconds: u64,
    /// History files older than this are purged
    #[serde(default = "default_retention")]
    pub retention_days: i64,
    /// -1 disables archive purging
    #[serde(default = "default_disabled_retention")]
    pub archive_retention_days: i64,
    /// -1 disables deleted purging
    #[serde(default = "default_disabled_retention")]
    pub deleted_retention_days: i64,
    #[serde(default = "default_graceful_stop")]
    pub graceful_stop_seconds: u64,
    /// Site-specific MRN shapes for the residual-PHI scan
    #[serde(default)]
    pub mrn_patterns: Vec<String>,
}

fn default_health_interval() -> u64 {
    30
}

fn default_probe_bound() -> usize {
    4
}

fn default_pipeline_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    30
}

fn default_max_retry_delay() -> u64 {
    900
}

fn default_retention() -> i64 {
    90
}

fn default_disabled_retention() -> i64 {
    -1
}

fn default_graceful_stop() -> u64 {
    30
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            health_check_interval_seconds: default_health_interval(),
            health_probe_concurrency: default_probe_bound(),
            cache_dir: None,
            max_retries: default_pipeline_retries(),
            retry_delay_seconds: default_retry_delay(),
            max_retry_delay_seconds: default_max_retry_delay(),
            retention_days: default_retention(),
            archive_retention_days: default_disabled_retention(),
            deleted_retention_days: default_disabled_retention(),
            graceful_stop_seconds: default_graceful_stop(),
            mrn_patterns: Vec::new(),
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Root of the per-AE data tree
    pub data_root: PathBuf,
    /// Custom anonymization scripts directory; `<data_root>/scripts` if unset
    #[serde(default)]
    pub scripts_dir: Option<PathBuf>,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
    #[serde(default)]
    pub brokers: Vec<BrokerConfig>,
    #[serde(default)]
    pub ocr: Option<OcrConfig>,
}

impl GatewayConfig {
    pub fn route(&self, ae_title: &str) -> Option<&RouteConfig> {
        self.routes.iter().find(|r| r.ae_title == ae_title)
    }

    pub fn destination(&self, name: &str) -> Option<&DestinationConfig> {
        self.destinations.iter().find(|d| d.name() == name)
    }

    pub fn broker(&self, name: &str) -> Option<&BrokerConfig> {
        self.brokers.iter().find(|b| b.name == name)
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.scripts_dir
            .clone()
            .unwrap_or_else(|| self.data_root.join("scripts"))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.resilience
            .cache_dir
            .clone()
            .unwrap_or_else(|| self.data_root.join("cache"))
    }
}
