//! Honest-broker crosswalk: stable `(broker, input_id, id_type)` to
//! pseudo-identifier mapping with three interchangeable backends, plus the
//! deterministic date-shift and UID-hashing transforms the anonymizer
//! applies when a route destination binds a broker.

pub mod local;
pub mod registry;
pub mod remote;
pub mod script;
pub mod transform;

use async_trait::async_trait;
use dicomgate_types::GatewayError;

/// Identifier category being mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdType {
    PatientId,
    PatientName,
    Accession,
}

impl IdType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PatientId => "patient_id",
            Self::PatientName => "patient_name",
            Self::Accession => "accession",
        }
    }
}

/// Uniform lookup interface over the three backend kinds.
#[async_trait]
pub trait Crosswalk: Send + Sync {
    /// Stable mapping: repeated calls with the same input yield the same
    /// output, across restarts for persistent backends.
    async fn lookup(&self, input_id: &str, id_type: IdType) -> Result<String, GatewayError>;

    /// Connectivity / sanity probe for the admin surface.
    async fn test(&self) -> Result<(), GatewayError>;

    /// Drop any cached state. No-op for uncached backends.
    fn clear_cache(&self) {}
}

pub use local::LocalBroker;
pub use registry::BrokerRegistry;
pub use remote::RemoteBroker;
pub use script::ScriptBroker;
pub use transform::{hash_uid, stable_date_shift, shift_da_value};
