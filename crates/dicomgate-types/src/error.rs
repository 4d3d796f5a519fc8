use thiserror::Error;

/// Whether a transport failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// Retry-eligible: the retry manager schedules another attempt
    Transient,
    /// Terminal: no further attempts
    Permanent,
}

/// Error produced at an adapter boundary. Adapters convert low-level
/// transport failures into this type and attach a human-readable message;
/// classification follows the per-adapter rules (DICOM status codes, HTTP
/// status classes, filesystem errno).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub kind: TransportErrorKind,
    /// Structured detail (status code, errno, peer response) for the record
    pub details: Option<String>,
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TransportErrorKind::Transient,
            details: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TransportErrorKind::Permanent,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == TransportErrorKind::Transient
    }
}

/// Gateway-wide error taxonomy. These are signals to the pipeline, not
/// transport-layer codes; adapters and subsystems convert their failures
/// into one of these at their boundary.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Invalid configuration: the process refuses to start (exit code 1)
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Transport failure, already classified by the adapter
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Anonymization failed; the study moves to `failed/`
    #[error("anonymization error: {message}")]
    Anonymization { message: String },

    /// Atomic rename between state directories failed; the study stays in
    /// its source directory and the next startup scan re-attempts
    #[error("state transition failed for study {study_uid} ({from} -> {to}): {source}")]
    StateTransition {
        study_uid: String,
        from: String,
        to: String,
        #[source]
        source: std::io::Error,
    },

    /// Human review rejection; terminal, requires re-ingestion
    #[error("rejected: {reason}")]
    ReviewRejected { reason: String },

    /// Inbound association rejected at DIMSE level; not a study error
    #[error("rate limit exceeded for AE {ae_title}")]
    RateLimited { ae_title: String },

    #[error("crosswalk error: {message}")]
    Crosswalk { message: String },

    /// Malformed or unserviceable DICOM protocol traffic on an inbound
    /// association; the association is dropped, no study error recorded
    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("unknown {entity}: {name}")]
    NotFound { entity: &'static str, name: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn anonymization(message: impl Into<String>) -> Self {
        Self::Anonymization {
            message: message.into(),
        }
    }

    pub fn crosswalk(message: impl Into<String>) -> Self {
        Self::Crosswalk {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        let e = TransportError::transient("connection reset").with_details("ECONNRESET");
        assert!(e.is_transient());
        assert_eq!(e.details.as_deref(), Some("ECONNRESET"));

        let e = TransportError::permanent("bad request");
        assert!(!e.is_transient());
    }

    #[test]
    fn test_error_display() {
        let e = GatewayError::ReviewRejected {
            reason: "missing consent".into(),
        };
        assert_eq!(e.to_string(), "rejected: missing consent");
    }
}
