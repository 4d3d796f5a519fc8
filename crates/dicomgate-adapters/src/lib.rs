//! Destination adapters: a uniform `echo` / `send_study` / `close`
//! capability over the three transport kinds, plus the periodic health
//! monitor that keeps per-destination availability state.
//!
//! Adapters convert transport failures into [`TransportError`] with the
//! per-adapter transient/permanent classification; they never panic a
//! send task.

pub mod dicom;
pub mod filesystem;
pub mod health;
pub mod pattern;
pub mod registry;
pub mod xnat;

use async_trait::async_trait;
use dicomgate_types::{SendReport, TransportError};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Context handed to one `send_study` invocation: resolved naming plus the
/// tag values the filesystem pattern and XNAT naming templates draw from.
#[derive(Debug, Clone, Default)]
pub struct SendContext {
    pub study_uid: String,
    pub ae_title: String,
    pub project: Option<String>,
    pub subject: Option<String>,
    pub session: Option<String>,
    /// Keyword -> value extracted from the study's first instance
    pub tag_values: HashMap<String, String>,
}

/// Uniform capability set over the three transport kinds.
///
/// `send_study` returning `Ok` with `success == false` means a partial
/// store (some instances reached the destination); the caller decides
/// whether to retry the whole study. Implementations are safe to call
/// concurrently across distinct studies.
#[async_trait]
pub trait DestinationAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Liveness probe; used by the health monitor.
    async fn echo(&self, cancel: &CancellationToken) -> bool;

    async fn send_study(
        &self,
        files: &[PathBuf],
        ctx: &SendContext,
        cancel: &CancellationToken,
    ) -> Result<SendReport, TransportError>;

    /// Release pooled resources. Idempotent.
    async fn close(&self) {}
}

pub use health::{HealthMonitor, HealthSnapshot};
pub use pattern::render_pattern;
pub use registry::AdapterRegistry;
