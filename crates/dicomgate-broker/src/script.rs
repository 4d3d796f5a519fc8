use async_trait::async_trait;
use dicomgate_types::GatewayError;
use tracing::debug;

use crate::{Crosswalk, IdType};

/// Crosswalk backend that shells out to a site-provided lookup executable.
///
/// The command is invoked as `<command> <id_type> <input_id>`; the mapped
/// identifier is expected on stdout, one line.
pub struct ScriptBroker {
    name: String,
    command: String,
}

impl ScriptBroker {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

#[async_trait]
impl Crosswalk for ScriptBroker {
    async fn lookup(&self, input_id: &str, id_type: IdType) -> Result<String, GatewayError> {
        let output = tokio::process::Command::new(&self.command)
            .arg(id_type.as_str())
            .arg(input_id)
            .output()
            .await
            .map_err(|e| {
                GatewayError::crosswalk(format!("lookup script {} failed: {}", self.command, e))
            })?;
        if !output.status.success() {
            return Err(GatewayError::crosswalk(format!(
                "lookup script {} exited with {}",
                self.command, output.status
            )));
        }
        let mapped = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if mapped.is_empty() {
            return Err(GatewayError::crosswalk(format!(
                "lookup script {} produced no output",
                self.command
            )));
        }
        debug!(broker = %self.name, "script lookup completed");
        Ok(mapped)
    }

    async fn test(&self) -> Result<(), GatewayError> {
        // a probe id; any successful exit counts
        self.lookup("__probe__", IdType::PatientId).await.map(|_| ())
    }
}
