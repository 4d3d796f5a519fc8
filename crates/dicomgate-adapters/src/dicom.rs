use async_trait::async_trait;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::open_file;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::association::client::{ClientAssociation, ClientAssociationOptions};
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use dicomgate_dimse as dimse;
use dicomgate_types::{SendReport, TransportError};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{DestinationAdapter, SendContext};

/// C-STORE / C-ECHO peer configuration.
#[derive(Debug, Clone)]
pub struct DicomAeConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub peer_ae: String,
    pub calling_ae: String,
    pub timeout: Duration,
    /// Internal per-association retries for transient failures, distinct
    /// from the pipeline-level retry queue
    pub max_retries: u32,
}

/// DICOM peer adapter. The upper-layer association API is blocking, so
/// every network call runs on the blocking pool; cancellation is checked
/// between instances.
pub struct DicomAeAdapter {
    config: DicomAeConfig,
}

impl DicomAeAdapter {
    pub fn new(config: DicomAeConfig) -> Self {
        Self { config }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    fn echo_blocking(config: &DicomAeConfig, addr: &str) -> Result<(), TransportError> {
        let mut assoc = ClientAssociationOptions::new()
            .with_abstract_syntax(dimse::VERIFICATION_SOP_CLASS)
            .calling_ae_title(config.calling_ae.as_str())
            .called_ae_title(config.peer_ae.as_str())
            .read_timeout(config.timeout)
            .establish_with(addr)
            .map_err(|e| TransportError::transient(format!("association refused: {}", e)))?;

        let pc = accepted_context(&assoc, 0)
            .ok_or_else(|| TransportError::permanent("verification context not accepted"))?;

        let cmd = dimse::encode_command(&dimse::echo_rq(1))
            .map_err(|e| TransportError::permanent(e.to_string()))?;
        assoc
            .send(&Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: pc,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: cmd,
                }],
            })
            .map_err(|e| TransportError::transient(format!("echo send failed: {}", e)))?;

        let status = receive_status(&mut assoc)?;
        let _ = assoc.release();
        if dimse::status_is_success(status) {
            Ok(())
        } else {
            Err(classify_status(status, "echo"))
        }
    }

    fn send_blocking(
        config: &DicomAeConfig,
        addr: &str,
        files: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<SendReport, TransportError> {
        let started = Instant::now();

        // Collect the distinct storage classes up front so the association
        // negotiates a context per class.
        let mut sop_classes: Vec<String> = Vec::new();
        let mut instances = Vec::with_capacity(files.len());
        for file in files {
            let obj = open_file(file)
                .map_err(|e| TransportError::permanent(format!("cannot parse {}: {}", file.display(), e)))?;
            let sop_class = obj.meta().media_storage_sop_class_uid.trim_end_matches('\0').to_string();
            let sop_instance = obj
                .meta()
                .media_storage_sop_instance_uid
                .trim_end_matches('\0')
                .to_string();
            if !sop_classes.contains(&sop_class) {
                sop_classes.push(sop_class.clone());
            }
            instances.push((file.clone(), obj, sop_class, sop_instance));
        }

        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(config.calling_ae.as_str())
            .called_ae_title(config.peer_ae.as_str())
            .read_timeout(config.timeout);
        for sop_class in &sop_classes {
            options = options.with_abstract_syntax(sop_class.clone());
        }
        let mut assoc = options
            .establish_with(addr)
            .map_err(|e| TransportError::transient(format!("association refused: {}", e)))?;

        let registry = TransferSyntaxRegistry;
        let mut transferred = 0usize;
        let mut last_error: Option<String> = None;

        for (message_id, (file, obj, sop_class, sop_instance)) in instances.into_iter().enumerate()
        {
            if cancel.is_cancelled() {
                let _ = assoc.abort();
                return Err(TransportError::transient("send cancelled"));
            }
            let class_index = sop_classes
                .iter()
                .position(|c| c == &sop_class)
                .expect("class collected above");
            let Some(pc_id) = accepted_context(&assoc, class_index) else {
                last_error = Some(format!("no accepted context for {}", sop_class));
                continue;
            };
            let ts_uid = context_transfer_syntax(&assoc, pc_id);
            let Some(ts) = registry.get(&ts_uid) else {
                last_error = Some(format!("unknown negotiated transfer syntax {}", ts_uid));
                continue;
            };

            let mut dataset = Vec::new();
            if let Err(e) = obj.write_dataset_with_ts(&mut dataset, ts) {
                warn!(file = %file.display(), error = %e, "cannot transcode instance");
                last_error = Some(format!("transcode failed: {}", e));
                continue;
            }

            let cmd = dimse::encode_command(&dimse::store_rq(
                (message_id + 1) as u16,
                &sop_class,
                &sop_instance,
                0,
            ))
            .map_err(|e| TransportError::permanent(e.to_string()))?;

            assoc
                .send(&Pdu::PData {
                    data: vec![PDataValue {
                        presentation_context_id: pc_id,
                        value_type: PDataValueType::Command,
                        is_last: true,
                        data: cmd,
                    }],
                })
                .map_err(|e| TransportError::transient(format!("store send failed: {}", e)))?;

            {
                let mut writer = assoc
                    .send_pdata(pc_id);
                writer
                    .write_all(&dataset)
                    .map_err(|e| TransportError::transient(format!("store data failed: {}", e)))?;
            }

            match receive_status(&mut assoc) {
                Ok(status) if dimse::status_is_success(status) || dimse::status_is_warning(status) => {
                    transferred += 1;
                    debug!(file = %file.display(), status, "instance stored");
                }
                Ok(status) => {
                    let err = classify_status(status, "store");
                    warn!(file = %file.display(), status, "peer rejected instance");
                    if !err.is_transient() {
                        // permanent per-instance refusal; keep going so the
                        // rest of the study still transfers
                        last_error = Some(err.message);
                    } else {
                        last_error = Some(err.message);
                    }
                }
                Err(e) => {
                    let _ = assoc.abort();
                    return Err(e);
                }
            }
        }

        let _ = assoc.release();
        let duration = started.elapsed();
        let total = files.len();
        if transferred == total {
            info!(peer = %config.peer_ae, files = total, "study stored");
            Ok(SendReport::success(transferred, duration))
        } else if transferred > 0 {
            let mut report = SendReport::partial(transferred, total, duration);
            if let Some(err) = last_error {
                report.message = Some(format!("{} ({})", report.message.unwrap_or_default(), err));
            }
            Ok(report)
        } else {
            Err(TransportError::transient(
                last_error.unwrap_or_else(|| "no instance stored".into()),
            ))
        }
    }
}

/// Presentation context id for the n-th requested abstract syntax; the
/// client options assign odd ids in request order.
fn accepted_context(assoc: &ClientAssociation<std::net::TcpStream>, index: usize) -> Option<u8> {
    let wanted = (index * 2 + 1) as u8;
    assoc
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == wanted && pc.reason == dicom_ul::pdu::PresentationContextResultReason::Acceptance)
        .map(|pc| pc.id)
}

fn context_transfer_syntax(assoc: &ClientAssociation<std::net::TcpStream>, pc_id: u8) -> String {
    assoc
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == pc_id)
        .map(|pc| pc.transfer_syntax.trim().to_string())
        .unwrap_or_else(|| dimse::IMPLICIT_VR_LE.to_string())
}

/// Drain PDUs until a command response arrives, returning its status.
fn receive_status(assoc: &mut ClientAssociation<std::net::TcpStream>) -> Result<u16, TransportError> {
    loop {
        let pdu = assoc
            .receive()
            .map_err(|e| TransportError::transient(format!("receive failed: {}", e)))?;
        match pdu {
            Pdu::PData { data } => {
                for pdv in data {
                    if pdv.value_type == PDataValueType::Command && pdv.is_last {
                        let cmd = dimse::decode_command(&pdv.data)
                            .map_err(|e| TransportError::permanent(e.to_string()))?;
                        return dimse::status_of(&cmd)
                            .map_err(|e| TransportError::permanent(e.to_string()));
                    }
                }
            }
            Pdu::AbortRQ { .. } => {
                return Err(TransportError::transient("peer aborted association"))
            }
            other => {
                return Err(TransportError::transient(format!(
                    "unexpected pdu {:?} while awaiting response",
                    other
                )))
            }
        }
    }
}

fn classify_status(status: u16, operation: &str) -> TransportError {
    let message = format!("{} returned status 0x{:04X}", operation, status);
    if dimse::status_is_permanent(status) {
        TransportError::permanent(message).with_details(format!("0x{:04X}", status))
    } else {
        // 0xCxxx and anything unrecognized is treated as retryable
        TransportError::transient(message).with_details(format!("0x{:04X}", status))
    }
}

#[async_trait]
impl DestinationAdapter for DicomAeAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn echo(&self, _cancel: &CancellationToken) -> bool {
        let config = self.config.clone();
        let addr = self.addr();
        tokio::task::spawn_blocking(move || Self::echo_blocking(&config, &addr))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    async fn send_study(
        &self,
        files: &[PathBuf],
        _ctx: &SendContext,
        cancel: &CancellationToken,
    ) -> Result<SendReport, TransportError> {
        let config = self.config.clone();
        let addr = self.addr();
        let files = files.to_vec();
        let cancel = cancel.clone();

        let mut attempt = 0;
        loop {
            let config_inner = config.clone();
            let addr_inner = addr.clone();
            let files_inner = files.clone();
            let cancel_inner = cancel.clone();
            let result = tokio::task::spawn_blocking(move || {
                Self::send_blocking(&config_inner, &addr_inner, &files_inner, &cancel_inner)
            })
            .await
            .map_err(|e| TransportError::permanent(format!("send task failed: {}", e)))?;

            match result {
                Err(e) if e.is_transient() && attempt < config.max_retries && !cancel.is_cancelled() => {
                    attempt += 1;
                    debug!(peer = %config.peer_ae, attempt, "transient store failure, retrying association");
                    tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
                }
                other => return other,
            }
        }
    }
}
