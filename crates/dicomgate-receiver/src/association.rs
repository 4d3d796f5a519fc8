use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::{mem::InMemDicomObject, FileMetaTableBuilder};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::association::server::{ServerAssociation, ServerAssociationOptions};
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use dicomgate_config::{rules, RouteConfig};
use dicomgate_dimse as dimse;
use dicomgate_storage::StudyStage;
use dicomgate_types::GatewayError;
use std::collections::HashSet;
use std::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::extract;
use crate::registry::StudyRegistry;

/// Storage SOP classes accepted when a route does not enumerate its own.
pub const DEFAULT_STORAGE_CLASSES: &[&str] = &[
    "1.2.840.10008.5.1.4.1.1.1",      // CR Image Storage
    "1.2.840.10008.5.1.4.1.1.1.1",    // Digital X-Ray
    "1.2.840.10008.5.1.4.1.1.1.2",    // Digital Mammography
    "1.2.840.10008.5.1.4.1.1.2",      // CT Image Storage
    "1.2.840.10008.5.1.4.1.1.2.1",    // Enhanced CT
    "1.2.840.10008.5.1.4.1.1.4",      // MR Image Storage
    "1.2.840.10008.5.1.4.1.1.4.1",    // Enhanced MR
    "1.2.840.10008.5.1.4.1.1.6.1",    // Ultrasound
    "1.2.840.10008.5.1.4.1.1.7",      // Secondary Capture
    "1.2.840.10008.5.1.4.1.1.12.1",   // X-Ray Angiographic
    "1.2.840.10008.5.1.4.1.1.12.2",   // X-Ray RF
    "1.2.840.10008.5.1.4.1.1.20",     // NM Image Storage
    "1.2.840.10008.5.1.4.1.1.128",    // PET Image Storage
];

/// Pending C-STORE awaiting its data set.
struct PendingStore {
    presentation_context_id: u8,
    message_id: u16,
    sop_class_uid: String,
    sop_instance_uid: String,
    data: Vec<u8>,
}

/// Handle one accepted TCP connection as a DICOM association. Blocking;
/// runs on the blocking pool, one task per association.
pub fn handle_association(
    stream: TcpStream,
    route: &RouteConfig,
    registry: &StudyRegistry,
    cancel: &CancellationToken,
) -> Result<(), GatewayError> {
    let mut options = ServerAssociationOptions::new()
        .accept_any()
        .ae_title(route.ae_title.as_str())
        .with_abstract_syntax(dimse::VERIFICATION_SOP_CLASS);
    let storage_classes: Vec<String> = if route.accepted_sop_classes.is_empty() {
        DEFAULT_STORAGE_CLASSES.iter().map(|s| s.to_string()).collect()
    } else {
        route.accepted_sop_classes.clone()
    };
    for sop_class in &storage_classes {
        options = options.with_abstract_syntax(sop_class.clone());
    }

    let mut assoc = options
        .establish(stream)
        .map_err(|e| GatewayError::protocol(format!("association establish failed: {}", e)))?;
    let source_ae = assoc.client_ae_title().trim().to_string();
    debug!(ae = %route.ae_title, peer = %source_ae, "association established");

    let mut pending: Option<PendingStore> = None;
    let mut command_buf: Vec<u8> = Vec::new();
    let mut touched: HashSet<String> = HashSet::new();

    loop {
        if cancel.is_cancelled() {
            let _ = assoc.send(&Pdu::AbortRQ {
                source: dicom_ul::pdu::AbortRQSource::ServiceProvider(
                    dicom_ul::pdu::AbortRQServiceProviderReason::ReasonNotSpecified,
                ),
            });
            break;
        }
        let pdu = match assoc.receive() {
            Ok(pdu) => pdu,
            Err(e) => {
                debug!(ae = %route.ae_title, peer = %source_ae, error = %e, "association ended");
                break;
            }
        };
        match pdu {
            Pdu::PData { data } => {
                for pdv in data {
                    match pdv.value_type {
                        PDataValueType::Command => {
                            command_buf.extend_from_slice(&pdv.data);
                            if !pdv.is_last {
                                continue;
                            }
                            let command = dimse::decode_command(&command_buf)
                                .map_err(|e| GatewayError::protocol(e.to_string()))?;
                            command_buf.clear();
                            match dimse::command_field_of(&command) {
                                Ok(dimse::command_field::C_ECHO_RQ) => {
                                    respond_echo(&mut assoc, pdv.presentation_context_id, &command)?;
                                }
                                Ok(dimse::command_field::C_STORE_RQ) => {
                                    pending = Some(PendingStore {
                                        presentation_context_id: pdv.presentation_context_id,
                                        message_id: dimse::message_id_of(&command).unwrap_or(0),
                                        sop_class_uid: dimse::affected_sop_class_of(&command)
                                            .unwrap_or_default(),
                                        sop_instance_uid: dimse::affected_sop_instance_of(&command)
                                            .unwrap_or_default(),
                                        data: Vec::new(),
                                    });
                                }
                                Ok(other) => {
                                    warn!(ae = %route.ae_title, command = other, "unsupported command, aborting");
                                    let _ = assoc.send(&Pdu::AbortRQ {
                                        source: dicom_ul::pdu::AbortRQSource::ServiceProvider(
                                            dicom_ul::pdu::AbortRQServiceProviderReason::ReasonNotSpecified,
                                        ),
                                    });
                                    return Ok(());
                                }
                                Err(e) => {
                                    warn!(ae = %route.ae_title, error = %e, "undecodable command set");
                                }
                            }
                        }
                        PDataValueType::Data => {
                            let Some(store) = pending.as_mut() else {
                                warn!(ae = %route.ae_title, "data pdv without pending store");
                                continue;
                            };
                            store.data.extend_from_slice(&pdv.data);
                            if pdv.is_last {
                                let store = pending.take().expect("pending checked above");
                                process_store(
                                    &mut assoc,
                                    store,
                                    route,
                                    registry,
                                    &source_ae,
                                    &mut touched,
                                )?;
                            }
                        }
                    }
                }
            }
            Pdu::ReleaseRQ => {
                let _ = assoc.send(&Pdu::ReleaseRP);
                debug!(ae = %route.ae_title, peer = %source_ae, "association released");
                break;
            }
            Pdu::AbortRQ { .. } => {
                debug!(ae = %route.ae_title, peer = %source_ae, "association aborted by peer");
                break;
            }
            other => {
                warn!(ae = %route.ae_title, "unexpected pdu {:?}", other);
                break;
            }
        }
    }

    for study_uid in touched {
        registry.association_closed(&study_uid);
    }
    Ok(())
}

fn respond_echo(
    assoc: &mut ServerAssociation<TcpStream>,
    presentation_context_id: u8,
    command: &InMemDicomObject,
) -> Result<(), GatewayError> {
    let message_id = dimse::message_id_of(command).unwrap_or(0);
    let rsp = dimse::encode_command(&dimse::echo_rsp(message_id, dimse::STATUS_SUCCESS))
        .map_err(|e| GatewayError::protocol(e.to_string()))?;
    assoc
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: rsp,
            }],
        })
        .map_err(|e| GatewayError::protocol(format!("echo response failed: {}", e)))?;
    Ok(())
}

/// Parse, filter and file one received instance, then answer the store.
fn process_store(
    assoc: &mut ServerAssociation<TcpStream>,
    store: PendingStore,
    route: &RouteConfig,
    registry: &StudyRegistry,
    source_ae: &str,
    touched: &mut HashSet<String>,
) -> Result<(), GatewayError> {
    let ts_uid = assoc
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == store.presentation_context_id)
        .map(|pc| pc.transfer_syntax.trim().to_string())
        .unwrap_or_else(|| dimse::IMPLICIT_VR_LE.to_string());

    let mut status = dimse::STATUS_SUCCESS;
    match TransferSyntaxRegistry.get(&ts_uid) {
        Some(ts) => match InMemDicomObject::read_dataset_with_ts(&store.data[..], ts) {
            Ok(obj) => {
                if let Err(e) = file_instance(&obj, &store, &ts_uid, route, registry, source_ae, touched)
                {
                    warn!(ae = %route.ae_title, error = %e, "cannot store instance");
                    status = dimse::STATUS_PROCESSING_FAILURE;
                }
            }
            Err(e) => {
                warn!(ae = %route.ae_title, error = %e, "undecodable data set");
                status = dimse::STATUS_PROCESSING_FAILURE;
            }
        },
        None => {
            warn!(ae = %route.ae_title, ts = %ts_uid, "unknown transfer syntax");
            status = dimse::STATUS_PROCESSING_FAILURE;
        }
    }

    let rsp = dimse::encode_command(&dimse::store_rsp(
        store.message_id,
        &store.sop_class_uid,
        &store.sop_instance_uid,
        status,
    ))
    .map_err(|e| GatewayError::protocol(e.to_string()))?;
    assoc
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: store.presentation_context_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: rsp,
            }],
        })
        .map_err(|e| GatewayError::protocol(format!("store response failed: {}", e)))?;
    Ok(())
}

fn file_instance(
    obj: &InMemDicomObject,
    store: &PendingStore,
    ts_uid: &str,
    route: &RouteConfig,
    registry: &StudyRegistry,
    source_ae: &str,
    touched: &mut HashSet<String>,
) -> Result<(), GatewayError> {
    let study_uid = extract::study_uid(obj)
        .ok_or_else(|| GatewayError::protocol("instance without StudyInstanceUID"))?;
    let values = extract::tag_values(obj);

    if touched.insert(study_uid.clone()) {
        registry.association_opened(&study_uid);
    }

    // filter and validation rules run before anything touches disk
    if !rules::filter_admits(&route.filters, &values)
        || !rules::validation_passes(&route.validation_rules, &values)
    {
        info!(ae = %route.ae_title, study = %study_uid, "instance rejected by rules");
        registry.record_rejected(&study_uid);
        return Ok(());
    }

    let dir = registry
        .layout()
        .study_dir(StudyStage::Incoming, &study_uid);
    std::fs::create_dir_all(&dir)?;
    let sop_instance = if store.sop_instance_uid.is_empty() {
        values
            .get("SOPInstanceUID")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string())
    } else {
        store.sop_instance_uid.clone()
    };
    let path = dir.join(format!("{}.dcm", sop_instance));

    let file_obj = obj
        .clone()
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(ts_uid)
                .media_storage_sop_class_uid(store.sop_class_uid.as_str())
                .media_storage_sop_instance_uid(sop_instance.as_str()),
        )
        .map_err(|e| GatewayError::protocol(format!("meta build failed: {}", e)))?;
    file_obj
        .write_to_file(&path)
        .map_err(|e| GatewayError::protocol(format!("cannot write {}: {}", path.display(), e)))?;
    let file_size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

    registry.record_instance(
        &study_uid,
        source_ae,
        extract::instance_meta(obj, format!("{}.dcm", sop_instance).into(), file_size),
    )?;

    let (adds, removes) = rules::routing_adjustments(&route.routing_rules, &values);
    if !adds.is_empty() || !removes.is_empty() {
        registry.record_routing(&study_uid, adds, removes)?;
    }
    Ok(())
}
