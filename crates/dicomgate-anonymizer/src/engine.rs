use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemDicomObject;
use dicom_object::{open_file, FileMetaTableBuilder};
use dicomgate_broker::{hash_uid, shift_da_value, stable_date_shift, Crosswalk, IdType};
use dicomgate_config::DateShiftConfig;
use dicomgate_types::GatewayError;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::audit::{AuditReport, FileAudit, TagChange};
use crate::dict;
use crate::phi::PhiScanner;
use crate::pixels;
use crate::script::{Script, TagAction, TagOp};

/// Honest-broker binding for one anonymization run.
pub struct BrokerBinding {
    pub broker: Arc<dyn Crosswalk>,
    pub date_shift: Option<DateShiftConfig>,
    pub hash_uids: bool,
    pub uid_root: String,
}

/// Per-run context: broker binding, XNAT naming, and any OCR-synthesized
/// pixel operations to append after the script's own.
#[derive(Default)]
pub struct AnonymizeContext {
    pub broker: Option<BrokerBinding>,
    pub project: Option<String>,
    pub subject: Option<String>,
    pub session: Option<String>,
    pub pixel_ops: Vec<TagOp>,
}

/// Broker outputs resolved once per study so the per-file pass is pure.
#[derive(Debug, Clone, Default)]
struct ResolvedBroker {
    patient_id_out: Option<String>,
    patient_name_out: Option<String>,
    date_offset: Option<i64>,
    hash_uids: bool,
    uid_root: String,
    mappings: Vec<(String, String)>,
}

/// Tags treated as identifying when flagging audit changes.
const PHI_TAGS: &[Tag] = &[
    tags::PATIENT_NAME,
    tags::PATIENT_ID,
    tags::PATIENT_BIRTH_DATE,
    tags::PATIENT_ADDRESS,
    tags::PATIENT_TELEPHONE_NUMBERS,
    tags::ACCESSION_NUMBER,
    tags::REFERRING_PHYSICIAN_NAME,
    tags::PERFORMING_PHYSICIAN_NAME,
    tags::OPERATORS_NAME,
    tags::INSTITUTION_NAME,
    tags::INSTITUTION_ADDRESS,
    tags::STUDY_DATE,
    tags::SERIES_DATE,
    tags::ACQUISITION_DATE,
    tags::CONTENT_DATE,
];

/// String-ish VRs scanned for residual PHI.
const STRING_VRS: &[VR] = &[VR::PN, VR::LO, VR::SH, VR::LT, VR::ST, VR::UT, VR::AE, VR::CS];

pub struct Anonymizer {
    scanner: Arc<PhiScanner>,
    /// UID root used by `generate_uid` when no broker binding overrides it
    default_uid_root: String,
}

impl Anonymizer {
    pub fn new(mrn_patterns: &[String], default_uid_root: impl Into<String>) -> Self {
        Self {
            scanner: Arc::new(PhiScanner::new(mrn_patterns)),
            default_uid_root: default_uid_root.into(),
        }
    }

    /// Anonymize every file of a study into `out_dir`, returning the audit
    /// report. The input files are never modified.
    pub async fn anonymize_study(
        &self,
        script: &Script,
        study_uid: &str,
        in_files: &[PathBuf],
        out_dir: &Path,
        ctx: &AnonymizeContext,
    ) -> Result<AuditReport, GatewayError> {
        tokio::fs::create_dir_all(out_dir).await?;

        // Identity run: no ops, no broker, no pixel work; copy verbatim so
        // the output is byte-identical to the input.
        if script.ops.is_empty() && ctx.broker.is_none() && ctx.pixel_ops.is_empty() {
            for file in in_files {
                let name = file_name(file)?;
                tokio::fs::copy(file, out_dir.join(name)).await?;
            }
            return Ok(AuditReport::new(study_uid, &script.name));
        }

        let seed = read_first_value(in_files, tags::PATIENT_ID).unwrap_or_else(|| study_uid.to_string());
        let resolved = self.resolve_broker(ctx, in_files, &seed, script).await?;
        let mappings = resolved.mappings.clone();

        let script = script.clone();
        let in_files = in_files.to_vec();
        let out_dir = out_dir.to_path_buf();
        let study_uid = study_uid.to_string();
        let scanner = self.scanner.clone();
        let default_uid_root = self.default_uid_root.clone();
        let naming = (ctx.project.clone(), ctx.subject.clone(), ctx.session.clone());
        let pixel_ops = ctx.pixel_ops.clone();

        let mut report = tokio::task::spawn_blocking(move || {
            let mut report = AuditReport::new(&study_uid, &script.name);
            for file in &in_files {
                let audit = anonymize_file(
                    file,
                    &out_dir,
                    &script,
                    &pixel_ops,
                    &resolved,
                    &default_uid_root,
                    &naming,
                    &scanner,
                )?;
                report.push_file(audit);
            }
            Ok::<_, GatewayError>(report)
        })
        .await
        .map_err(|e| GatewayError::anonymization(format!("anonymize task failed: {}", e)))??;

        report.broker_mappings = mappings;
        info!(
            study = %report.study_uid,
            script = %report.script,
            changes = report.total_changes(),
            "study anonymized"
        );
        Ok(report)
    }

    /// Resolve broker outputs once per study.
    async fn resolve_broker(
        &self,
        ctx: &AnonymizeContext,
        in_files: &[PathBuf],
        seed: &str,
        script: &Script,
    ) -> Result<ResolvedBroker, GatewayError> {
        let Some(binding) = &ctx.broker else {
            // date shifting without a broker still needs a stable offset
            let needs_shift = script
                .ops
                .iter()
                .any(|op| op.action == TagAction::ShiftDate);
            return Ok(ResolvedBroker {
                date_offset: needs_shift.then(|| stable_date_shift(seed, -365, 365)),
                uid_root: self.default_uid_root.clone(),
                ..Default::default()
            });
        };

        let mut resolved = ResolvedBroker {
            hash_uids: binding.hash_uids,
            uid_root: binding.uid_root.clone(),
            ..Default::default()
        };
        if let Some(shift) = &binding.date_shift {
            resolved.date_offset = Some(stable_date_shift(seed, shift.min_days, shift.max_days));
        } else if script.ops.iter().any(|op| op.action == TagAction::ShiftDate) {
            resolved.date_offset = Some(stable_date_shift(seed, -365, 365));
        }

        if let Some(patient_id) = read_first_value(in_files, tags::PATIENT_ID).or_else(|| {
            (!seed.is_empty()).then(|| seed.to_string())
        }) {
            let mapped = binding.broker.lookup(&patient_id, IdType::PatientId).await?;
            resolved
                .mappings
                .push((patient_id.clone(), mapped.clone()));
            resolved.patient_id_out = Some(mapped);
        }
        if let Some(patient_name) = read_first_value(in_files, tags::PATIENT_NAME) {
            let mapped = binding
                .broker
                .lookup(&patient_name, IdType::PatientName)
                .await?;
            resolved
                .mappings
                .push((patient_name.clone(), mapped.clone()));
            resolved.patient_name_out = Some(mapped);
        }
        debug!(mappings = resolved.mappings.len(), "broker outputs resolved");
        Ok(resolved)
    }
}

/// Apply the script (plus synthesized pixel ops and broker transforms) to
/// one file and write the result into `out_dir`.
#[allow(clippy::too_many_arguments)]
fn anonymize_file(
    file: &Path,
    out_dir: &Path,
    script: &Script,
    pixel_ops: &[TagOp],
    broker: &ResolvedBroker,
    default_uid_root: &str,
    naming: &(Option<String>, Option<String>, Option<String>),
    scanner: &PhiScanner,
) -> Result<FileAudit, GatewayError> {
    let obj = open_file(file)
        .map_err(|e| GatewayError::anonymization(format!("cannot parse {}: {}", file.display(), e)))?;
    let meta = obj.meta().clone();
    let mut dataset = obj.into_inner();

    let mut audit = FileAudit {
        file: file_name(file)?.to_string(),
        ..Default::default()
    };
    let mut kept: HashSet<Tag> = HashSet::new();
    let mut changed: HashSet<Tag> = HashSet::new();

    let uid_root = if broker.uid_root.is_empty() {
        default_uid_root
    } else {
        &broker.uid_root
    };

    for op in script.ops.iter().chain(pixel_ops.iter()) {
        apply_op(
            &mut dataset,
            op,
            broker,
            uid_root,
            naming,
            &mut kept,
            &mut changed,
            &mut audit,
        );
    }

    apply_broker_transforms(&mut dataset, broker, uid_root, &kept, &mut changed, &mut audit);

    check_conformance(&dataset, script, &mut audit);
    scan_residual_phi(&dataset, scanner, &mut audit);

    let sop_class = string_value(&dataset, tags::SOP_CLASS_UID)
        .unwrap_or_else(|| meta.media_storage_sop_class_uid.trim_end_matches('\0').to_string());
    let sop_instance = string_value(&dataset, tags::SOP_INSTANCE_UID)
        .unwrap_or_else(|| meta.media_storage_sop_instance_uid.trim_end_matches('\0').to_string());

    let out_path = out_dir.join(audit.file.clone());
    let file_obj = dataset
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(meta.transfer_syntax())
                .media_storage_sop_class_uid(sop_class)
                .media_storage_sop_instance_uid(sop_instance),
        )
        .map_err(|e| GatewayError::anonymization(format!("meta rebuild failed: {}", e)))?;
    file_obj
        .write_to_file(&out_path)
        .map_err(|e| GatewayError::anonymization(format!("cannot write {}: {}", out_path.display(), e)))?;

    Ok(audit)
}

#[allow(clippy::too_many_arguments)]
fn apply_op(
    dataset: &mut InMemDicomObject,
    op: &TagOp,
    broker: &ResolvedBroker,
    uid_root: &str,
    naming: &(Option<String>, Option<String>, Option<String>),
    kept: &mut HashSet<Tag>,
    changed: &mut HashSet<Tag>,
    audit: &mut FileAudit,
) {
    if let TagAction::AlterPixels { x, y, w, h } = op.action {
        match pixels::redact_region(dataset, x, y, w, h) {
            Ok(()) => audit.changes.push(change_for(
                tags::PIXEL_DATA,
                Some(format!("region {},{} {}x{}", x, y, w, h)),
                Some("redacted".into()),
                "alter_pixels",
            )),
            Err(issue) => audit
                .conformance_issues
                .push(format!("alter_pixels: {}", issue)),
        }
        return;
    }

    let Some(tag) = op.resolve() else {
        audit
            .conformance_issues
            .push(format!("unresolvable tag {:?}", op.tag));
        return;
    };
    if kept.contains(&tag) {
        return;
    }
    let original = string_value(dataset, tag);

    match &op.action {
        TagAction::Keep => {
            kept.insert(tag);
        }
        TagAction::Remove => {
            if dataset.remove_element(tag) {
                changed.insert(tag);
                audit
                    .changes
                    .push(change_for(tag, original, None, "remove"));
            }
        }
        TagAction::Empty => {
            if original.is_some() {
                let vr = element_vr(dataset, tag).unwrap_or(VR::LO);
                dataset.put(DataElement::new(tag, vr, PrimitiveValue::Empty));
                changed.insert(tag);
                audit
                    .changes
                    .push(change_for(tag, original, Some(String::new()), "empty"));
            }
        }
        TagAction::Replace { value } => {
            let vr = element_vr(dataset, tag).unwrap_or(VR::LO);
            dataset.put(DataElement::new(tag, vr, PrimitiveValue::from(value.as_str())));
            changed.insert(tag);
            audit
                .changes
                .push(change_for(tag, original, Some(value.clone()), "replace"));
        }
        TagAction::Hash => {
            if let Some(value) = &original {
                let hashed = short_hash(value);
                let vr = element_vr(dataset, tag).unwrap_or(VR::LO);
                dataset.put(DataElement::new(tag, vr, PrimitiveValue::from(hashed.as_str())));
                changed.insert(tag);
                audit
                    .changes
                    .push(change_for(tag, original, Some(hashed), "hash"));
            }
        }
        TagAction::GenerateUid => {
            if let Some(value) = &original {
                let new_uid = hash_uid(value, uid_root);
                dataset.put(DataElement::new(tag, VR::UI, PrimitiveValue::from(new_uid.as_str())));
                changed.insert(tag);
                audit
                    .changes
                    .push(change_for(tag, original, Some(new_uid), "generate_uid"));
            }
        }
        TagAction::ShiftDate => {
            if let (Some(value), Some(offset)) = (&original, broker.date_offset) {
                let shifted = shift_da_value(value, offset);
                if shifted != *value {
                    dataset.put(DataElement::new(tag, VR::DA, PrimitiveValue::from(shifted.as_str())));
                    changed.insert(tag);
                    audit
                        .changes
                        .push(change_for(tag, original, Some(shifted), "shift_date"));
                }
            }
        }
        TagAction::ProjectSubjectSessionRewrite => {
            let (project, subject, session) = naming;
            let comment = format!(
                "Project: {}; Subject: {}; Session: {}",
                project.as_deref().unwrap_or(""),
                subject.as_deref().unwrap_or(""),
                session.as_deref().unwrap_or("")
            );
            let original = string_value(dataset, tags::PATIENT_COMMENTS);
            dataset.put(DataElement::new(
                tags::PATIENT_COMMENTS,
                VR::LT,
                PrimitiveValue::from(comment.as_str()),
            ));
            changed.insert(tags::PATIENT_COMMENTS);
            audit.changes.push(change_for(
                tags::PATIENT_COMMENTS,
                original,
                Some(comment),
                "project_subject_session_rewrite",
            ));
        }
        TagAction::AlterPixels { .. } => unreachable!("handled above"),
    }
}

/// Broker transforms run after the script: identifier replacement, DA
/// shifting and UID hashing, skipping tags the script already handled.
fn apply_broker_transforms(
    dataset: &mut InMemDicomObject,
    broker: &ResolvedBroker,
    uid_root: &str,
    kept: &HashSet<Tag>,
    changed: &mut HashSet<Tag>,
    audit: &mut FileAudit,
) {
    let id_map = [
        (tags::PATIENT_ID, broker.patient_id_out.clone()),
        (tags::PATIENT_NAME, broker.patient_name_out.clone()),
    ];
    for (tag, mapped) in id_map {
        let Some(mapped) = mapped else { continue };
        if kept.contains(&tag) || changed.contains(&tag) {
            continue;
        }
        let Some(original) = string_value(dataset, tag) else {
            continue;
        };
        let vr = element_vr(dataset, tag).unwrap_or(VR::LO);
        dataset.put(DataElement::new(tag, vr, PrimitiveValue::from(mapped.as_str())));
        changed.insert(tag);
        audit
            .changes
            .push(change_for(tag, Some(original), Some(mapped), "broker_map"));
    }

    if let Some(offset) = broker.date_offset {
        let da_tags: Vec<(Tag, String)> = dataset
            .iter()
            .filter(|el| el.vr() == VR::DA)
            .filter_map(|el| {
                let tag = el.header().tag;
                let value = el.value().to_str().ok()?.trim().to_string();
                (!value.is_empty() && !kept.contains(&tag) && !changed.contains(&tag))
                    .then_some((tag, value))
            })
            .collect();
        for (tag, value) in da_tags {
            let shifted = shift_da_value(&value, offset);
            if shifted != value {
                dataset.put(DataElement::new(tag, VR::DA, PrimitiveValue::from(shifted.as_str())));
                changed.insert(tag);
                audit
                    .changes
                    .push(change_for(tag, Some(value), Some(shifted), "shift_date"));
            }
        }
    }

    if broker.hash_uids {
        for tag in [
            tags::STUDY_INSTANCE_UID,
            tags::SERIES_INSTANCE_UID,
            tags::SOP_INSTANCE_UID,
            tags::FRAME_OF_REFERENCE_UID,
        ] {
            if kept.contains(&tag) || changed.contains(&tag) {
                continue;
            }
            if let Some(original) = string_value(dataset, tag) {
                let hashed = hash_uid(&original, uid_root);
                dataset.put(DataElement::new(tag, VR::UI, PrimitiveValue::from(hashed.as_str())));
                changed.insert(tag);
                audit
                    .changes
                    .push(change_for(tag, Some(original), Some(hashed), "generate_uid"));
            }
        }
    }
}

/// Verify each script rule's postcondition on the output dataset.
fn check_conformance(dataset: &InMemDicomObject, script: &Script, audit: &mut FileAudit) {
    for op in &script.ops {
        let Some(tag) = op.resolve() else { continue };
        let value = string_value(dataset, tag);
        let issue = match &op.action {
            TagAction::Remove => value
                .is_some()
                .then(|| format!("{} still present after remove", op.tag)),
            TagAction::Empty => value
                .filter(|v| !v.is_empty())
                .map(|_| format!("{} not empty after empty", op.tag)),
            TagAction::Replace { value: expected } => match value {
                Some(v) if v == *expected => None,
                _ => Some(format!("{} does not carry the replacement value", op.tag)),
            },
            _ => None,
        };
        if let Some(issue) = issue {
            audit.conformance_issues.push(issue);
        }
    }
}

/// Flag surviving identifier-shaped strings.
fn scan_residual_phi(dataset: &InMemDicomObject, scanner: &PhiScanner, audit: &mut FileAudit) {
    for el in dataset.iter() {
        if !STRING_VRS.contains(&el.vr()) {
            continue;
        }
        let Ok(value) = el.value().to_str() else { continue };
        for hit in scanner.scan(&value) {
            audit.residual_phi_warnings.push(format!(
                "{} value matches {} pattern",
                dict::tag_hex(el.header().tag),
                hit
            ));
        }
    }
}

fn change_for(
    tag: Tag,
    original: Option<String>,
    anonymized: Option<String>,
    action: &str,
) -> TagChange {
    TagChange {
        tag_hex: dict::tag_hex(tag),
        tag_name: dict::keyword(tag).map(String::from),
        original_value: original,
        anonymized_value: anonymized,
        action: action.to_string(),
        is_phi: PHI_TAGS.contains(&tag) || tag == tags::PIXEL_DATA,
    }
}

fn string_value(dataset: &InMemDicomObject, tag: Tag) -> Option<String> {
    dataset
        .element(tag)
        .ok()?
        .value()
        .to_str()
        .ok()
        .map(|v| v.trim().to_string())
}

fn element_vr(dataset: &InMemDicomObject, tag: Tag) -> Option<VR> {
    dataset.element(tag).ok().map(|el| el.vr())
}

fn short_hash(value: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

fn read_first_value(files: &[PathBuf], tag: Tag) -> Option<String> {
    let first = files.first()?;
    let obj = open_file(first).ok()?;
    obj.element(tag)
        .ok()?
        .to_str()
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn file_name(file: &Path) -> Result<&str, GatewayError> {
    file.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| GatewayError::anonymization(format!("bad file name {}", file.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::builtins;
    use dicomgate_broker::LocalBroker;
    use tempfile::TempDir;

    const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
    const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

    fn write_test_object(dir: &Path, name: &str, patient_id: &str, study_date: &str) -> PathBuf {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(CT_IMAGE_STORAGE),
        ));
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from("1.2.3.4.5"),
        ));
        obj.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from("1.2.3"),
        ));
        obj.put(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from("1.2.3.4"),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            PrimitiveValue::from("DOE^JANE"),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            PrimitiveValue::from(patient_id),
        ));
        obj.put(DataElement::new(
            tags::STUDY_DATE,
            VR::DA,
            PrimitiveValue::from(study_date),
        ));
        obj.put(DataElement::new(
            tags::MODALITY,
            VR::CS,
            PrimitiveValue::from("CT"),
        ));

        let path = dir.join(name);
        let file_obj = obj
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(EXPLICIT_VR_LE)
                    .media_storage_sop_class_uid(CT_IMAGE_STORAGE)
                    .media_storage_sop_instance_uid("1.2.3.4.5"),
            )
            .unwrap();
        file_obj.write_to_file(&path).unwrap();
        path
    }

    fn value_of(path: &Path, tag: Tag) -> Option<String> {
        let obj = open_file(path).ok()?;
        obj.element(tag)
            .ok()
            .and_then(|el| el.to_str().ok())
            .map(|v| v.trim().to_string())
    }

    fn script_named(name: &str) -> Script {
        builtins().into_iter().find(|s| s.name == name).unwrap()
    }

    #[tokio::test]
    async fn test_basic_script_replaces_identifiers() {
        let tmp = TempDir::new().unwrap();
        let input = write_test_object(tmp.path(), "a.dcm", "P12345", "20260115");
        let out_dir = tmp.path().join("out");

        let anonymizer = Anonymizer::new(&[], "2.25");
        let report = anonymizer
            .anonymize_study(
                &script_named("basic"),
                "1.2.3",
                &[input],
                &out_dir,
                &AnonymizeContext::default(),
            )
            .await
            .unwrap();

        let out = out_dir.join("a.dcm");
        assert_eq!(value_of(&out, tags::PATIENT_NAME).unwrap(), "ANONYMOUS");
        let hashed_id = value_of(&out, tags::PATIENT_ID).unwrap();
        assert_ne!(hashed_id, "P12345");
        assert_eq!(hashed_id.len(), 16);

        assert!(!report.has_conformance_issues());
        assert!(report.tag_summary.contains_key("PatientID"));
        let id_change = report.files[0]
            .changes
            .iter()
            .find(|c| c.tag_name.as_deref() == Some("PatientID"))
            .unwrap();
        assert!(id_change.is_phi);
        assert_eq!(id_change.original_value.as_deref(), Some("P12345"));
    }

    #[tokio::test]
    async fn test_identity_script_copies_bytes() {
        let tmp = TempDir::new().unwrap();
        let input = write_test_object(tmp.path(), "a.dcm", "P12345", "20260115");
        let out_dir = tmp.path().join("out");

        let anonymizer = Anonymizer::new(&[], "2.25");
        let report = anonymizer
            .anonymize_study(
                &script_named("identity"),
                "1.2.3",
                &[input.clone()],
                &out_dir,
                &AnonymizeContext::default(),
            )
            .await
            .unwrap();

        assert_eq!(report.total_changes(), 0);
        let original = std::fs::read(&input).unwrap();
        let copied = std::fs::read(out_dir.join("a.dcm")).unwrap();
        assert_eq!(original, copied);
    }

    #[tokio::test]
    async fn test_date_shift_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let anonymizer = Anonymizer::new(&[], "2.25");

        let mut shifted = Vec::new();
        for run in 0..2 {
            let input = write_test_object(tmp.path(), "a.dcm", "P12345", "20260115");
            let out_dir = tmp.path().join(format!("out{}", run));
            anonymizer
                .anonymize_study(
                    &script_named("hipaa_standard"),
                    "1.2.3",
                    &[input],
                    &out_dir,
                    &AnonymizeContext::default(),
                )
                .await
                .unwrap();
            shifted.push(value_of(&out_dir.join("a.dcm"), tags::STUDY_DATE).unwrap());
        }
        assert_eq!(shifted[0], shifted[1]);
        assert_ne!(shifted[0], "20260115");
    }

    #[tokio::test]
    async fn test_broker_binding_maps_patient_id() {
        let tmp = TempDir::new().unwrap();
        let input = write_test_object(tmp.path(), "a.dcm", "P12345", "20260115");
        let out_dir = tmp.path().join("out");
        let broker = Arc::new(LocalBroker::open("b1", tmp.path().join("b1.db"), "SUBJ_").unwrap());

        let ctx = AnonymizeContext {
            broker: Some(BrokerBinding {
                broker: broker.clone(),
                date_shift: Some(DateShiftConfig {
                    min_days: 1,
                    max_days: 30,
                }),
                hash_uids: true,
                uid_root: "2.25".into(),
            }),
            ..Default::default()
        };
        let anonymizer = Anonymizer::new(&[], "2.25");
        let report = anonymizer
            .anonymize_study(&script_named("identity"), "1.2.3", &[input], &out_dir, &ctx)
            .await
            .unwrap();

        let out = out_dir.join("a.dcm");
        let mapped = value_of(&out, tags::PATIENT_ID).unwrap();
        assert!(mapped.starts_with("SUBJ_"));
        assert!(report
            .broker_mappings
            .iter()
            .any(|(input, output)| input == "P12345" && output == &mapped));

        // dates shifted, uids hashed under the root
        assert_ne!(value_of(&out, tags::STUDY_DATE).unwrap(), "20260115");
        assert!(value_of(&out, tags::STUDY_INSTANCE_UID)
            .unwrap()
            .starts_with("2.25."));

        // same patient in a second study maps identically
        let input2 = write_test_object(tmp.path(), "b.dcm", "P12345", "20260301");
        let out_dir2 = tmp.path().join("out2");
        anonymizer
            .anonymize_study(&script_named("identity"), "1.2.9", &[input2], &out_dir2, &ctx)
            .await
            .unwrap();
        assert_eq!(
            value_of(&out_dir2.join("b.dcm"), tags::PATIENT_ID).unwrap(),
            mapped
        );
    }

    #[tokio::test]
    async fn test_conformance_flags_unremoved_tag() {
        let tmp = TempDir::new().unwrap();
        let input = write_test_object(tmp.path(), "a.dcm", "P12345", "20260115");
        let out_dir = tmp.path().join("out");

        // keep then remove the same tag: keep wins, the remove
        // postcondition fails and must be reported
        let script = Script::new(
            "conflicted",
            "",
            vec![
                TagOp::new("PatientID", TagAction::Keep),
                TagOp::new("PatientID", TagAction::Remove),
            ],
        );
        let anonymizer = Anonymizer::new(&[], "2.25");
        let report = anonymizer
            .anonymize_study(&script, "1.2.3", &[input], &out_dir, &AnonymizeContext::default())
            .await
            .unwrap();
        assert!(report.has_conformance_issues());
    }

    #[tokio::test]
    async fn test_residual_phi_warning() {
        let tmp = TempDir::new().unwrap();
        let input = write_test_object(tmp.path(), "a.dcm", "123-45-6789", "20260115");
        let out_dir = tmp.path().join("out");

        let anonymizer = Anonymizer::new(&[], "2.25");
        let report = anonymizer
            .anonymize_study(
                &script_named("identity"),
                "1.2.3",
                &[input],
                &out_dir,
                &AnonymizeContext {
                    // force the non-copy path so the scan runs
                    pixel_ops: vec![TagOp::new(
                        "PixelData",
                        TagAction::AlterPixels { x: 0, y: 0, w: 1, h: 1 },
                    )],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(report.files[0]
            .residual_phi_warnings
            .iter()
            .any(|w| w.contains("ssn")));
    }
}
