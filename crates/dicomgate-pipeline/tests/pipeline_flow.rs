//! End-to-end pipeline scenarios over a filesystem destination: a study
//! seeded in `incoming/` is promoted, fanned out, archived and recorded,
//! without any network peer.

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemDicomObject;
use dicom_object::FileMetaTableBuilder;
use dicomgate_config::{
    ConfigStore, DestinationConfig, GatewayConfig, ResilienceConfig, RouteConfig,
    RouteDestinationConfig,
};
use dicomgate_pipeline::PipelineService;
use dicomgate_storage::sidecar::{self, StudyManifest};
use dicomgate_storage::{AeLayout, StudyStage, TransferQuery};
use dicomgate_types::{DestinationStatus, InstanceMeta, Study, TransferStatus};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

fn route(ae: &str, destinations: Vec<RouteDestinationConfig>, review: bool) -> RouteConfig {
    RouteConfig {
        ae_title: ae.into(),
        port: 0,
        enabled: true,
        description: String::new(),
        worker_threads: 2,
        max_concurrent_transfers: 2,
        max_concurrent_studies: 8,
        study_timeout_seconds: 0,
        rate_limit_per_minute: None,
        webhook_url: None,
        webhook_events: Vec::new(),
        review_required: review,
        auto_import: true,
        tls: false,
        accepted_sop_classes: Vec::new(),
        destinations,
        routing_rules: Vec::new(),
        validation_rules: Vec::new(),
        filters: Vec::new(),
    }
}

fn route_destination(name: &str) -> RouteDestinationConfig {
    RouteDestinationConfig {
        destination: name.into(),
        anonymize: false,
        script: None,
        project: None,
        subject: None,
        session: None,
        priority: 0,
        max_retries: Some(1),
        retry_delay_seconds: Some(1),
        broker: None,
        detect_pixel_phi: false,
    }
}

fn gateway_config(data_root: &Path, routes: Vec<RouteConfig>, sink: &Path) -> GatewayConfig {
    GatewayConfig {
        data_root: data_root.to_path_buf(),
        scripts_dir: None,
        resilience: ResilienceConfig {
            retry_delay_seconds: 1,
            max_retry_delay_seconds: 4,
            ..ResilienceConfig::default()
        },
        routes,
        destinations: vec![DestinationConfig::Filesystem {
            name: "fs-sink".into(),
            enabled: true,
            path: sink.to_path_buf(),
            create_subdirs: true,
            naming_pattern: "{PatientID}".into(),
        }],
        brokers: Vec::new(),
        ocr: None,
    }
}

/// Seed a study into `incoming/` the way the receiver would have left it.
fn seed_study(data_root: &Path, ae: &str, study_uid: &str, instances: usize) {
    let layout = AeLayout::new(data_root, ae);
    layout.ensure().unwrap();
    let dir = layout.study_dir(StudyStage::Incoming, study_uid);
    std::fs::create_dir_all(&dir).unwrap();

    let mut study = Study::new(study_uid, ae, "PEER");
    for i in 0..instances {
        let sop_instance = format!("{}.{}", study_uid, i);
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(CT_IMAGE_STORAGE),
        ));
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_instance.as_str()),
        ));
        obj.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(study_uid),
        ));
        obj.put(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(format!("{}.s", study_uid).as_str()),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            PrimitiveValue::from("P12345"),
        ));
        let path = dir.join(format!("{}.dcm", sop_instance));
        obj.with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(EXPLICIT_VR_LE)
                .media_storage_sop_class_uid(CT_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(sop_instance.as_str()),
        )
        .unwrap()
        .write_to_file(&path)
        .unwrap();

        study.add_instance(InstanceMeta {
            path: format!("{}.dcm", sop_instance).into(),
            sop_instance_uid: sop_instance,
            sop_class_uid: CT_IMAGE_STORAGE.into(),
            series_instance_uid: format!("{}.s", study_uid),
            modality: Some("CT".into()),
            patient_id: Some("P12345".into()),
            patient_name: None,
            study_date: Some("20260115".into()),
            file_size: std::fs::metadata(&path).unwrap().len(),
        });
    }
    sidecar::write_study_manifest(
        &dir,
        &StudyManifest {
            study,
            destination_adds: Vec::new(),
            destination_removes: Vec::new(),
            rejected_instances: 0,
        },
    )
    .unwrap();
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_happy_path_single_destination() {
    let tmp = tempfile::TempDir::new().unwrap();
    let data_root = tmp.path().join("data");
    let sink = tmp.path().join("sink");

    seed_study(&data_root, "INGEST", "1.2.3.100", 5);

    let config = gateway_config(
        &data_root,
        vec![route("INGEST", vec![route_destination("fs-sink")], false)],
        &sink,
    );
    let store = Arc::new(ConfigStore::new(config).unwrap());
    let mut service = PipelineService::build(store).unwrap();
    let handle = service.handle();
    let tasks = service.start().await.unwrap();

    let layout = AeLayout::new(&data_root, "INGEST");
    wait_for("study to complete", || {
        layout.find_stage("1.2.3.100") == Some(StudyStage::Completed)
    })
    .await;

    // destination received all files, named by the pattern
    wait_for("files in sink", || {
        (0..5).all(|i| sink.join(format!("P12345/1.2.3.100.{}.dcm", i)).is_file())
    })
    .await;

    wait_for("record success", || {
        handle
            .query_transfers(&TransferQuery {
                study_uid: Some("1.2.3.100".into()),
                ..Default::default()
            })
            .first()
            .map(|r| r.status == TransferStatus::Success)
            .unwrap_or(false)
    })
    .await;

    let record = handle
        .query_transfers(&TransferQuery {
            study_uid: Some("1.2.3.100".into()),
            ..Default::default()
        })
        .remove(0);
    let result = record.destination("fs-sink").unwrap();
    assert_eq!(result.status, DestinationStatus::Success);
    assert_eq!(result.files_transferred, 5);
    assert_eq!(result.attempts, 1);

    // archived with metadata
    let archive = layout.archive_dir();
    wait_for("archive written", || {
        walk_contains(&archive, "study_1.2.3.100")
    })
    .await;

    service.shutdown(tasks, Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_review_gate_rejection() {
    let tmp = tempfile::TempDir::new().unwrap();
    let data_root = tmp.path().join("data");
    let sink = tmp.path().join("sink");

    seed_study(&data_root, "REVIEWED", "1.2.3.200", 1);

    let config = gateway_config(
        &data_root,
        vec![route("REVIEWED", vec![route_destination("fs-sink")], true)],
        &sink,
    );
    let store = Arc::new(ConfigStore::new(config).unwrap());
    let mut service = PipelineService::build(store).unwrap();
    let handle = service.handle();
    let tasks = service.start().await.unwrap();

    wait_for("study parked for review", || {
        handle
            .pending_reviews("REVIEWED")
            .map(|p| p.len() == 1)
            .unwrap_or(false)
    })
    .await;

    // nothing forwarded while pending
    assert!(!sink.exists() || std::fs::read_dir(&sink).unwrap().next().is_none());

    let review = handle.pending_reviews("REVIEWED").unwrap().remove(0);
    handle
        .reject_review("REVIEWED", &review.review_id, "bob", "missing consent")
        .unwrap();

    let layout = AeLayout::new(&data_root, "REVIEWED");
    wait_for("study rejected", || {
        layout
            .study_dir(StudyStage::ReviewRejected, &review.review_id)
            .is_dir()
    })
    .await;

    wait_for("record failed", || {
        handle
            .query_transfers(&TransferQuery {
                study_uid: Some("1.2.3.200".into()),
                ..Default::default()
            })
            .first()
            .map(|r| {
                r.status == TransferStatus::Failed
                    && r.error_message.as_deref() == Some("rejected: missing consent")
            })
            .unwrap_or(false)
    })
    .await;

    // still nothing forwarded
    assert!(!sink.exists() || std::fs::read_dir(&sink).unwrap().next().is_none());

    service.shutdown(tasks, Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_empty_destination_plan_completes() {
    let tmp = tempfile::TempDir::new().unwrap();
    let data_root = tmp.path().join("data");
    let sink = tmp.path().join("sink");

    seed_study(&data_root, "INGEST", "1.2.3.300", 1);

    let config = gateway_config(&data_root, vec![route("INGEST", Vec::new(), false)], &sink);
    let store = Arc::new(ConfigStore::new(config).unwrap());
    let mut service = PipelineService::build(store).unwrap();
    let handle = service.handle();
    let tasks = service.start().await.unwrap();

    let layout = AeLayout::new(&data_root, "INGEST");
    wait_for("study to complete", || {
        layout.find_stage("1.2.3.300") == Some(StudyStage::Completed)
    })
    .await;

    wait_for("record success with no destinations", || {
        handle
            .query_transfers(&TransferQuery {
                study_uid: Some("1.2.3.300".into()),
                ..Default::default()
            })
            .first()
            .map(|r| r.status == TransferStatus::Success && r.destinations.is_empty())
            .unwrap_or(false)
    })
    .await;

    service.shutdown(tasks, Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_recovery_resumes_processing_study() {
    let tmp = tempfile::TempDir::new().unwrap();
    let data_root = tmp.path().join("data");
    let sink = tmp.path().join("sink");

    // a study abandoned mid-processing by a previous run
    seed_study(&data_root, "INGEST", "1.2.3.400", 2);
    let layout = AeLayout::new(&data_root, "INGEST");
    layout
        .transition("1.2.3.400", StudyStage::Incoming, StudyStage::Processing)
        .unwrap();

    let config = gateway_config(
        &data_root,
        vec![route("INGEST", vec![route_destination("fs-sink")], false)],
        &sink,
    );
    let store = Arc::new(ConfigStore::new(config).unwrap());
    let mut service = PipelineService::build(store).unwrap();
    let tasks = service.start().await.unwrap();

    wait_for("recovered study to complete", || {
        layout.find_stage("1.2.3.400") == Some(StudyStage::Completed)
    })
    .await;
    wait_for("files in sink", || {
        sink.join("P12345/1.2.3.400.0.dcm").is_file()
    })
    .await;

    service.shutdown(tasks, Duration::from_secs(1)).await;
}

fn walk_contains(dir: &Path, needle: &str) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.contains(needle) {
            return true;
        }
        if entry.path().is_dir() && walk_contains(&entry.path(), needle) {
            return true;
        }
    }
    false
}
