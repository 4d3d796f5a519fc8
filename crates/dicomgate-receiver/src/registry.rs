use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dicomgate_storage::sidecar::{self, StudyManifest};
use dicomgate_storage::{AeLayout, StudyStage};
use dicomgate_types::{GatewayError, InstanceMeta, Study};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tracing::debug;

/// Receive-side state of one study.
#[derive(Debug)]
pub struct ReceivingStudy {
    pub manifest: StudyManifest,
    pub last_seen: DateTime<Utc>,
    /// Associations currently holding the study open
    pub open_associations: usize,
}

/// In-memory registry of studies currently in `incoming/` for one route.
/// Every mutation is mirrored to the study's `study.json` sidecar so a
/// restart rebuilds the same state from disk.
pub struct StudyRegistry {
    layout: AeLayout,
    studies: DashMap<String, ReceivingStudy>,
    /// Studies promoted to the pipeline and not yet terminal; the
    /// completion watchdog defers promotion beyond the route bound.
    in_flight: Arc<AtomicUsize>,
}

impl StudyRegistry {
    pub fn new(layout: AeLayout) -> Self {
        Self {
            layout,
            studies: DashMap::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn layout(&self) -> &AeLayout {
        &self.layout
    }

    pub fn in_flight(&self) -> Arc<AtomicUsize> {
        self.in_flight.clone()
    }

    /// Record one received instance, creating the study on first sight.
    pub fn record_instance(
        &self,
        study_uid: &str,
        source_ae: &str,
        meta: InstanceMeta,
    ) -> Result<(), GatewayError> {
        let mut entry = self.studies.entry(study_uid.to_string()).or_insert_with(|| {
            debug!(ae = %self.layout.ae_title(), study = study_uid, "new study receiving");
            ReceivingStudy {
                manifest: StudyManifest {
                    study: Study::new(study_uid, self.layout.ae_title(), source_ae),
                    destination_adds: Vec::new(),
                    destination_removes: Vec::new(),
                    rejected_instances: 0,
                },
                last_seen: Utc::now(),
                open_associations: 0,
            }
        });
        entry.manifest.study.add_instance(meta);
        entry.last_seen = Utc::now();
        self.persist(study_uid, &entry.manifest)
    }

    /// Record an instance rejected by filter/validation rules.
    pub fn record_rejected(&self, study_uid: &str) {
        if let Some(mut entry) = self.studies.get_mut(study_uid) {
            entry.manifest.rejected_instances += 1;
            entry.last_seen = Utc::now();
            let _ = self.persist(study_uid, &entry.manifest);
        }
    }

    /// Merge routing-rule adjustments discovered for this study.
    pub fn record_routing(
        &self,
        study_uid: &str,
        adds: Vec<String>,
        removes: Vec<String>,
    ) -> Result<(), GatewayError> {
        if let Some(mut entry) = self.studies.get_mut(study_uid) {
            for add in adds {
                if !entry.manifest.destination_adds.contains(&add) {
                    entry.manifest.destination_adds.push(add);
                }
            }
            for remove in removes {
                if !entry.manifest.destination_removes.contains(&remove) {
                    entry.manifest.destination_removes.push(remove);
                }
            }
            let manifest = entry.manifest.clone();
            drop(entry);
            return self.persist(study_uid, &manifest);
        }
        Ok(())
    }

    /// An association begins (or resumes) writing this study.
    pub fn association_opened(&self, study_uid: &str) {
        if let Some(mut entry) = self.studies.get_mut(study_uid) {
            entry.open_associations += 1;
        }
    }

    /// An association holding this study closed. Quiescence only counts
    /// once no association holds the study.
    pub fn association_closed(&self, study_uid: &str) {
        if let Some(mut entry) = self.studies.get_mut(study_uid) {
            entry.open_associations = entry.open_associations.saturating_sub(1);
            entry.last_seen = Utc::now();
        }
    }

    /// Studies whose quiescence window elapsed with no open association.
    pub fn quiescent(&self, quiescence: std::time::Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(quiescence).unwrap_or_else(|_| chrono::Duration::zero());
        self.studies
            .iter()
            .filter(|e| e.open_associations == 0 && e.last_seen <= cutoff)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Remove a study from the receive registry at promotion time.
    pub fn take(&self, study_uid: &str) -> Option<StudyManifest> {
        self.studies.remove(study_uid).map(|(_, e)| e.manifest)
    }

    pub fn len(&self) -> usize {
        self.studies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.studies.is_empty()
    }

    /// Rebuild receive-side state from `incoming/` after a restart.
    pub fn recover(&self) -> Result<Vec<String>, GatewayError> {
        let mut recovered = Vec::new();
        for study_uid in self.layout.list_stage(StudyStage::Incoming)? {
            let dir = self.layout.study_dir(StudyStage::Incoming, &study_uid);
            let manifest = match sidecar::read_study_manifest(&dir)? {
                Some(manifest) => manifest,
                None => StudyManifest {
                    study: Study::new(&study_uid, self.layout.ae_title(), "UNKNOWN"),
                    destination_adds: Vec::new(),
                    destination_removes: Vec::new(),
                    rejected_instances: 0,
                },
            };
            self.studies.insert(
                study_uid.clone(),
                ReceivingStudy {
                    manifest,
                    // recovered studies have no open association; they
                    // promote as soon as the quiescence window allows
                    last_seen: Utc::now(),
                    open_associations: 0,
                },
            );
            recovered.push(study_uid);
        }
        Ok(recovered)
    }

    fn persist(&self, study_uid: &str, manifest: &StudyManifest) -> Result<(), GatewayError> {
        let dir = self.layout.study_dir(StudyStage::Incoming, study_uid);
        std::fs::create_dir_all(&dir)?;
        sidecar::write_study_manifest(&dir, manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn meta(sop: &str) -> InstanceMeta {
        InstanceMeta {
            path: format!("{}.dcm", sop).into(),
            sop_instance_uid: sop.into(),
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".into(),
            series_instance_uid: "1.2".into(),
            modality: Some("CT".into()),
            patient_id: Some("P1".into()),
            patient_name: None,
            study_date: None,
            file_size: 100,
        }
    }

    fn registry() -> (TempDir, StudyRegistry) {
        let tmp = TempDir::new().unwrap();
        let layout = AeLayout::new(tmp.path(), "INGEST");
        layout.ensure().unwrap();
        (tmp, StudyRegistry::new(layout))
    }

    #[test]
    fn test_quiescence_requires_closed_associations() {
        let (_tmp, registry) = registry();
        registry.record_instance("1.2.3", "PEER", meta("1")).unwrap();
        registry.association_opened("1.2.3");

        // zero quiescence, but an association is still open
        assert!(registry.quiescent(Duration::ZERO).is_empty());

        registry.association_closed("1.2.3");
        assert_eq!(registry.quiescent(Duration::ZERO), vec!["1.2.3".to_string()]);

        // a long window keeps it back
        assert!(registry.quiescent(Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn test_manifest_persisted_and_recovered() {
        let (tmp, registry) = registry();
        registry.record_instance("1.2.3", "PEER", meta("1")).unwrap();
        registry.record_instance("1.2.3", "PEER", meta("2")).unwrap();
        registry
            .record_routing("1.2.3", vec!["ct-archive".into()], vec![])
            .unwrap();

        // fresh registry over the same tree
        let layout = AeLayout::new(tmp.path(), "INGEST");
        let fresh = StudyRegistry::new(layout);
        let recovered = fresh.recover().unwrap();
        assert_eq!(recovered, vec!["1.2.3".to_string()]);

        let manifest = fresh.take("1.2.3").unwrap();
        assert_eq!(manifest.study.file_count(), 2);
        assert_eq!(manifest.study.source_ae, "PEER");
        assert_eq!(manifest.destination_adds, vec!["ct-archive".to_string()]);
    }

    #[test]
    fn test_take_removes() {
        let (_tmp, registry) = registry();
        registry.record_instance("1.2.3", "PEER", meta("1")).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.take("1.2.3").is_some());
        assert!(registry.is_empty());
        assert!(registry.take("1.2.3").is_none());
    }
}
