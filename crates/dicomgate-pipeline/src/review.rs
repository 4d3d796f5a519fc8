use chrono::Utc;
use dashmap::DashMap;
use dicomgate_anonymizer::AuditReport;
use dicomgate_storage::sidecar::{self, ReviewDecision, ReviewMetadata};
use dicomgate_storage::{AeLayout, StudyStage, TransferStore};
use dicomgate_types::{GatewayError, PipelineEvent, TransferStatus};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::WorkItem;

/// Human-in-the-loop gate. Submission parks an anonymized study in
/// `review/pending/<review_id>/`; approval moves it back to `processing/`
/// and resumes the scheduler's plan, rejection moves it to
/// `review/rejected/<review_id>/` and fails the transfer with cause
/// "rejected". A study parked for review is never forwarded or retried.
pub struct ReviewGate {
    layouts: Arc<DashMap<String, AeLayout>>,
    transfers: Arc<TransferStore>,
    work_tx: mpsc::Sender<WorkItem>,
    events: broadcast::Sender<PipelineEvent>,
}

impl ReviewGate {
    pub fn new(
        layouts: Arc<DashMap<String, AeLayout>>,
        transfers: Arc<TransferStore>,
        work_tx: mpsc::Sender<WorkItem>,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            layouts,
            transfers,
            work_tx,
            events,
        }
    }

    fn layout(&self, ae_title: &str) -> Result<AeLayout, GatewayError> {
        self.layouts
            .get(ae_title)
            .map(|l| l.value().clone())
            .ok_or_else(|| GatewayError::not_found("route", ae_title))
    }

    /// Park a study for review. The study directory must be in
    /// `processing/`; it moves (atomically) under the new review id.
    pub fn submit(
        &self,
        ae_title: &str,
        study_uid: &str,
        source_ae: &str,
        script: Option<&str>,
        audit: Option<&AuditReport>,
    ) -> Result<String, GatewayError> {
        let layout = self.layout(ae_title)?;
        let review_id = Uuid::new_v4().to_string();
        let dir = layout.transition_as(
            study_uid,
            StudyStage::Processing,
            StudyStage::ReviewPending,
            &review_id,
        )?;
        let metadata = ReviewMetadata {
            review_id: review_id.clone(),
            study_uid: study_uid.to_string(),
            ae_title: ae_title.to_string(),
            source_ae: source_ae.to_string(),
            script: script.map(String::from),
            audit_summary: audit.map(|a| a.summary_counts()).unwrap_or_default(),
            submitted_at: Utc::now(),
            reviewer: None,
            decision: None,
            notes: None,
            decided_at: None,
        };
        sidecar::write_review_metadata(&dir, &metadata)?;
        info!(ae = ae_title, study = study_uid, review = %review_id, "study parked for review");
        let _ = self.events.send(PipelineEvent::ReviewPending {
            ae_title: ae_title.to_string(),
            study_uid: study_uid.to_string(),
            review_id: review_id.clone(),
            at: Utc::now(),
        });
        Ok(review_id)
    }

    /// List pending reviews for a route.
    pub fn pending(&self, ae_title: &str) -> Result<Vec<ReviewMetadata>, GatewayError> {
        let layout = self.layout(ae_title)?;
        let mut out = Vec::new();
        for review_id in layout.list_stage(StudyStage::ReviewPending)? {
            let dir = layout.study_dir(StudyStage::ReviewPending, &review_id);
            if let Some(metadata) = sidecar::read_review_metadata(&dir)? {
                out.push(metadata);
            }
        }
        Ok(out)
    }

    fn load(
        &self,
        ae_title: &str,
        review_id: &str,
    ) -> Result<(AeLayout, ReviewMetadata), GatewayError> {
        let layout = self.layout(ae_title)?;
        let dir = layout.study_dir(StudyStage::ReviewPending, review_id);
        if dir.is_dir() {
            let metadata = sidecar::read_review_metadata(&dir)?
                .ok_or_else(|| GatewayError::not_found("review metadata", review_id))?;
            return Ok((layout, metadata));
        }
        // already decided: look in rejected, then treat as approved-gone
        let rejected = layout.study_dir(StudyStage::ReviewRejected, review_id);
        if rejected.is_dir() {
            let metadata = sidecar::read_review_metadata(&rejected)?
                .ok_or_else(|| GatewayError::not_found("review metadata", review_id))?;
            return Ok((layout, metadata));
        }
        Err(GatewayError::not_found("review", review_id))
    }

    /// Approve: move back to `processing/` and resume forwarding. A second
    /// approve of the same id is a no-op success.
    pub async fn approve(
        &self,
        ae_title: &str,
        review_id: &str,
        user: &str,
        notes: Option<String>,
    ) -> Result<(), GatewayError> {
        let (layout, mut metadata) = match self.load(ae_title, review_id) {
            Ok(loaded) => loaded,
            Err(GatewayError::NotFound { .. }) => {
                // already approved and forwarded
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if metadata.decision.is_some() {
            info!(review = review_id, "review already decided, approve is a no-op");
            return Ok(());
        }

        metadata.decision = Some(ReviewDecision::Approved);
        metadata.reviewer = Some(user.to_string());
        metadata.notes = notes;
        metadata.decided_at = Some(Utc::now());

        let study_uid = metadata.study_uid.clone();
        let dir = layout.transition_as(
            review_id,
            StudyStage::ReviewPending,
            StudyStage::Processing,
            &study_uid,
        )?;
        sidecar::write_review_metadata(&dir, &metadata)?;

        info!(ae = ae_title, study = %study_uid, review = review_id, user, "review approved");
        let _ = self.events.send(PipelineEvent::ReviewDecided {
            ae_title: ae_title.to_string(),
            study_uid: study_uid.clone(),
            review_id: review_id.to_string(),
            approved: true,
            user: user.to_string(),
            at: Utc::now(),
        });
        self.work_tx
            .send(WorkItem::ForwardApproved {
                ae_title: ae_title.to_string(),
                study_uid,
            })
            .await
            .map_err(|_| GatewayError::protocol("scheduler is not running"))?;
        Ok(())
    }

    /// Reject: move to `review/rejected/` with the reason, fail the
    /// transfer terminally with cause "rejected".
    pub fn reject(
        &self,
        ae_title: &str,
        review_id: &str,
        user: &str,
        reason: &str,
    ) -> Result<(), GatewayError> {
        let (layout, mut metadata) = self.load(ae_title, review_id)?;
        if metadata.decision.is_some() {
            warn!(review = review_id, "review already decided, reject ignored");
            return Ok(());
        }

        metadata.decision = Some(ReviewDecision::Rejected);
        metadata.reviewer = Some(user.to_string());
        metadata.notes = Some(reason.to_string());
        metadata.decided_at = Some(Utc::now());

        let dir = layout.transition_as(
            review_id,
            StudyStage::ReviewPending,
            StudyStage::ReviewRejected,
            review_id,
        )?;
        sidecar::write_review_metadata(&dir, &metadata)?;
        sidecar::write_failure_reason(&dir, &format!("rejected: {}", reason))?;

        if let Some(record) = self
            .transfers
            .latest_for_study(ae_title, &metadata.study_uid)
        {
            let _ = self.transfers.update(record.id, |r| {
                r.set_status(TransferStatus::Failed);
                r.error_message = Some(format!("rejected: {}", reason));
            });
        }

        info!(
            ae = ae_title,
            study = %metadata.study_uid,
            review = review_id,
            user,
            reason,
            "review rejected"
        );
        let _ = self.events.send(PipelineEvent::ReviewDecided {
            ae_title: ae_title.to_string(),
            study_uid: metadata.study_uid.clone(),
            review_id: review_id.to_string(),
            approved: false,
            user: user.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicomgate_types::TransferRecord;
    use tempfile::TempDir;

    fn gate() -> (
        TempDir,
        ReviewGate,
        Arc<TransferStore>,
        mpsc::Receiver<WorkItem>,
    ) {
        let tmp = TempDir::new().unwrap();
        let layout = AeLayout::new(tmp.path(), "INGEST");
        layout.ensure().unwrap();
        let layouts = Arc::new(DashMap::new());
        layouts.insert("INGEST".to_string(), layout);
        let transfers = TransferStore::open(tmp.path()).unwrap();
        let (work_tx, work_rx) = mpsc::channel(8);
        let (events, _) = broadcast::channel(8);
        (
            tmp,
            ReviewGate::new(layouts, transfers.clone(), work_tx, events),
            transfers,
            work_rx,
        )
    }

    fn seed_processing(gate: &ReviewGate, uid: &str) {
        let layout = gate.layout("INGEST").unwrap();
        let dir = layout.study_dir(StudyStage::Processing, uid);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.dcm"), b"x").unwrap();
    }

    #[tokio::test]
    async fn test_submit_approve_resumes() {
        let (_tmp, gate, _transfers, mut work_rx) = gate();
        seed_processing(&gate, "1.2.3");

        let review_id = gate.submit("INGEST", "1.2.3", "PEER", Some("basic"), None).unwrap();
        assert_eq!(gate.pending("INGEST").unwrap().len(), 1);

        gate.approve("INGEST", &review_id, "alice", None).await.unwrap();
        let item = work_rx.recv().await.unwrap();
        assert_eq!(
            item,
            WorkItem::ForwardApproved {
                ae_title: "INGEST".into(),
                study_uid: "1.2.3".into()
            }
        );
        // study is back in processing under its own uid
        let layout = gate.layout("INGEST").unwrap();
        assert!(layout.study_dir(StudyStage::Processing, "1.2.3").is_dir());

        // second approve of a consumed id is a no-op success
        gate.approve("INGEST", &review_id, "alice", None).await.unwrap();
        assert!(work_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reject_fails_transfer() {
        let (_tmp, gate, transfers, _work_rx) = gate();
        seed_processing(&gate, "1.2.3");
        let record = TransferRecord::new("1.2.3", "INGEST", "PEER", 1, 10);
        let record_id = record.id;
        transfers.put(record).unwrap();

        let review_id = gate.submit("INGEST", "1.2.3", "PEER", None, None).unwrap();
        gate.reject("INGEST", &review_id, "bob", "missing consent").unwrap();

        let layout = gate.layout("INGEST").unwrap();
        let rejected_dir = layout.study_dir(StudyStage::ReviewRejected, &review_id);
        assert!(rejected_dir.is_dir());
        assert_eq!(
            sidecar::read_failure_reason(&rejected_dir).unwrap(),
            "rejected: missing consent"
        );

        let record = transfers.get(record_id).unwrap();
        assert_eq!(record.status, TransferStatus::Failed);
        assert_eq!(
            record.error_message.as_deref(),
            Some("rejected: missing consent")
        );
    }
}
