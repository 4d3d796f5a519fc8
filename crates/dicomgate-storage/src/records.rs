use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dicomgate_types::{GatewayError, TransferRecord, TransferStatus};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Query over the transfer record store. All criteria are conjunctive;
/// results are newest-first.
#[derive(Debug, Clone, Default)]
pub struct TransferQuery {
    pub ae_title: Option<String>,
    pub study_uid: Option<String>,
    pub status: Option<TransferStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub offset: usize,
    /// 0 means no limit
    pub limit: usize,
}

/// Long-lived store of transfer records: a concurrent in-memory map with a
/// JSON file per record under `<data_root>/records/`. Updates are
/// single-writer per record (the owning route worker), so the last write
/// wins without coordination.
pub struct TransferStore {
    dir: PathBuf,
    records: DashMap<Uuid, TransferRecord>,
}

impl TransferStore {
    pub fn open(data_root: impl AsRef<Path>) -> Result<Arc<Self>, GatewayError> {
        let dir = data_root.as_ref().join("records");
        fs::create_dir_all(&dir)?;
        let store = Self {
            dir,
            records: DashMap::new(),
        };
        store.load_existing()?;
        Ok(Arc::new(store))
    }

    fn load_existing(&self) -> Result<(), GatewayError> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match fs::read(&path).map_err(GatewayError::from).and_then(|raw| {
                    serde_json::from_slice::<TransferRecord>(&raw).map_err(GatewayError::from)
                }) {
                    Ok(record) => {
                        self.records.insert(record.id, record);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable transfer record")
                    }
                }
            }
        }
        debug!(count = self.records.len(), "transfer records loaded");
        Ok(())
    }

    /// Insert or replace a record and persist it.
    pub fn put(&self, record: TransferRecord) -> Result<(), GatewayError> {
        let path = self.dir.join(format!("{}.json", record.id));
        let tmp = self.dir.join(format!(".{}.tmp", record.id));
        fs::write(&tmp, serde_json::to_vec_pretty(&record)?)?;
        fs::rename(&tmp, &path)?;
        self.records.insert(record.id, record);
        Ok(())
    }

    /// Read-modify-write of one record under its map entry.
    pub fn update<F>(&self, id: Uuid, f: F) -> Result<Option<TransferRecord>, GatewayError>
    where
        F: FnOnce(&mut TransferRecord),
    {
        let updated = {
            let Some(mut entry) = self.records.get_mut(&id) else {
                return Ok(None);
            };
            f(entry.value_mut());
            entry.value().clone()
        };
        self.put(updated.clone())?;
        Ok(Some(updated))
    }

    pub fn get(&self, id: Uuid) -> Option<TransferRecord> {
        self.records.get(&id).map(|r| r.value().clone())
    }

    /// Most recent record for a study on a route.
    pub fn latest_for_study(&self, ae_title: &str, study_uid: &str) -> Option<TransferRecord> {
        self.records
            .iter()
            .filter(|r| r.ae_title == ae_title && r.study_uid == study_uid)
            .max_by_key(|r| r.created_at)
            .map(|r| r.value().clone())
    }

    pub fn query(&self, query: &TransferQuery) -> Vec<TransferRecord> {
        let mut hits: Vec<TransferRecord> = self
            .records
            .iter()
            .filter(|r| {
                query
                    .ae_title
                    .as_deref()
                    .map(|ae| r.ae_title == ae)
                    .unwrap_or(true)
                    && query
                        .study_uid
                        .as_deref()
                        .map(|uid| r.study_uid == uid)
                        .unwrap_or(true)
                    && query.status.map(|s| r.status == s).unwrap_or(true)
                    && query.from.map(|f| r.created_at >= f).unwrap_or(true)
                    && query.to.map(|t| r.created_at <= t).unwrap_or(true)
            })
            .map(|r| r.value().clone())
            .collect();
        hits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let iter = hits.into_iter().skip(query.offset);
        if query.limit > 0 {
            iter.take(query.limit).collect()
        } else {
            iter.collect()
        }
    }

    pub fn active(&self) -> Vec<TransferRecord> {
        self.records
            .iter()
            .filter(|r| {
                matches!(
                    r.status,
                    TransferStatus::Processing | TransferStatus::Forwarding | TransferStatus::Partial
                )
            })
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(ae: &str, uid: &str, status: TransferStatus) -> TransferRecord {
        let mut r = TransferRecord::new(uid, ae, "PEER", 1, 100);
        r.status = status;
        r
    }

    #[test]
    fn test_persist_and_reload() {
        let tmp = TempDir::new().unwrap();
        let id;
        {
            let store = TransferStore::open(tmp.path()).unwrap();
            let r = record("INGEST", "1.2.3", TransferStatus::Success);
            id = r.id;
            store.put(r).unwrap();
        }
        let store = TransferStore::open(tmp.path()).unwrap();
        assert_eq!(store.len(), 1);
        let loaded = store.get(id).unwrap();
        assert_eq!(loaded.study_uid, "1.2.3");
        assert_eq!(loaded.status, TransferStatus::Success);
    }

    #[test]
    fn test_query_filters_and_pagination() {
        let tmp = TempDir::new().unwrap();
        let store = TransferStore::open(tmp.path()).unwrap();
        for i in 0..5 {
            store
                .put(record("INGEST", &format!("1.2.{}", i), TransferStatus::Success))
                .unwrap();
        }
        store
            .put(record("OTHER", "9.9.9", TransferStatus::Failed))
            .unwrap();

        let hits = store.query(&TransferQuery {
            ae_title: Some("INGEST".into()),
            ..Default::default()
        });
        assert_eq!(hits.len(), 5);

        let page = store.query(&TransferQuery {
            ae_title: Some("INGEST".into()),
            offset: 2,
            limit: 2,
            ..Default::default()
        });
        assert_eq!(page.len(), 2);

        let failed = store.query(&TransferQuery {
            status: Some(TransferStatus::Failed),
            ..Default::default()
        });
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].ae_title, "OTHER");
    }

    #[test]
    fn test_update_persists() {
        let tmp = TempDir::new().unwrap();
        let store = TransferStore::open(tmp.path()).unwrap();
        let r = record("INGEST", "1.2.3", TransferStatus::Pending);
        let id = r.id;
        store.put(r).unwrap();
        store
            .update(id, |r| r.set_status(TransferStatus::Forwarding))
            .unwrap();
        assert_eq!(store.active().len(), 1);

        let reloaded = TransferStore::open(tmp.path()).unwrap();
        assert_eq!(
            reloaded.get(id).unwrap().status,
            TransferStatus::Forwarding
        );
    }
}
