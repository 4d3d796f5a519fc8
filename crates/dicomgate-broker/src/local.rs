use async_trait::async_trait;
use chrono::Utc;
use dicomgate_types::GatewayError;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{Crosswalk, IdType};

/// Embedded SQLite crosswalk backend.
///
/// Single-writer, many-readers: all access goes through one mutex-guarded
/// connection, which is plenty for the lookup rates a gateway sees. The
/// `mappings` table is the crosswalk proper; `logs` records every create
/// for audit.
pub struct LocalBroker {
    name: String,
    prefix: String,
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl LocalBroker {
    pub fn open(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        prefix: impl Into<String>,
    ) -> Result<Self, GatewayError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)
            .map_err(|e| GatewayError::crosswalk(format!("cannot open {}: {}", path.display(), e)))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS mappings (
                broker TEXT NOT NULL,
                input_id TEXT NOT NULL,
                id_type TEXT NOT NULL,
                output_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (broker, input_id, id_type)
            );
            CREATE TABLE IF NOT EXISTS logs (
                at TEXT NOT NULL,
                broker TEXT NOT NULL,
                input_id TEXT NOT NULL,
                id_type TEXT NOT NULL,
                output_id TEXT NOT NULL,
                action TEXT NOT NULL
            );",
        )
        .map_err(|e| GatewayError::crosswalk(format!("schema init failed: {}", e)))?;
        let name = name.into();
        info!(broker = %name, path = %path.display(), "local broker opened");
        Ok(Self {
            name,
            prefix: prefix.into(),
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lookup_sync(&self, input_id: &str, id_type: IdType) -> Result<String, GatewayError> {
        lookup_or_create(&self.conn, &self.name, &self.prefix, input_id, id_type)
    }

    /// Copy the database file to a backup path.
    pub fn backup(&self, target: impl AsRef<Path>) -> Result<(), GatewayError> {
        let _guard = self.conn.lock();
        std::fs::copy(&self.path, target.as_ref())?;
        Ok(())
    }

    /// Replace the live database with a backup. The connection is
    /// re-opened against the restored file.
    pub fn restore(&self, source: impl AsRef<Path>) -> Result<(), GatewayError> {
        let mut guard = self.conn.lock();
        std::fs::copy(source.as_ref(), &self.path)?;
        *guard = Connection::open(&self.path)
            .map_err(|e| GatewayError::crosswalk(format!("re-open after restore failed: {}", e)))?;
        info!(broker = %self.name, "crosswalk restored from backup");
        Ok(())
    }

    /// Export all mappings of this broker as CSV.
    pub fn export_csv(&self, target: impl AsRef<Path>) -> Result<usize, GatewayError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT input_id, id_type, output_id, created_at, updated_at
                 FROM mappings WHERE broker = ?1 ORDER BY created_at",
            )
            .map_err(|e| GatewayError::crosswalk(format!("export query failed: {}", e)))?;
        let rows = stmt
            .query_map(params![self.name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|e| GatewayError::crosswalk(format!("export query failed: {}", e)))?;

        let mut writer = csv::Writer::from_path(target.as_ref())
            .map_err(|e| GatewayError::crosswalk(format!("csv open failed: {}", e)))?;
        writer
            .write_record(["input_id", "id_type", "output_id", "created_at", "updated_at"])
            .map_err(|e| GatewayError::crosswalk(format!("csv write failed: {}", e)))?;
        let mut count = 0;
        for row in rows {
            let (input_id, id_type, output_id, created_at, updated_at) =
                row.map_err(|e| GatewayError::crosswalk(format!("export row failed: {}", e)))?;
            writer
                .write_record([&input_id, &id_type, &output_id, &created_at, &updated_at])
                .map_err(|e| GatewayError::crosswalk(format!("csv write failed: {}", e)))?;
            count += 1;
        }
        writer
            .flush()
            .map_err(|e| GatewayError::crosswalk(format!("csv flush failed: {}", e)))?;
        Ok(count)
    }

    /// Remove audit log rows older than the retention window.
    pub fn cleanup_logs(&self, retention_days: i64) -> Result<usize, GatewayError> {
        if retention_days < 0 {
            return Ok(0);
        }
        let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).to_rfc3339();
        let conn = self.conn.lock();
        let removed = conn
            .execute("DELETE FROM logs WHERE at < ?1", params![cutoff])
            .map_err(|e| GatewayError::crosswalk(format!("log cleanup failed: {}", e)))?;
        Ok(removed)
    }
}

/// Find an existing mapping or mint and record a new one. Runs on the
/// blocking pool; the connection mutex makes it single-writer.
fn lookup_or_create(
    conn: &Mutex<Connection>,
    broker: &str,
    prefix: &str,
    input_id: &str,
    id_type: IdType,
) -> Result<String, GatewayError> {
    let conn = conn.lock();
    let existing: Option<String> = conn
        .query_row(
            "SELECT output_id FROM mappings WHERE broker = ?1 AND input_id = ?2 AND id_type = ?3",
            params![broker, input_id, id_type.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| GatewayError::crosswalk(format!("lookup failed: {}", e)))?;

    if let Some(output_id) = existing {
        return Ok(output_id);
    }

    let mut hasher = Sha256::new();
    hasher.update(broker.as_bytes());
    hasher.update(b"/");
    hasher.update(id_type.as_str().as_bytes());
    hasher.update(b"/");
    hasher.update(input_id.as_bytes());
    let digest = hasher.finalize();
    let output_id = format!("{}{}", prefix, hex::encode(&digest[..4]));

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO mappings (broker, input_id, id_type, output_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![broker, input_id, id_type.as_str(), output_id, now],
    )
    .map_err(|e| GatewayError::crosswalk(format!("insert failed: {}", e)))?;
    conn.execute(
        "INSERT INTO logs (at, broker, input_id, id_type, output_id, action)
         VALUES (?1, ?2, ?3, ?4, ?5, 'create')",
        params![now, broker, input_id, id_type.as_str(), output_id],
    )
    .map_err(|e| GatewayError::crosswalk(format!("log insert failed: {}", e)))?;
    debug!(broker, id_type = id_type.as_str(), "new crosswalk mapping");
    Ok(output_id)
}

#[async_trait]
impl Crosswalk for LocalBroker {
    async fn lookup(&self, input_id: &str, id_type: IdType) -> Result<String, GatewayError> {
        // rusqlite is synchronous; hop to the blocking pool so lookups do
        // not stall the pipeline workers.
        let conn = self.conn.clone();
        let name = self.name.clone();
        let prefix = self.prefix.clone();
        let input_id = input_id.to_string();
        tokio::task::spawn_blocking(move || {
            lookup_or_create(&conn, &name, &prefix, &input_id, id_type)
        })
        .await
        .map_err(|e| GatewayError::crosswalk(format!("lookup task failed: {}", e)))?
    }

    async fn test(&self) -> Result<(), GatewayError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM mappings", [], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(|e| GatewayError::crosswalk(format!("test query failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_mapping_is_stable_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("broker.db");

        let first = {
            let broker = LocalBroker::open("local-broker-1", &db, "SUBJ_").unwrap();
            broker.lookup("P12345", IdType::PatientId).await.unwrap()
        };
        assert!(first.starts_with("SUBJ_"));
        assert_eq!(first.len(), "SUBJ_".len() + 8);

        let broker = LocalBroker::open("local-broker-1", &db, "SUBJ_").unwrap();
        let second = broker.lookup("P12345", IdType::PatientId).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_distinct_inputs_get_distinct_outputs() {
        let tmp = TempDir::new().unwrap();
        let broker = LocalBroker::open("b", tmp.path().join("b.db"), "SUBJ_").unwrap();
        let a = broker.lookup("P1", IdType::PatientId).await.unwrap();
        let b = broker.lookup("P2", IdType::PatientId).await.unwrap();
        assert_ne!(a, b);
        // same input, different id type is a distinct mapping
        let c = broker.lookup("P1", IdType::PatientName).await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_csv_export() {
        let tmp = TempDir::new().unwrap();
        let broker = LocalBroker::open("b", tmp.path().join("b.db"), "SUBJ_").unwrap();
        broker.lookup("P1", IdType::PatientId).await.unwrap();
        broker.lookup("P2", IdType::PatientId).await.unwrap();

        let csv_path = tmp.path().join("export.csv");
        let count = broker.export_csv(&csv_path).unwrap();
        assert_eq!(count, 2);
        let content = std::fs::read_to_string(&csv_path).unwrap();
        assert!(content.starts_with("input_id,id_type,output_id"));
        assert!(content.contains("P1"));
    }

    #[tokio::test]
    async fn test_backup_restore() {
        let tmp = TempDir::new().unwrap();
        let broker = LocalBroker::open("b", tmp.path().join("b.db"), "SUBJ_").unwrap();
        let original = broker.lookup("P1", IdType::PatientId).await.unwrap();

        let backup = tmp.path().join("backup.db");
        broker.backup(&backup).unwrap();
        // new mapping after the backup point
        broker.lookup("P2", IdType::PatientId).await.unwrap();

        broker.restore(&backup).unwrap();
        // P1 survives, P2 regenerates identically anyway (hash-derived)
        let after = broker.lookup("P1", IdType::PatientId).await.unwrap();
        assert_eq!(original, after);
    }
}
