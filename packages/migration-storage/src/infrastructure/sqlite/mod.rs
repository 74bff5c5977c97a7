//! SQLite store
//!
//! File-based persistent storage for checkpoints, snapshots and policies.
//! Every write is a single committed statement or transaction, so a returned
//! `Ok` means the row is durable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    CheckpointRecord, CheckpointStatus, CheckpointStore, EntitySnapshot, PolicyDocument,
    PolicyStore, SnapshotSource, SnapshotStore,
};
use crate::error::{Result, StorageError};

const CHECKPOINT_COLUMNS: &str = "id, migration_id, checkpoint_type, entity_id, status, payload, \
     created_at, updated_at, error_message, retry_count";

/// SQLite-backed implementation of every port
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory SQLite store (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch("PRAGMA synchronous = FULL;")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS migration_checkpoints (
                id TEXT PRIMARY KEY,
                migration_id TEXT NOT NULL,
                checkpoint_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_checkpoints_entity
             ON migration_checkpoints(migration_id, entity_id)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_status
             ON migration_checkpoints(migration_id, status)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS entity_snapshots (
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                checksum TEXT NOT NULL,
                data TEXT NOT NULL,
                source TEXT NOT NULL,
                PRIMARY KEY (entity_type, entity_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS preservation_policies (
                entity_type TEXT PRIMARY KEY,
                document TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        debug!("SQLite migration ledger schema ready");
        Ok(())
    }
}

/// Raw checkpoint row, converted outside the rusqlite row callback so
/// domain parse errors surface as `StorageError`
struct CheckpointRow {
    id: String,
    migration_id: String,
    checkpoint_type: String,
    entity_id: String,
    status: String,
    payload: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    error_message: Option<String>,
    retry_count: u32,
}

impl CheckpointRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            migration_id: row.get(1)?,
            checkpoint_type: row.get(2)?,
            entity_id: row.get(3)?,
            status: row.get(4)?,
            payload: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            error_message: row.get(8)?,
            retry_count: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<CheckpointRecord> {
        Ok(CheckpointRecord {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| StorageError::serialization(format!("Invalid checkpoint id: {}", e)))?,
            migration_id: self.migration_id,
            checkpoint_type: self.checkpoint_type,
            entity_id: self.entity_id,
            status: CheckpointStatus::from_str(&self.status)?,
            payload: serde_json::from_str(&self.payload)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            error_message: self.error_message,
            retry_count: self.retry_count,
        })
    }
}

fn select_checkpoint(
    conn: &Connection,
    migration_id: &str,
    entity_id: &str,
) -> Result<Option<CheckpointRecord>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM migration_checkpoints WHERE migration_id = ?1 AND entity_id = ?2",
                CHECKPOINT_COLUMNS
            ),
            params![migration_id, entity_id],
            CheckpointRow::from_row,
        )
        .optional()?;
    row.map(CheckpointRow::into_record).transpose()
}

fn write_checkpoint(conn: &Connection, record: &CheckpointRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO migration_checkpoints
            (id, migration_id, checkpoint_type, entity_id, status, payload,
             created_at, updated_at, error_message, retry_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.id.to_string(),
            &record.migration_id,
            &record.checkpoint_type,
            &record.entity_id,
            record.status.as_str(),
            serde_json::to_string(&record.payload)?,
            record.created_at,
            record.updated_at,
            &record.error_message,
            record.retry_count,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn create(
        &self,
        migration_id: &str,
        checkpoint_type: &str,
        entity_id: &str,
        payload: Value,
    ) -> Result<CheckpointRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let record = match select_checkpoint(&tx, migration_id, entity_id)? {
            Some(mut existing) => {
                existing.reopen(checkpoint_type, payload);
                existing
            }
            None => CheckpointRecord::new_pending(migration_id, checkpoint_type, entity_id, payload),
        };
        write_checkpoint(&tx, &record)?;

        tx.commit()?;
        Ok(record)
    }

    async fn update(
        &self,
        migration_id: &str,
        entity_id: &str,
        status: CheckpointStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut record = select_checkpoint(&tx, migration_id, entity_id)?
            .ok_or_else(|| StorageError::checkpoint_not_found(migration_id, entity_id))?;
        record.transition(status, error_message);
        write_checkpoint(&tx, &record)?;

        tx.commit()?;
        Ok(())
    }

    async fn get(&self, migration_id: &str, entity_id: &str) -> Result<Option<CheckpointRecord>> {
        let conn = self.conn.lock();
        select_checkpoint(&conn, migration_id, entity_id)
    }

    async fn list(
        &self,
        migration_id: &str,
        status: Option<CheckpointStatus>,
        checkpoint_type: Option<&str>,
    ) -> Result<Vec<CheckpointRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM migration_checkpoints
             WHERE migration_id = ?1
               AND (?2 IS NULL OR status = ?2)
               AND (?3 IS NULL OR checkpoint_type = ?3)
             ORDER BY created_at, entity_id",
            CHECKPOINT_COLUMNS
        ))?;

        let rows = stmt
            .query_map(
                params![migration_id, status.map(|s| s.as_str()), checkpoint_type],
                CheckpointRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(CheckpointRow::into_record).collect()
    }

    async fn clear(&self, migration_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM migration_checkpoints WHERE migration_id = ?1",
            params![migration_id],
        )?;
        debug!(migration_id, deleted, "Checkpoints cleared");
        Ok(deleted)
    }
}

#[async_trait]
impl SnapshotStore for SqliteStore {
    async fn save_snapshot(&self, snapshot: &EntitySnapshot) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO entity_snapshots
                (entity_type, entity_id, timestamp, checksum, data, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &snapshot.entity_type,
                &snapshot.entity_id,
                snapshot.timestamp,
                &snapshot.checksum,
                serde_json::to_string(&snapshot.data)?,
                snapshot.source.as_str(),
            ],
        )?;
        Ok(())
    }

    async fn get_snapshot(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<EntitySnapshot>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT timestamp, checksum, data, source FROM entity_snapshots
                 WHERE entity_type = ?1 AND entity_id = ?2",
                params![entity_type, entity_id],
                |row| {
                    Ok((
                        row.get::<_, DateTime<Utc>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(timestamp, checksum, data, source)| {
            Ok(EntitySnapshot {
                entity_id: entity_id.to_string(),
                entity_type: entity_type.to_string(),
                timestamp,
                checksum,
                data: serde_json::from_str(&data)?,
                source: SnapshotSource::from_str(&source)?,
            })
        })
        .transpose()
    }

    async fn delete_snapshot(&self, entity_type: &str, entity_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM entity_snapshots WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity_type, entity_id],
        )?;
        Ok(deleted > 0)
    }

    async fn count_snapshots(&self, entity_type: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entity_snapshots WHERE entity_type = ?1",
            params![entity_type],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[async_trait]
impl PolicyStore for SqliteStore {
    async fn load_policies(&self) -> Result<Vec<PolicyDocument>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT document FROM preservation_policies ORDER BY entity_type")?;
        let documents = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        documents
            .iter()
            .map(|doc| serde_json::from_str(doc).map_err(StorageError::from))
            .collect()
    }

    async fn save_policy(&self, policy: &PolicyDocument) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO preservation_policies (entity_type, document, updated_at)
             VALUES (?1, ?2, ?3)",
            params![
                &policy.entity_type,
                serde_json::to_string(policy)?,
                Utc::now()
            ],
        )?;
        Ok(())
    }
}
