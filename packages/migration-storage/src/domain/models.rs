//! Domain models persisted by the storage adapters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::checksum::{checksum, normalize, VolatileFields};
use crate::error::{Result, StorageError};

// ═══════════════════════════════════════════════════════════════════════════
// Checkpoints
// ═══════════════════════════════════════════════════════════════════════════

/// Status of one entity's migration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(CheckpointStatus::Pending),
            "completed" => Ok(CheckpointStatus::Completed),
            "failed" => Ok(CheckpointStatus::Failed),
            _ => Err(StorageError::serialization(format!(
                "Invalid checkpoint status: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable record of one entity's migration attempt
///
/// There is at most one record per `(migration_id, entity_id)`. Re-opening a
/// record for a new attempt keeps `retry_count`, which counts failed attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: Uuid,
    pub migration_id: String,
    /// Entity kind, e.g. "issue" or "comment"
    pub checkpoint_type: String,
    pub entity_id: String,
    pub status: CheckpointStatus,
    /// Opaque resume data
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

impl CheckpointRecord {
    /// Create a fresh pending record
    pub fn new_pending(
        migration_id: impl Into<String>,
        checkpoint_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            migration_id: migration_id.into(),
            checkpoint_type: checkpoint_type.into(),
            entity_id: entity_id.into(),
            status: CheckpointStatus::Pending,
            payload,
            created_at: now,
            updated_at: now,
            error_message: None,
            retry_count: 0,
        }
    }

    /// Start a new pending attempt on an existing record
    pub fn reopen(&mut self, checkpoint_type: impl Into<String>, payload: Value) {
        self.checkpoint_type = checkpoint_type.into();
        self.status = CheckpointStatus::Pending;
        self.payload = payload;
        self.error_message = None;
        self.updated_at = Utc::now();
    }

    /// Record the outcome of the current attempt
    pub fn transition(&mut self, status: CheckpointStatus, error_message: Option<&str>) {
        if status == CheckpointStatus::Failed {
            self.retry_count += 1;
            self.error_message = error_message.map(str::to_string);
        } else if let Some(message) = error_message {
            self.error_message = Some(message.to_string());
        }
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.status != CheckpointStatus::Pending
    }
}

/// Progress counts for one migration run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
}

impl CheckpointSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a CheckpointRecord>) -> Self {
        let mut summary = Self::default();
        for record in records {
            summary.add(record.status);
        }
        summary
    }

    pub fn add(&mut self, status: CheckpointStatus) {
        self.total += 1;
        match status {
            CheckpointStatus::Pending => self.pending += 1,
            CheckpointStatus::Completed => self.completed += 1,
            CheckpointStatus::Failed => self.failed += 1,
        }
    }

    /// Every recorded entity completed
    pub fn is_complete(&self) -> bool {
        self.pending == 0 && self.failed == 0
    }
}

impl std::fmt::Display for CheckpointSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total={} completed={} failed={} pending={}",
            self.total, self.completed, self.failed, self.pending
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Snapshots
// ═══════════════════════════════════════════════════════════════════════════

/// Who produced the snapshotted state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    Migration,
    Manual,
}

impl SnapshotSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotSource::Migration => "migration",
            SnapshotSource::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "migration" => Ok(SnapshotSource::Migration),
            "manual" => Ok(SnapshotSource::Manual),
            _ => Err(StorageError::serialization(format!(
                "Invalid snapshot source: {}",
                s
            ))),
        }
    }
}

/// Last-known-good state of a destination entity
///
/// Immutable once captured. A newer capture for the same
/// `(entity_type, entity_id)` supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_id: String,
    pub entity_type: String,
    pub timestamp: DateTime<Utc>,
    pub checksum: String,
    /// Normalized payload (volatile fields removed)
    pub data: Value,
    pub source: SnapshotSource,
}

impl EntitySnapshot {
    /// Normalize `data` and compute its checksum
    pub fn capture(
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
        data: &Value,
        source: SnapshotSource,
        volatile: &VolatileFields,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            timestamp: Utc::now(),
            checksum: checksum(data, volatile),
            data: normalize(data, volatile),
            source,
        }
    }

    /// Does `current` carry the same logical content?
    pub fn matches(&self, current: &Value, volatile: &VolatileFields) -> bool {
        self.checksum == checksum(current, volatile)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Preservation policies
// ═══════════════════════════════════════════════════════════════════════════

/// Persisted preservation policy for one entity type
///
/// Strategy fields are stored as stable string tags. They are validated when
/// loaded, so an unknown tag written by a newer version never breaks startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub entity_type: String,
    pub conflict_resolution: String,
    pub merge_strategy: String,
    #[serde(default)]
    pub protected_fields: Vec<String>,
    #[serde(default)]
    pub merge_fields: Vec<String>,
    #[serde(default = "default_true")]
    pub track_changes: bool,
    #[serde(default)]
    pub backup_before_update: bool,
}

fn default_true() -> bool {
    true
}
