//! Per-entity-type preservation policies

use crate::error::Result;
use migration_storage::{PolicyDocument, PolicyStore};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{info, warn};

/// How a detected conflict is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    SourceWins,
    DestinationWins,
    Merge,
    Skip,
    /// No interactive channel in batch mode; applied as `DestinationWins`
    Prompt,
}

impl ConflictResolution {
    pub const SAFE_DEFAULT: ConflictResolution = ConflictResolution::DestinationWins;

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::SourceWins => "source_wins",
            ConflictResolution::DestinationWins => "destination_wins",
            ConflictResolution::Merge => "merge",
            ConflictResolution::Skip => "skip",
            ConflictResolution::Prompt => "prompt",
        }
    }

    /// Strict parse; `None` for unknown tags
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "source_wins" => Some(ConflictResolution::SourceWins),
            "destination_wins" => Some(ConflictResolution::DestinationWins),
            "merge" => Some(ConflictResolution::Merge),
            "skip" => Some(ConflictResolution::Skip),
            "prompt" => Some(ConflictResolution::Prompt),
            _ => None,
        }
    }

    /// Parse, substituting `SAFE_DEFAULT` (with a warning) for unknown tags
    pub fn parse_or_default(tag: &str, entity_type: &str) -> Self {
        Self::parse(tag).unwrap_or_else(|| {
            warn!(
                entity_type,
                tag,
                fallback = Self::SAFE_DEFAULT.as_str(),
                "Unknown conflict resolution tag"
            );
            Self::SAFE_DEFAULT
        })
    }

    /// The strategy actually carried out
    pub fn effective(&self) -> Self {
        match self {
            ConflictResolution::Prompt => ConflictResolution::DestinationWins,
            other => *other,
        }
    }
}

impl std::fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a single conflicted field is merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    LatestTimestamp,
    LongestValue,
    Concatenate,
    Custom,
}

impl MergeStrategy {
    pub const SAFE_DEFAULT: MergeStrategy = MergeStrategy::LatestTimestamp;

    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::LatestTimestamp => "latest_timestamp",
            MergeStrategy::LongestValue => "longest_value",
            MergeStrategy::Concatenate => "concatenate",
            MergeStrategy::Custom => "custom",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "latest_timestamp" => Some(MergeStrategy::LatestTimestamp),
            "longest_value" => Some(MergeStrategy::LongestValue),
            "concatenate" => Some(MergeStrategy::Concatenate),
            "custom" => Some(MergeStrategy::Custom),
            _ => None,
        }
    }

    pub fn parse_or_default(tag: &str, entity_type: &str) -> Self {
        Self::parse(tag).unwrap_or_else(|| {
            warn!(
                entity_type,
                tag,
                fallback = Self::SAFE_DEFAULT.as_str(),
                "Unknown merge strategy tag"
            );
            Self::SAFE_DEFAULT
        })
    }
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreservationPolicy {
    pub entity_type: String,
    pub conflict_resolution: ConflictResolution,
    pub merge_strategy: MergeStrategy,
    /// Always keep the destination value
    pub protected_fields: BTreeSet<String>,
    /// Conflicted fields settled by `merge_strategy` under `Merge`
    pub merge_fields: BTreeSet<String>,
    /// Capture snapshots for this entity type
    pub track_changes: bool,
    pub backup_before_update: bool,
}

impl PreservationPolicy {
    pub fn new(
        entity_type: impl Into<String>,
        conflict_resolution: ConflictResolution,
        merge_strategy: MergeStrategy,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            conflict_resolution,
            merge_strategy,
            protected_fields: BTreeSet::new(),
            merge_fields: BTreeSet::new(),
            track_changes: true,
            backup_before_update: false,
        }
    }

    /// Conservative policy for entity types without configuration
    pub fn fallback(entity_type: impl Into<String>) -> Self {
        Self::new(
            entity_type,
            ConflictResolution::SAFE_DEFAULT,
            MergeStrategy::SAFE_DEFAULT,
        )
    }

    pub fn with_protected<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protected_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn with_merge_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.merge_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn with_backup(mut self, backup: bool) -> Self {
        self.backup_before_update = backup;
        self
    }

    pub fn with_tracking(mut self, track_changes: bool) -> Self {
        self.track_changes = track_changes;
        self
    }

    pub fn is_protected(&self, field: &str) -> bool {
        self.protected_fields.contains(field)
    }

    pub fn is_merge_field(&self, field: &str) -> bool {
        self.merge_fields.contains(field)
    }

    /// Build from a persisted document, tolerating unknown tags
    pub fn from_document(doc: &PolicyDocument) -> Self {
        Self {
            entity_type: doc.entity_type.clone(),
            conflict_resolution: ConflictResolution::parse_or_default(
                &doc.conflict_resolution,
                &doc.entity_type,
            ),
            merge_strategy: MergeStrategy::parse_or_default(&doc.merge_strategy, &doc.entity_type),
            protected_fields: doc.protected_fields.iter().cloned().collect(),
            merge_fields: doc.merge_fields.iter().cloned().collect(),
            track_changes: doc.track_changes,
            backup_before_update: doc.backup_before_update,
        }
    }

    pub fn to_document(&self) -> PolicyDocument {
        PolicyDocument {
            entity_type: self.entity_type.clone(),
            conflict_resolution: self.conflict_resolution.as_str().to_string(),
            merge_strategy: self.merge_strategy.as_str().to_string(),
            protected_fields: self.protected_fields.iter().cloned().collect(),
            merge_fields: self.merge_fields.iter().cloned().collect(),
            track_changes: self.track_changes,
            backup_before_update: self.backup_before_update,
        }
    }
}

/// Policies for every known entity type
///
/// Lookups for unconfigured types return `PreservationPolicy::fallback`.
#[derive(Debug)]
pub struct PolicyRegistry {
    policies: RwLock<HashMap<String, PreservationPolicy>>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PolicyRegistry {
    pub fn empty() -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
        }
    }

    /// Built-in policies for the standard tracker entity types
    pub fn with_defaults() -> Self {
        use ConflictResolution::*;
        use MergeStrategy::*;

        let defaults = [
            PreservationPolicy::new("users", DestinationWins, LatestTimestamp)
                .with_protected(["login", "email", "admin", "status"])
                .with_merge_fields(["firstname", "lastname"]),
            PreservationPolicy::new("projects", Merge, Concatenate)
                .with_protected(["identifier", "status", "public"])
                .with_merge_fields(["description"])
                .with_backup(true),
            PreservationPolicy::new("work_packages", Merge, Custom)
                .with_protected(["status", "assigned_to", "done_ratio"])
                .with_merge_fields(["description", "labels", "watchers"])
                .with_backup(true),
            PreservationPolicy::new("comments", Merge, Concatenate)
                .with_merge_fields(["body", "notes"]),
            PreservationPolicy::new("custom_fields", DestinationWins, LatestTimestamp)
                .with_protected(["field_format"]),
            PreservationPolicy::new("statuses", DestinationWins, LatestTimestamp)
                .with_protected(["is_closed", "is_default"]),
            PreservationPolicy::new("issue_types", DestinationWins, LatestTimestamp)
                .with_protected(["is_default", "is_milestone"]),
        ];

        Self {
            policies: RwLock::new(
                defaults
                    .into_iter()
                    .map(|p| (p.entity_type.clone(), p))
                    .collect(),
            ),
        }
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.policies.read().contains_key(entity_type)
    }

    /// Policy for `entity_type`, or the conservative fallback
    pub fn get(&self, entity_type: &str) -> PreservationPolicy {
        if let Some(policy) = self.policies.read().get(entity_type) {
            return policy.clone();
        }
        warn!(
            entity_type,
            "No preservation policy configured, preserving destination"
        );
        PreservationPolicy::fallback(entity_type)
    }

    pub fn entity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.policies.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Insert or replace a policy at runtime
    pub fn update(&self, policy: PreservationPolicy) {
        info!(
            entity_type = %policy.entity_type,
            conflict_resolution = %policy.conflict_resolution,
            merge_strategy = %policy.merge_strategy,
            "Preservation policy updated"
        );
        self.policies
            .write()
            .insert(policy.entity_type.clone(), policy);
    }

    /// Overlay persisted policies on the current set
    pub async fn load(&self, store: &dyn PolicyStore) -> Result<usize> {
        let documents = store.load_policies().await?;
        let count = documents.len();

        let mut policies = self.policies.write();
        for doc in &documents {
            let policy = PreservationPolicy::from_document(doc);
            policies.insert(policy.entity_type.clone(), policy);
        }
        Ok(count)
    }

    /// Write every policy to `store`
    pub async fn persist(&self, store: &dyn PolicyStore) -> Result<usize> {
        let documents: Vec<PolicyDocument> = self
            .policies
            .read()
            .values()
            .map(PreservationPolicy::to_document)
            .collect();

        for doc in &documents {
            store.save_policy(doc).await?;
        }
        Ok(documents.len())
    }
}
