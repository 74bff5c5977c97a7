//! Batch conflict analysis
//!
//! Phases:
//! 1. Batched destination fetch (network)
//! 2. Concurrent snapshot loads
//! 3. Detection and resolution fanned out on rayon (CPU only)

use super::detector::{detect_with_snapshot, ChangeDetector, ConflictRecord, FieldChanges};
use super::policy::{ConflictResolution, PolicyRegistry};
use super::report::ConflictReport;
use super::resolver::{apply_unprotected, resolve_with_policy};
use crate::batch::{BatchFetcher, SourceChangeFeed};
use crate::error::{MigrationError, Result};
use futures::future::try_join_all;
use migration_storage::{EntitySnapshot, VolatileFields};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityAction {
    Create,
    Update,
    /// Nothing to write
    Skip,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityDecision {
    pub entity_id: String,
    pub action: EntityAction,
    /// Data to write (destination data for `Skip`)
    pub payload: Value,
    pub conflict: Option<ConflictRecord>,
    /// Effective strategy when a conflict was resolved
    pub strategy_applied: Option<ConflictResolution>,
    pub backup_required: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisResult {
    pub decisions: Vec<EntityDecision>,
    /// Ids whose destination lookup failed, with the error message
    pub unresolved: BTreeMap<String, String>,
    pub report: ConflictReport,
}

impl AnalysisResult {
    pub fn conflicts(&self) -> impl Iterator<Item = &ConflictRecord> {
        self.decisions.iter().filter_map(|d| d.conflict.as_ref())
    }
}

struct EntityInput {
    entity_id: String,
    changes: FieldChanges,
    current: Option<Value>,
    snapshot: Option<EntitySnapshot>,
}

pub struct ConflictAnalyzer {
    fetcher: BatchFetcher,
    detector: Arc<ChangeDetector>,
}

impl ConflictAnalyzer {
    pub fn new(fetcher: BatchFetcher, detector: Arc<ChangeDetector>) -> Self {
        Self { fetcher, detector }
    }

    /// Decide what to write for each entity with upstream changes
    pub async fn analyze(
        &self,
        entity_type: &str,
        source_changes: BTreeMap<String, FieldChanges>,
    ) -> Result<AnalysisResult> {
        let ids: Vec<String> = source_changes.keys().cloned().collect();
        let fetched = self.fetcher.fetch_many(&ids, entity_type).await;

        let found: Vec<&String> = fetched.records.keys().collect();
        let snapshots: Vec<Option<EntitySnapshot>> = try_join_all(
            found
                .iter()
                .map(|id| self.detector.snapshot(entity_type, id)),
        )
        .await?;
        let mut snapshots: BTreeMap<String, EntitySnapshot> = snapshots
            .into_iter()
            .flatten()
            .map(|s| (s.entity_id.clone(), s))
            .collect();

        let mut records = fetched.records;
        let inputs: Vec<EntityInput> = source_changes
            .into_iter()
            .filter(|(id, _)| !fetched.failed.contains_key(id))
            .map(|(entity_id, changes)| EntityInput {
                current: records.remove(&entity_id),
                snapshot: snapshots.remove(&entity_id),
                entity_id,
                changes,
            })
            .collect();

        let registry = Arc::clone(self.detector.policies());
        let volatile = self.detector.volatile().clone();
        let owned_type = entity_type.to_string();
        let decisions = tokio::task::spawn_blocking(move || {
            decide_all(&owned_type, inputs, &registry, &volatile)
        })
        .await
        .map_err(|e| MigrationError::Other(anyhow::anyhow!("conflict analysis task failed: {}", e)))?;

        let mut report = ConflictReport::default();
        for decision in &decisions {
            report.record_analyzed();
            if let (Some(_), Some(applied)) = (&decision.conflict, decision.strategy_applied) {
                report.record_conflict(entity_type, applied);
            }
        }
        for _ in &fetched.failed {
            report.record_unresolved();
        }

        info!(
            entity_type,
            analyzed = report.entities_analyzed,
            conflicts = report.conflicts,
            unresolved = report.unresolved,
            "Conflict analysis complete"
        );

        Ok(AnalysisResult {
            decisions,
            unresolved: fetched.failed,
            report,
        })
    }

    /// Pull upstream changes for `keys`, then analyze them
    pub async fn analyze_from_feed(
        &self,
        feed: &dyn SourceChangeFeed,
        entity_type: &str,
        keys: &[String],
    ) -> Result<AnalysisResult> {
        let changes = feed.changes(entity_type, keys).await?;
        self.analyze(entity_type, changes).await
    }
}

fn decide_all(
    entity_type: &str,
    inputs: Vec<EntityInput>,
    registry: &PolicyRegistry,
    volatile: &VolatileFields,
) -> Vec<EntityDecision> {
    let policy = registry.get(entity_type);

    inputs
        .into_par_iter()
        .map(|input| {
            let source = Value::Object(input.changes.clone());
            let current = match input.current {
                None => {
                    return EntityDecision {
                        entity_id: input.entity_id,
                        action: EntityAction::Create,
                        payload: source,
                        conflict: None,
                        strategy_applied: None,
                        backup_required: false,
                    };
                }
                Some(current) => current,
            };

            let conflict = detect_with_snapshot(
                input.snapshot.as_ref(),
                &input.changes,
                &input.entity_id,
                entity_type,
                &current,
                &policy,
                volatile,
            );

            let (payload, strategy_applied) = match &conflict {
                Some(c) => (
                    resolve_with_policy(c, &policy, &source, &current),
                    Some(c.resolution_strategy.effective()),
                ),
                None => (apply_unprotected(&policy, &source, &current), None),
            };

            let action = if strategy_applied == Some(ConflictResolution::Skip) || payload == current {
                EntityAction::Skip
            } else {
                EntityAction::Update
            };

            EntityDecision {
                entity_id: input.entity_id,
                action,
                backup_required: action == EntityAction::Update && policy.backup_before_update,
                payload,
                conflict,
                strategy_applied,
            }
        })
        .collect()
}
