//! Apply a resolution strategy to produce the data to write

use super::detector::ConflictRecord;
use super::merge::merge_field;
use super::policy::{ConflictResolution, PolicyRegistry, PreservationPolicy};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Resolver {
    policies: Arc<PolicyRegistry>,
}

fn as_object(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

impl Resolver {
    pub fn new(policies: Arc<PolicyRegistry>) -> Self {
        Self { policies }
    }

    /// Resolved entity data for a conflict
    ///
    /// `Skip` returns the destination unchanged; callers should not write.
    pub fn resolve(&self, conflict: &ConflictRecord, source: &Value, destination: &Value) -> Value {
        let policy = self.policies.get(&conflict.entity_type);
        resolve_with_policy(conflict, &policy, source, destination)
    }

    /// Source changes applied over the destination when nothing conflicts
    pub fn apply_source_changes(&self, entity_type: &str, source: &Value, destination: &Value) -> Value {
        let policy = self.policies.get(entity_type);
        apply_unprotected(&policy, source, destination)
    }
}

/// Every source field not protected by `policy`, over the destination
pub fn apply_unprotected(policy: &PreservationPolicy, source: &Value, destination: &Value) -> Value {
    let mut result = as_object(destination);
    for (field, value) in as_object(source) {
        if !policy.is_protected(&field) {
            result.insert(field, value);
        }
    }
    Value::Object(result)
}

pub fn resolve_with_policy(
    conflict: &ConflictRecord,
    policy: &PreservationPolicy,
    source: &Value,
    destination: &Value,
) -> Value {
    let source_fields = as_object(source);
    let mut result = as_object(destination);

    let strategy = conflict.resolution_strategy;
    if strategy == ConflictResolution::Prompt {
        warn!(
            entity_type = %conflict.entity_type,
            entity_id = %conflict.entity_id,
            fields = ?conflict.conflicted_fields,
            "Interactive resolution unavailable, preserving destination values"
        );
    }

    match strategy.effective() {
        ConflictResolution::Skip => return destination.clone(),
        ConflictResolution::SourceWins => {
            for (field, value) in source_fields {
                if !policy.is_protected(&field) {
                    result.insert(field, value);
                }
            }
        }
        ConflictResolution::DestinationWins | ConflictResolution::Prompt => {
            for (field, value) in source_fields {
                if !conflict.conflicted_fields.contains(&field) && !policy.is_protected(&field) {
                    result.insert(field, value);
                }
            }
        }
        ConflictResolution::Merge => {
            for field in &conflict.conflicted_fields {
                if policy.is_protected(field) {
                    continue;
                }
                let source_value = source_fields.get(field).cloned().unwrap_or(Value::Null);
                let merged = if policy.is_merge_field(field) {
                    let destination_value = result.get(field).cloned().unwrap_or(Value::Null);
                    merge_field(field, &source_value, &destination_value, policy.merge_strategy)
                } else {
                    source_value
                };
                result.insert(field.clone(), merged);
            }
            for (field, value) in source_fields {
                if !conflict.conflicted_fields.contains(&field) && !policy.is_protected(&field) {
                    result.insert(field, value);
                }
            }
        }
    }

    Value::Object(result)
}
