//! Conflict counts for operator-facing output

use super::policy::ConflictResolution;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflictReport {
    pub entities_analyzed: usize,
    pub conflicts: usize,
    /// Entities whose destination lookup failed
    pub unresolved: usize,
    pub by_entity_type: BTreeMap<String, usize>,
    /// Keyed by the strategy actually applied
    pub by_strategy: BTreeMap<String, usize>,
}

impl ConflictReport {
    pub fn record_analyzed(&mut self) {
        self.entities_analyzed += 1;
    }

    pub fn record_conflict(&mut self, entity_type: &str, applied: ConflictResolution) {
        self.conflicts += 1;
        *self.by_entity_type.entry(entity_type.to_string()).or_default() += 1;
        *self
            .by_strategy
            .entry(applied.as_str().to_string())
            .or_default() += 1;
    }

    pub fn record_unresolved(&mut self) {
        self.unresolved += 1;
    }

    /// Fold another report into this one
    pub fn merge(&mut self, other: &ConflictReport) {
        self.entities_analyzed += other.entities_analyzed;
        self.conflicts += other.conflicts;
        self.unresolved += other.unresolved;
        for (k, v) in &other.by_entity_type {
            *self.by_entity_type.entry(k.clone()).or_default() += v;
        }
        for (k, v) in &other.by_strategy {
            *self.by_strategy.entry(k.clone()).or_default() += v;
        }
    }
}

impl std::fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Conflicts: {} of {} entities ({} unresolved)",
            self.conflicts, self.entities_analyzed, self.unresolved
        )?;
        for (entity_type, count) in &self.by_entity_type {
            writeln!(f, "  {}: {}", entity_type, count)?;
        }
        for (strategy, count) in &self.by_strategy {
            writeln!(f, "  [{}] {}", strategy, count)?;
        }
        Ok(())
    }
}
