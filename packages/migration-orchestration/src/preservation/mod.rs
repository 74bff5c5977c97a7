//! Data preservation: snapshots, conflict detection and resolution

pub mod analyzer;
pub mod detector;
pub mod merge;
pub mod policy;
pub mod report;
pub mod resolver;

pub use analyzer::{AnalysisResult, ConflictAnalyzer, EntityAction, EntityDecision};
pub use detector::{
    classify_with_snapshot, detect_with_snapshot, diff, ChangeDetector, ChangeType,
    ConflictRecord, FieldChanges,
};
pub use merge::{extract_timestamp, merge_field, parse_timestamp};
pub use policy::{ConflictResolution, MergeStrategy, PolicyRegistry, PreservationPolicy};
pub use report::ConflictReport;
pub use resolver::Resolver;
