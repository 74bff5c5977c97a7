/*
 * Migration Orchestration - resilience and data preservation
 *
 * Layers used by entity-specific migration logic:
 * - Recovery orchestrator (checkpointed, resumable execution)
 * - Circuit breakers per dependency
 * - Retry with exponential backoff
 * - Snapshot-based conflict detection and policy-driven resolution
 * - Batched destination lookups
 *
 * Checkpoint, snapshot and policy persistence live in `migration-storage`.
 */

pub mod batch;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod preservation;
pub mod recovery;
pub mod retry;
pub mod telemetry;

// Re-exports
pub use batch::{BatchFetcher, DestinationClient, FetchOutcome, SourceChangeFeed};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use config::{
    BatchConfig, CircuitBreakerConfig, OrchestratorConfig, PreservationConfig, ResilienceConfig,
    RetryConfig,
};
pub use error::{ErrorCategory, MigrationError, Result};
pub use preservation::{
    AnalysisResult, ChangeDetector, ChangeType, ConflictAnalyzer, ConflictRecord,
    ConflictReport, ConflictResolution, EntityAction, EntityDecision, FieldChanges,
    MergeStrategy, PolicyRegistry, PreservationPolicy, Resolver,
};
pub use recovery::{checkpoint_args, BatchOutcome, RecoveryOrchestrator};
pub use retry::RetryPolicy;
pub use telemetry::init_tracing;
