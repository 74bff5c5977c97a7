//! Checkpointed execution of per-entity migration steps
//!
//! Every `run` opens a pending checkpoint, executes the operation through the
//! circuit breaker (optionally retrying inside it), and records the terminal
//! status. Execution is at-least-once: an attempt interrupted before its
//! terminal write stays `pending` and is picked up by `resume`.

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::ResilienceConfig;
use crate::error::{MigrationError, Result};
use crate::retry::RetryPolicy;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use migration_storage::{CheckpointRecord, CheckpointStatus, CheckpointStore, CheckpointSummary};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Result of driving many entities through `run_batch`
#[derive(Debug)]
pub struct BatchOutcome<T> {
    /// Operation results keyed by entity id
    pub completed: BTreeMap<String, T>,
    /// Error messages keyed by entity id
    pub failed: BTreeMap<String, String>,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self {
            completed: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }
}

impl<T> BatchOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.completed.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Arguments recorded by `run` in a checkpoint payload
pub fn checkpoint_args(record: &CheckpointRecord) -> Option<&Value> {
    record.payload.get("args")
}

pub struct RecoveryOrchestrator {
    store: Arc<dyn CheckpointStore>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: Option<RetryPolicy>,
    service: String,
    max_concurrency: usize,
    worker_id: String,
}

fn new_worker_id() -> String {
    format!("worker-{}", Uuid::new_v4())
}

impl RecoveryOrchestrator {
    /// Orchestrator without retries, guarded by the `destination` breaker
    pub fn new(store: Arc<dyn CheckpointStore>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        let defaults = crate::config::OrchestratorConfig::default();
        Self {
            store,
            breakers,
            retry: None,
            service: defaults.service,
            max_concurrency: defaults.max_concurrency,
            worker_id: new_worker_id(),
        }
    }

    /// Orchestrator with its own breaker registry, built from config
    pub fn from_config(store: Arc<dyn CheckpointStore>, config: &ResilienceConfig) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let retry = config
            .orchestrator
            .retry_enabled
            .then(|| RetryPolicy::from_config(&config.retry));

        Self {
            store,
            breakers,
            retry,
            service: config.orchestrator.service.clone(),
            max_concurrency: config.orchestrator.max_concurrency.max(1),
            worker_id: new_worker_id(),
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.retry = None;
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Identifies this orchestrator in logs
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Execute `operation` for one entity with checkpointing
    ///
    /// # Errors
    ///
    /// - `Storage` if the pending or completed checkpoint cannot be written;
    ///   success is never reported without a durable checkpoint
    /// - the operation's own error (after recording `failed`)
    pub async fn run<F, Fut, T>(
        &self,
        migration_id: &str,
        checkpoint_type: &str,
        entity_id: &str,
        args: Value,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let payload = json!({
            "args": args,
            "timestamp": Utc::now().to_rfc3339(),
        });
        self.store
            .create(migration_id, checkpoint_type, entity_id, payload)
            .await?;

        let mut operation = operation;
        let retry = self.retry.as_ref();
        let outcome = self
            .breakers
            .call(&self.service, || async move {
                match retry {
                    Some(policy) => policy.execute(&mut operation).await,
                    None => operation().await,
                }
            })
            .await;

        match outcome {
            Ok(value) => {
                if let Err(e) = self
                    .store
                    .update(migration_id, entity_id, CheckpointStatus::Completed, None)
                    .await
                {
                    error!(
                        migration_id,
                        entity_id,
                        checkpoint_type,
                        error = %e,
                        "Operation succeeded but completion checkpoint was not recorded"
                    );
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(e) => {
                let message = e.to_string();
                error!(
                    migration_id,
                    entity_id,
                    checkpoint_type,
                    worker_id = %self.worker_id,
                    category = %e.category(),
                    error = %message,
                    "Migration step failed"
                );
                if let Err(storage_err) = self
                    .store
                    .update(migration_id, entity_id, CheckpointStatus::Failed, Some(&message))
                    .await
                {
                    error!(
                        migration_id,
                        entity_id,
                        error = %storage_err,
                        "Failed to record failed checkpoint"
                    );
                }
                Err(e)
            }
        }
    }

    /// Drive many entities with bounded concurrency
    ///
    /// A failing entity is recorded and logged; the rest of the batch continues.
    pub async fn run_batch<I, F, Fut, T>(
        &self,
        migration_id: &str,
        checkpoint_type: &str,
        items: I,
        operation: F,
    ) -> BatchOutcome<T>
    where
        I: IntoIterator<Item = (String, Value)>,
        F: Fn(String, Value) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let operation = &operation;
        let results: Vec<(String, Result<T>)> = stream::iter(items)
            .map(|(entity_id, args)| async move {
                let result = self
                    .run(migration_id, checkpoint_type, &entity_id, args.clone(), || {
                        operation(entity_id.clone(), args.clone())
                    })
                    .await;
                (entity_id, result)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut outcome = BatchOutcome::default();
        for (entity_id, result) in results {
            match result {
                Ok(value) => {
                    outcome.completed.insert(entity_id, value);
                }
                Err(e) => {
                    outcome.failed.insert(entity_id, e.to_string());
                }
            }
        }

        info!(
            migration_id,
            checkpoint_type,
            worker_id = %self.worker_id,
            completed = outcome.completed.len(),
            failed = outcome.failed.len(),
            "Batch finished"
        );
        outcome
    }

    /// Pending records left by an interrupted run
    ///
    /// Failed records are not included; see `resubmit_failed`.
    pub async fn resume(
        &self,
        migration_id: &str,
        checkpoint_type: Option<&str>,
    ) -> Result<Vec<CheckpointRecord>> {
        let pending = self.store.pending(migration_id, checkpoint_type).await?;
        if !pending.is_empty() {
            info!(
                migration_id,
                pending = pending.len(),
                "Resuming from checkpoint"
            );
        }
        Ok(pending)
    }

    /// Move failed records back to pending, keeping their retry count
    pub async fn resubmit_failed(
        &self,
        migration_id: &str,
        checkpoint_type: Option<&str>,
    ) -> Result<Vec<CheckpointRecord>> {
        let failed = self.store.failed(migration_id, checkpoint_type).await?;

        let mut reopened = Vec::with_capacity(failed.len());
        for record in failed {
            let record = self
                .store
                .create(
                    migration_id,
                    &record.checkpoint_type,
                    &record.entity_id,
                    record.payload,
                )
                .await?;
            reopened.push(record);
        }

        if !reopened.is_empty() {
            warn!(
                migration_id,
                resubmitted = reopened.len(),
                "Failed checkpoints re-submitted"
            );
        }
        Ok(reopened)
    }

    pub async fn summary(&self, migration_id: &str) -> Result<CheckpointSummary> {
        Ok(self.store.summary(migration_id).await?)
    }

    /// Clear a finished run
    ///
    /// # Errors
    ///
    /// `IncompleteRun` while any record is pending or failed.
    pub async fn retire(&self, migration_id: &str) -> Result<usize> {
        let summary = self.store.summary(migration_id).await?;
        if !summary.is_complete() {
            return Err(MigrationError::IncompleteRun {
                migration_id: migration_id.to_string(),
                pending: summary.pending,
                failed: summary.failed,
            });
        }

        let removed = self.store.clear(migration_id).await?;
        info!(migration_id, removed, "Migration run retired");
        Ok(removed)
    }

    /// Clear a run regardless of its state
    pub async fn reset(&self, migration_id: &str) -> Result<usize> {
        let removed = self.store.clear(migration_id).await?;
        warn!(migration_id, removed, "Migration run reset");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::error::ErrorCategory;
    use async_trait::async_trait;
    use migration_storage::{InMemoryStore, StorageError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn orchestrator(store: Arc<dyn CheckpointStore>) -> RecoveryOrchestrator {
        RecoveryOrchestrator::new(store, Arc::new(CircuitBreakerRegistry::default()))
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            exponential_base: 2.0,
            jitter: false,
            retryable: vec![ErrorCategory::Transient],
        }
    }

    #[tokio::test]
    async fn test_run_success_marks_completed() {
        let store = Arc::new(InMemoryStore::new());
        let orch = orchestrator(store.clone());

        let value = orch
            .run("m1", "issue", "E-1", json!({"key": "PROJ-1"}), || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);

        let record = store.get("m1", "E-1").await.unwrap().unwrap();
        assert_eq!(record.status, CheckpointStatus::Completed);
        assert_eq!(checkpoint_args(&record), Some(&json!({"key": "PROJ-1"})));
        assert!(record.payload.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn test_run_failure_marks_failed_and_reraises() {
        let store = Arc::new(InMemoryStore::new());
        let orch = orchestrator(store.clone());

        let result: Result<()> = orch
            .run("m1", "issue", "E-1", Value::Null, || async {
                Err(MigrationError::validation("subject can't be blank"))
            })
            .await;
        assert!(matches!(result, Err(MigrationError::Validation(_))));

        let record = store.get("m1", "E-1").await.unwrap().unwrap();
        assert_eq!(record.status, CheckpointStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert!(record
            .error_message
            .as_deref()
            .unwrap()
            .contains("subject can't be blank"));
    }

    #[tokio::test]
    async fn test_retry_inside_breaker() {
        let store = Arc::new(InMemoryStore::new());
        let orch = orchestrator(store.clone()).with_retry(fast_retry(3));
        let calls = AtomicU32::new(0);

        let value = orch
            .run("m1", "issue", "E-1", Value::Null, || {
                let count = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if count == 0 {
                        Err(MigrationError::transient("502"))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(orch.summary("m1").await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_open_circuit_fails_without_invoking() {
        let store = Arc::new(InMemoryStore::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            fail_max: 1,
            reset_timeout_ms: 60_000,
        }));
        let orch = RecoveryOrchestrator::new(store.clone(), breakers);
        let calls = AtomicU32::new(0);

        for entity in ["E-1", "E-2"] {
            let _: Result<()> = orch
                .run("m1", "issue", entity, Value::Null, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(MigrationError::transient("connection refused")) }
                })
                .await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let record = store.get("m1", "E-2").await.unwrap().unwrap();
        assert_eq!(record.status, CheckpointStatus::Failed);
        assert!(record.error_message.unwrap().contains("Circuit open"));
    }

    /// Store with switchable write failures
    #[derive(Default)]
    struct UnreliableStore {
        inner: InMemoryStore,
        fail_create: bool,
        fail_completion: bool,
    }

    #[async_trait]
    impl CheckpointStore for UnreliableStore {
        async fn create(
            &self,
            migration_id: &str,
            checkpoint_type: &str,
            entity_id: &str,
            payload: Value,
        ) -> migration_storage::Result<CheckpointRecord> {
            if self.fail_create {
                return Err(StorageError::database("database is locked"));
            }
            self.inner
                .create(migration_id, checkpoint_type, entity_id, payload)
                .await
        }

        async fn update(
            &self,
            migration_id: &str,
            entity_id: &str,
            status: CheckpointStatus,
            error_message: Option<&str>,
        ) -> migration_storage::Result<()> {
            if self.fail_completion && status == CheckpointStatus::Completed {
                return Err(StorageError::database("disk I/O error"));
            }
            self.inner
                .update(migration_id, entity_id, status, error_message)
                .await
        }

        async fn get(
            &self,
            migration_id: &str,
            entity_id: &str,
        ) -> migration_storage::Result<Option<CheckpointRecord>> {
            self.inner.get(migration_id, entity_id).await
        }

        async fn list(
            &self,
            migration_id: &str,
            status: Option<CheckpointStatus>,
            checkpoint_type: Option<&str>,
        ) -> migration_storage::Result<Vec<CheckpointRecord>> {
            self.inner.list(migration_id, status, checkpoint_type).await
        }

        async fn clear(&self, migration_id: &str) -> migration_storage::Result<usize> {
            self.inner.clear(migration_id).await
        }
    }

    #[tokio::test]
    async fn test_success_without_checkpoint_is_storage_error() {
        let store = Arc::new(UnreliableStore {
            fail_completion: true,
            ..Default::default()
        });
        let orch = orchestrator(store.clone());

        let result = orch
            .run("m1", "issue", "E-1", Value::Null, || async { Ok(()) })
            .await;

        assert!(matches!(result, Err(MigrationError::Storage(_))));
        assert_eq!(orch.resume("m1", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_uncommitted_checkpoint_skips_operation() {
        let store = Arc::new(UnreliableStore {
            fail_create: true,
            ..Default::default()
        });
        let orch = orchestrator(store.clone());
        let calls = AtomicU32::new(0);

        let result = orch
            .run("m1", "issue", "E-1", Value::Null, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(MigrationError::Storage(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(store.get("m1", "E-1").await.unwrap().is_none());
        assert_eq!(orch.summary("m1").await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_run_batch_continues_past_failures() {
        let store = Arc::new(InMemoryStore::new());
        let orch = orchestrator(store.clone()).with_max_concurrency(4);

        let items = (1..=10).map(|i| (format!("E-{}", i), json!({ "n": i })));
        let outcome = orch
            .run_batch("m1", "issue", items, |entity_id, args| async move {
                let n = args["n"].as_i64().unwrap_or_default();
                if n % 3 == 0 {
                    Err(MigrationError::validation(format!("{} rejected", entity_id)))
                } else {
                    Ok(n * 10)
                }
            })
            .await;

        assert_eq!(outcome.len(), 10);
        assert_eq!(outcome.failed.len(), 3);
        assert_eq!(outcome.completed["E-2"], 20);
        assert!(outcome.failed["E-9"].contains("E-9 rejected"));

        let summary = orch.summary("m1").await.unwrap();
        assert_eq!(summary.completed, 7);
        assert_eq!(summary.failed, 3);
    }

    #[tokio::test]
    async fn test_resubmit_failed_carries_retry_count() {
        let store = Arc::new(InMemoryStore::new());
        let orch = orchestrator(store.clone());

        let _: Result<()> = orch
            .run("m1", "issue", "E-1", json!({"k": 1}), || async {
                Err(MigrationError::validation("bad"))
            })
            .await;
        assert!(orch.resume("m1", None).await.unwrap().is_empty());

        let reopened = orch.resubmit_failed("m1", None).await.unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened[0].status, CheckpointStatus::Pending);
        assert_eq!(reopened[0].retry_count, 1);

        let pending = orch.resume("m1", Some("issue")).await.unwrap();
        assert_eq!(checkpoint_args(&pending[0]), Some(&json!({"k": 1})));
    }

    #[tokio::test]
    async fn test_retire_requires_complete_run() {
        let store = Arc::new(InMemoryStore::new());
        let orch = orchestrator(store.clone());

        orch.run("m1", "issue", "E-1", Value::Null, || async { Ok(()) })
            .await
            .unwrap();
        let _: Result<()> = orch
            .run("m1", "issue", "E-2", Value::Null, || async {
                Err(MigrationError::validation("bad"))
            })
            .await;

        let err = orch.retire("m1").await.unwrap_err();
        assert!(matches!(err, MigrationError::IncompleteRun { failed: 1, .. }));

        assert_eq!(orch.reset("m1").await.unwrap(), 2);
        assert_eq!(orch.summary("m1").await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_from_config_applies_settings() {
        let mut config = ResilienceConfig::default();
        config.orchestrator.service = "openproject".to_string();
        config.orchestrator.retry_enabled = false;

        let orch = RecoveryOrchestrator::from_config(Arc::new(InMemoryStore::new()), &config);
        assert_eq!(orch.service(), "openproject");
        assert!(orch.worker_id().starts_with("worker-"));
        assert!(orch.retry.is_none());
    }
}
