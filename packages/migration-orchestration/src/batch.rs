//! Collaborator ports and batched destination lookups

use crate::config::BatchConfig;
use crate::error::{MigrationError, Result};
use crate::preservation::FieldChanges;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Destination tracker accessor
#[async_trait]
pub trait DestinationClient: Send + Sync {
    /// Records by numeric id; missing ids are absent from the map
    async fn fetch_by_ids(&self, entity_type: &str, ids: &[i64]) -> Result<HashMap<i64, Value>>;

    /// Records by alternate key (login, email, identifier, ...)
    async fn fetch_by_keys(
        &self,
        entity_type: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Value>>;

    /// Single record by id or alternate key
    async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Value>>;

    async fn create(&self, entity_type: &str, data: &Value) -> Result<Value>;

    async fn update(&self, entity_type: &str, id: &str, data: &Value) -> Result<Value>;
}

/// Upstream change feed
#[async_trait]
pub trait SourceChangeFeed: Send + Sync {
    /// Changed fields per entity key; unchanged keys may be omitted
    async fn changes(
        &self,
        entity_type: &str,
        keys: &[String],
    ) -> Result<BTreeMap<String, FieldChanges>>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    /// Found records keyed by the id as requested
    pub records: BTreeMap<String, Value>,
    /// Ids whose lookup failed, with the error message
    pub failed: BTreeMap<String, String>,
}

pub struct BatchFetcher {
    client: Arc<dyn DestinationClient>,
    batch_size: usize,
    call_timeout: Duration,
}

impl BatchFetcher {
    pub fn new(client: Arc<dyn DestinationClient>, config: &BatchConfig) -> Self {
        Self {
            client,
            batch_size: config.batch_size.max(1),
            call_timeout: config.call_timeout(),
        }
    }

    pub fn client(&self) -> &Arc<dyn DestinationClient> {
        &self.client
    }

    async fn timed<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(MigrationError::Timeout(format!(
                "{} exceeded {}ms",
                what,
                self.call_timeout.as_millis()
            ))),
        }
    }

    /// Look up many ids with batched calls
    ///
    /// Numeric ids and alternate keys are batched separately. A failed batch
    /// call falls back to per-id lookups for that chunk.
    pub async fn fetch_many(&self, entity_ids: &[String], entity_type: &str) -> FetchOutcome {
        let (numeric, keys): (Vec<&String>, Vec<&String>) = entity_ids
            .iter()
            .partition(|id| id.parse::<i64>().is_ok());

        let mut outcome = FetchOutcome::default();

        for chunk in numeric.chunks(self.batch_size) {
            let parsed: Vec<(i64, &String)> = chunk
                .iter()
                .filter_map(|id| id.parse::<i64>().ok().map(|n| (n, *id)))
                .collect();
            let ids: Vec<i64> = parsed.iter().map(|(n, _)| *n).collect();

            match self
                .timed("fetch_by_ids", self.client.fetch_by_ids(entity_type, &ids))
                .await
            {
                Ok(found) => {
                    // "01" and "1" name the same record
                    for (n, original) in parsed {
                        if let Some(record) = found.get(&n) {
                            outcome.records.insert(original.clone(), record.clone());
                        }
                    }
                }
                Err(e) => {
                    warn!(entity_type, chunk = chunk.len(), error = %e, "Batch lookup by id failed, falling back");
                    let originals: Vec<String> = chunk.iter().map(|id| (*id).clone()).collect();
                    self.fetch_each(&originals, entity_type, &mut outcome).await;
                }
            }
        }

        for chunk in keys.chunks(self.batch_size) {
            let originals: Vec<String> = chunk.iter().map(|id| (*id).clone()).collect();

            match self
                .timed("fetch_by_keys", self.client.fetch_by_keys(entity_type, &originals))
                .await
            {
                Ok(mut found) => {
                    for key in originals {
                        if let Some(record) = found.remove(&key) {
                            outcome.records.insert(key, record);
                        }
                    }
                }
                Err(e) => {
                    warn!(entity_type, chunk = chunk.len(), error = %e, "Batch lookup by key failed, falling back");
                    self.fetch_each(&originals, entity_type, &mut outcome).await;
                }
            }
        }

        debug!(
            entity_type,
            requested = entity_ids.len(),
            found = outcome.records.len(),
            failed = outcome.failed.len(),
            "Batch fetch complete"
        );
        outcome
    }

    /// One lookup per id
    pub async fn fetch_one_by_one(&self, entity_ids: &[String], entity_type: &str) -> FetchOutcome {
        let mut outcome = FetchOutcome::default();
        self.fetch_each(entity_ids, entity_type, &mut outcome).await;
        outcome
    }

    async fn fetch_each(&self, entity_ids: &[String], entity_type: &str, outcome: &mut FetchOutcome) {
        for id in entity_ids {
            match self.timed("get", self.client.get(entity_type, id)).await {
                Ok(Some(record)) => {
                    outcome.records.insert(id.clone(), record);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(entity_type, entity_id = %id, error = %e, "Lookup failed");
                    outcome.failed.insert(id.clone(), e.to_string());
                }
            }
        }
    }
}
