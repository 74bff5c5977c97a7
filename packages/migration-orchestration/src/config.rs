//! Resilience configuration (YAML v1)
//!
//! ```yaml
//! version: 1
//! retry:
//!   max_attempts: 5
//!   base_delay_ms: 250
//! circuit_breaker:
//!   fail_max: 3
//! batch:
//!   batch_size: 50
//! ```
//!
//! Every section is optional and falls back to its `Default`.

use crate::error::{ErrorCategory, MigrationError, Result};
use migration_storage::{VolatileFields, DEFAULT_VOLATILE_FIELDS};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Retry policy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total invocations, including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    /// Add up to 25% random delay
    pub jitter: bool,
    /// Error categories worth another attempt
    pub retryable: Vec<ErrorCategory>,
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
            jitter: true,
            retryable: vec![ErrorCategory::Transient],
        }
    }
}

/// Circuit breaker settings (shared by every service)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub fail_max: u32,
    /// Time spent open before a trial call is allowed
    pub reset_timeout_ms: u64,
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            fail_max: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

/// Destination lookup settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Upper bound on ids per batched lookup
    pub batch_size: usize,
    /// Timeout applied to each individual network call
    pub call_timeout_ms: u64,
}

impl BatchConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            call_timeout_ms: 30_000,
        }
    }
}

/// Recovery orchestrator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Breaker key used for wrapped operations
    pub service: String,
    /// Wrap operations in the retry policy before the breaker
    pub retry_enabled: bool,
    /// Concurrent entities in `run_batch`
    pub max_concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            service: "destination".to_string(),
            retry_enabled: true,
            max_concurrency: (num_cpus::get() / 2).max(1),
        }
    }
}

/// Snapshot and change detection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreservationConfig {
    /// Fields ignored by checksums and diffs
    pub volatile_fields: Vec<String>,
}

impl PreservationConfig {
    pub fn volatile(&self) -> VolatileFields {
        VolatileFields::new(self.volatile_fields.iter().cloned())
    }
}

impl Default for PreservationConfig {
    fn default() -> Self {
        Self {
            volatile_fields: DEFAULT_VOLATILE_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// Complete resilience configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub batch: BatchConfig,
    pub orchestrator: OrchestratorConfig,
    pub preservation: PreservationConfig,
}

/// On-disk schema: a version tag plus every section
///
/// Sections are listed explicitly so misspelled top-level keys are rejected.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFileV1 {
    version: Option<u32>,
    retry: RetryConfig,
    circuit_breaker: CircuitBreakerConfig,
    batch: BatchConfig,
    orchestrator: OrchestratorConfig,
    preservation: PreservationConfig,
}

impl ConfigFileV1 {
    fn into_config(self) -> ResilienceConfig {
        ResilienceConfig {
            retry: self.retry,
            circuit_breaker: self.circuit_breaker,
            batch: self.batch,
            orchestrator: self.orchestrator,
            preservation: self.preservation,
        }
    }
}

impl ResilienceConfig {
    /// Load and validate a YAML config file
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let file: ConfigFileV1 = serde_yaml::from_str(content)?;

        let version = file.version.ok_or_else(|| {
            MigrationError::config("Missing 'version' field. Add 'version: 1' to the top of the file.")
        })?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(MigrationError::config(format!(
                "Unsupported configuration version {}. Supported versions: {:?}",
                version, SUPPORTED_VERSIONS
            )));
        }

        let config = file.into_config();
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        let file = ConfigFileV1 {
            version: Some(1),
            retry: self.retry.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
            batch: self.batch.clone(),
            orchestrator: self.orchestrator.clone(),
            preservation: self.preservation.clone(),
        };
        Ok(serde_yaml::to_string(&file)?)
    }

    /// Range checks
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(MigrationError::config("retry.max_attempts must be at least 1"));
        }
        if self.retry.exponential_base < 1.0 {
            return Err(MigrationError::config(
                "retry.exponential_base must be >= 1.0",
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(MigrationError::config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms",
            ));
        }
        if self.circuit_breaker.fail_max == 0 {
            return Err(MigrationError::config(
                "circuit_breaker.fail_max must be at least 1",
            ));
        }
        if self.batch.batch_size == 0 {
            return Err(MigrationError::config("batch.batch_size must be at least 1"));
        }
        if self.orchestrator.max_concurrency == 0 {
            return Err(MigrationError::config(
                "orchestrator.max_concurrency must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_validate() {
        let config = ResilienceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.circuit_breaker.fail_max, 5);
        assert!(config.orchestrator.max_concurrency >= 1);
    }

    #[test]
    fn test_yaml_partial_override() {
        let yaml = r#"
version: 1
retry:
  max_attempts: 5
  jitter: false
circuit_breaker:
  fail_max: 2
  reset_timeout_ms: 1000
batch:
  batch_size: 25
"#;
        let config = ResilienceConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.retry.max_attempts, 5);
        assert!(!config.retry.jitter);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.circuit_breaker.reset_timeout(), Duration::from_secs(1));
        assert_eq!(config.batch.batch_size, 25);
        assert_eq!(config.orchestrator.service, "destination");
    }

    #[test]
    fn test_yaml_file_loading() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"version: 1\norchestrator:\n  service: openproject\n")
            .unwrap();

        let config = ResilienceConfig::from_yaml(file.path()).unwrap();
        assert_eq!(config.orchestrator.service, "openproject");
    }

    #[test]
    fn test_yaml_missing_version() {
        let result = ResilienceConfig::from_yaml_str("retry:\n  max_attempts: 2\n");
        assert!(matches!(result, Err(MigrationError::Config(_))));
    }

    #[test]
    fn test_yaml_unsupported_version() {
        let err = ResilienceConfig::from_yaml_str("version: 2\n").unwrap_err();
        assert!(err.to_string().contains("Unsupported configuration version 2"));
    }

    #[test]
    fn test_yaml_rejects_invalid_range() {
        let result = ResilienceConfig::from_yaml_str("version: 1\nbatch:\n  batch_size: 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_yaml_rejects_unknown_field() {
        let result = ResilienceConfig::from_yaml_str("version: 1\nretry:\n  attempts: 2\n");
        assert!(matches!(result, Err(MigrationError::Yaml(_))));
    }

    #[test]
    fn test_yaml_rejects_misspelled_section() {
        let result = ResilienceConfig::from_yaml_str("version: 1\nretyr:\n  max_attempts: 2\n");
        assert!(matches!(result, Err(MigrationError::Yaml(_))));

        let result = ResilienceConfig::from_yaml_str("version: 1\ncircuit_breakers:\n  fail_max: 1\n");
        assert!(matches!(result, Err(MigrationError::Yaml(_))));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = ResilienceConfig::default();
        let yaml = config.to_yaml().unwrap();

        assert!(yaml.contains("version: 1"));
        assert_eq!(ResilienceConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn test_retryable_categories_parse() {
        let yaml = "version: 1\nretry:\n  retryable: [transient, infrastructure]\n";
        let config = ResilienceConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(
            config.retry.retryable,
            vec![ErrorCategory::Transient, ErrorCategory::Infrastructure]
        );
    }
}
