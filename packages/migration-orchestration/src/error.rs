use migration_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MigrationError>;

#[derive(Error, Debug)]
pub enum MigrationError {
    /// Network failure or timeout talking to a tracker
    #[error("Transient error: {0}")]
    Transient(String),

    /// Destination rejected the payload; retrying cannot help
    #[error("Validation rejected: {0}")]
    Validation(String),

    /// Fast-fail while the breaker for `service` is open
    #[error("Circuit open for service '{service}'")]
    CircuitOpen { service: String },

    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<MigrationError>,
    },

    /// Checkpoint or snapshot persistence failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Migration {migration_id} is incomplete: {pending} pending, {failed} failed")]
    IncompleteRun {
        migration_id: String,
        pending: usize,
        failed: usize,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MigrationError {
    pub fn transient<E: std::fmt::Display>(e: E) -> Self {
        Self::Transient(e.to_string())
    }

    pub fn validation<E: std::fmt::Display>(e: E) -> Self {
        Self::Validation(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    /// Retry/breaker classification
    pub fn category(&self) -> ErrorCategory {
        match self {
            MigrationError::Transient(_) | MigrationError::Timeout(_) => ErrorCategory::Transient,
            MigrationError::Validation(_)
            | MigrationError::Config(_)
            | MigrationError::Yaml(_)
            | MigrationError::IncompleteRun { .. } => ErrorCategory::Permanent,
            MigrationError::CircuitOpen { .. }
            | MigrationError::Storage(_)
            | MigrationError::Io(_) => ErrorCategory::Infrastructure,
            MigrationError::RetriesExhausted { source, .. } => source.category(),
            // Collaborator errors of unknown shape are retried
            MigrationError::Other(_) => ErrorCategory::Transient,
        }
    }

    /// Counts as a dependency failure for circuit breaking
    pub fn trips_breaker(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, MigrationError::CircuitOpen { .. })
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Transient error - retry automatically (e.g., timeout, connection)
    Transient,
    /// Permanent error - don't retry (e.g., rejected payload)
    Permanent,
    /// Infrastructure error - alert ops (e.g., ledger unavailable)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(MigrationError::config(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
