//! Infrastructure layer - Storage adapters
//!
//! - `InMemoryStore`: process-local maps (tests, dry runs)
//! - `SqliteStore`: durable file-backed ledger

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
