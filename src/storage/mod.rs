//! Durable key-value storage port
//!
//! The history store only needs `get`/`set`/`remove` by key, so every backend
//! implements this small synchronous trait. Backends:
//! - [`MemoryStore`]: in-process map, used by tests and ephemeral sessions
//! - [`SqliteStore`]: single-table SQLite database
//! - [`FileStore`]: one JSON document per key, written atomically

pub mod file;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::config::{HistoryConfig, StorageBackend};

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLite failure
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Key cannot be mapped onto the backend
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    /// Backend state is unusable (e.g. a poisoned lock)
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Synchronous durable key-value storage
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete `key`; deleting a missing key is not an error
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Backend name for logs
    fn name(&self) -> &str;
}

/// Open the backend selected in the history configuration
pub fn open(config: &HistoryConfig) -> Result<Arc<dyn KeyValueStore>, StorageError> {
    let store: Arc<dyn KeyValueStore> = match config.backend {
        StorageBackend::Sqlite => Arc::new(SqliteStore::open(&config.path)?),
        StorageBackend::File => Arc::new(FileStore::open(&config.path)?),
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
    };
    debug!(backend = store.name(), path = %config.path.display(), "Opened history storage");
    Ok(store)
}
