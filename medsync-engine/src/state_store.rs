//! Key/value persistence capability
//!
//! The engine never talks to a storage backend directly. Hosts inject a
//! [`StateStore`] (in-memory for tests, SQLite via
//! [`crate::local_db::SqliteStateStore`], or their own platform store).

use crate::error::SyncResult;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Logical persisted keys
pub mod keys {
    /// Pending changes, watermark, synced records and failed syncs
    pub const SYNC_STATE: &str = "sync_state";
    /// Bounded list of audit entries
    pub const AUDIT_TRAIL: &str = "audit_trail";
    /// Conflicts awaiting user choice
    pub const PENDING_CONFLICTS: &str = "pending_conflicts";
}

/// Opaque byte storage keyed by string
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> SyncResult<()>;

    async fn remove(&self, key: &str) -> SyncResult<()>;
}

/// Process-local store, lost on restart
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> SyncResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> SyncResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
