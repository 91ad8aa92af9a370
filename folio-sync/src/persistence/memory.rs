//! In-memory persistence adapter.
//!
//! Survives coordinator restarts within one process (share it through an
//! `Arc`), not process restarts.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DocLocks, LocalPersistence, PersistedRecord, PersistenceError, SyncedNotifier, SyncedSignal};

pub struct MemoryPersistence {
    records: RwLock<HashMap<Uuid, PersistedRecord>>,
    locks: DocLocks,
    notifier: SyncedNotifier,
}

impl MemoryPersistence {
    /// Empty store, synced immediately.
    pub fn new() -> Self {
        let store = Self::unsynced();
        store.notifier.fire();
        store
    }

    /// Empty store whose synced signal waits for [`mark_synced`](Self::mark_synced).
    pub fn unsynced() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            locks: DocLocks::default(),
            notifier: SyncedNotifier::new(),
        }
    }

    pub fn mark_synced(&self) -> bool {
        self.notifier.fire()
    }

    pub async fn document_count(&self) -> usize {
        self.records.read().await.len()
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalPersistence for MemoryPersistence {
    async fn load(&self, doc_id: Uuid) -> Result<Option<PersistedRecord>, PersistenceError> {
        let _guard = self.locks.acquire(doc_id).await;
        Ok(self.records.read().await.get(&doc_id).cloned())
    }

    async fn save(&self, doc_id: Uuid, record: &PersistedRecord) -> Result<(), PersistenceError> {
        let _guard = self.locks.acquire(doc_id).await;
        let merged = match self.records.read().await.get(&doc_id) {
            Some(stored) => stored.merged_with(record)?,
            None => record.clone(),
        };
        log::debug!(
            "Saved {doc_id}: {} bytes, {} applied",
            merged.state.len(),
            merged.applied.len()
        );
        self.records.write().await.insert(doc_id, merged);
        Ok(())
    }

    fn synced(&self) -> SyncedSignal {
        self.notifier.signal()
    }
}
