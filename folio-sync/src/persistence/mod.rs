//! Local persistence: durable mirror of document state for offline start.
//!
//! ```text
//!   coordinator ──save(doc, record)──► lock(doc) ─► merge with stored ─► write
//!               ◄─load(doc)──────────  lock(doc) ─► read
//!               ◄─synced()───────────  fires once after startup catch-up
//! ```
//!
//! `save` never overwrites blindly: the incoming record is merged with the
//! stored one (CRDT merge of the states, union of applied IDs), so a late or
//! reordered write cannot move the stored document backwards.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::doc::{merge_states, DocError};
use crate::message::MessageId;

pub use memory::MemoryPersistence;
pub use rocks::{RecordMetadata, RocksPersistence, StoreConfig};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Document not found: {0}")]
    NotFound(Uuid),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Stored state could not be merged: {0}")]
    Crdt(String),
}

impl From<DocError> for PersistenceError {
    fn from(e: DocError) -> Self {
        PersistenceError::Crdt(e.to_string())
    }
}

/// What is kept locally for one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    /// Merged document state (v1 update)
    pub state: Vec<u8>,
    /// Update message IDs already folded into `state`
    pub applied: BTreeSet<MessageId>,
    /// Newest transport message seen; history loading stops here
    pub last_message_id: Option<MessageId>,
    /// Reference of the newest snapshot applied
    pub snapshot_ref: Option<MessageId>,
    /// Local updates not yet accepted by the transport
    pub outbox: Vec<Vec<u8>>,
    /// Writer's save counter; orders cursor fields and outbox across writes
    #[serde(default)]
    pub seq: u64,
}

impl PersistedRecord {
    /// Combine a stored record with a newer write.
    ///
    /// States are CRDT-merged and applied IDs unioned. Cursor fields and the
    /// outbox come from whichever record has the higher `seq` (`incoming`
    /// on a tie), so a write that lands late cannot bring back flushed
    /// outbox entries or move the checkpoint backwards.
    pub fn merged_with(&self, incoming: &PersistedRecord) -> Result<Self, PersistenceError> {
        let states: Vec<&[u8]> = [self.state.as_slice(), incoming.state.as_slice()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
        let state = match states.len() {
            0 => Vec::new(),
            1 => states[0].to_vec(),
            _ => merge_states(&states)?,
        };

        let mut applied = self.applied.clone();
        applied.extend(incoming.applied.iter().cloned());

        let (newer, older) = if incoming.seq >= self.seq {
            (incoming, self)
        } else {
            (self, incoming)
        };
        Ok(Self {
            state,
            applied,
            last_message_id: newer
                .last_message_id
                .clone()
                .or_else(|| older.last_message_id.clone()),
            snapshot_ref: newer
                .snapshot_ref
                .clone()
                .or_else(|| older.snapshot_ref.clone()),
            outbox: newer.outbox.clone(),
            seq: newer.seq,
        })
    }
}

/// Fires once when an adapter has caught up with its stored history.
#[derive(Clone)]
pub struct SyncedSignal {
    rx: watch::Receiver<bool>,
}

impl SyncedSignal {
    pub fn is_synced(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until synced. Returns `false` if the adapter went away first.
    pub async fn wait(&self) -> bool {
        let mut rx = self.rx.clone();
        let synced = rx.wait_for(|synced| *synced).await.is_ok();
        synced
    }
}

/// Sending half of [`SyncedSignal`].
pub struct SyncedNotifier {
    tx: watch::Sender<bool>,
}

impl SyncedNotifier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> SyncedSignal {
        SyncedSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Mark as synced. Returns `true` only on the first call.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|synced| {
            if *synced {
                false
            } else {
                *synced = true;
                true
            }
        })
    }
}

impl Default for SyncedNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-document locks serializing `load`/`save`.
#[derive(Default)]
pub struct DocLocks {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl DocLocks {
    pub async fn acquire(&self, doc_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(doc_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[async_trait]
pub trait LocalPersistence: Send + Sync {
    async fn load(&self, doc_id: Uuid) -> Result<Option<PersistedRecord>, PersistenceError>;

    /// Merge `record` into whatever is stored for `doc_id`.
    async fn save(&self, doc_id: Uuid, record: &PersistedRecord) -> Result<(), PersistenceError>;

    fn synced(&self) -> SyncedSignal;
}
