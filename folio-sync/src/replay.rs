//! Replay log: the latest snapshot plus the updates received after it.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  ReplayLog                   │
//! │                                              │
//! │  Snapshot ◄── update ◄── update ◄── update   │
//! │  (ref=m7)     m8 (LZ4)   m9 (LZ4)   m10      │
//! │                                              │
//! │  subsume(snapshot, covered=2): drop m8, m9   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Updates are kept in the order this client applied them and
//! LZ4-compressed while they wait for the next compaction. That order is not
//! channel order (a local publish can land before a remote update that was
//! sent earlier), so the log never infers snapshot coverage from IDs; the
//! caller says how many of the oldest updates a snapshot folded in.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::message::MessageId;

/// Full document state tagged with the channel position it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Encoded document state (a single v1 update)
    pub state: Vec<u8>,
    /// Every update at or before this message is folded into `state`
    pub last_update_id: Option<MessageId>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    #[error("Decompression failed for {id}: {reason}")]
    DecompressionFailed { id: MessageId, reason: String },
}

/// A compressed update waiting for compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedUpdate {
    /// Transport message that carried the update
    pub id: MessageId,
    /// Uncompressed size in bytes
    pub original_size: u64,
    /// LZ4 payload (size-prepended)
    pub compressed: Vec<u8>,
}

impl CompressedUpdate {
    pub fn compress(id: MessageId, data: &[u8]) -> Self {
        Self {
            id,
            original_size: data.len() as u64,
            compressed: lz4_flex::compress_prepend_size(data),
        }
    }

    pub fn decompress(&self) -> Result<Vec<u8>, ReplayError> {
        lz4_flex::decompress_size_prepended(&self.compressed).map_err(|e| {
            ReplayError::DecompressionFailed {
                id: self.id.clone(),
                reason: e.to_string(),
            }
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayStats {
    /// Updates held since the base snapshot
    pub pending_updates: usize,
    pub total_original_bytes: u64,
    pub total_compressed_bytes: u64,
    /// Reference of the base snapshot, if any
    pub base_ref: Option<MessageId>,
}

impl ReplayStats {
    pub fn compression_ratio(&self) -> f64 {
        if self.total_compressed_bytes == 0 {
            return 0.0;
        }
        self.total_original_bytes as f64 / self.total_compressed_bytes as f64
    }
}

/// Snapshot base plus pending updates for one document.
pub struct ReplayLog {
    base: Option<Snapshot>,
    updates: Vec<CompressedUpdate>,
    ids: HashSet<MessageId>,
    /// Pending updates that trigger compaction (0 = never)
    compaction_threshold: usize,
}

impl ReplayLog {
    pub fn new(compaction_threshold: usize) -> Self {
        Self {
            base: None,
            updates: Vec::new(),
            ids: HashSet::new(),
            compaction_threshold,
        }
    }

    /// Record an update in delivery order.
    ///
    /// An ID already in the log is ignored. Returns `true` when the caller
    /// should compact.
    pub fn append(&mut self, id: MessageId, update: &[u8]) -> bool {
        if self.ids.insert(id.clone()) {
            self.updates.push(CompressedUpdate::compress(id, update));
        }
        self.needs_compaction()
    }

    pub fn needs_compaction(&self) -> bool {
        self.compaction_threshold > 0 && self.updates.len() >= self.compaction_threshold
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Install `snapshot` as the new base and drop the `covered` oldest
    /// updates, which the snapshot state already contains.
    ///
    /// Returns the number of updates dropped.
    pub fn subsume(&mut self, snapshot: Snapshot, covered: usize) -> usize {
        let cut = covered.min(self.updates.len());
        for dropped in self.updates.drain(..cut) {
            self.ids.remove(&dropped.id);
        }
        self.base = Some(snapshot);
        cut
    }

    pub fn base(&self) -> Option<&Snapshot> {
        self.base.as_ref()
    }

    /// ID of the newest update held, falling back to the base reference.
    pub fn last_update_id(&self) -> Option<&MessageId> {
        self.updates
            .last()
            .map(|u| &u.id)
            .or_else(|| self.base.as_ref().and_then(|s| s.last_update_id.as_ref()))
    }

    pub fn pending_count(&self) -> usize {
        self.updates.len()
    }

    /// Decompress all pending updates, oldest first.
    pub fn updates(&self) -> Result<Vec<(MessageId, Vec<u8>)>, ReplayError> {
        self.updates
            .iter()
            .map(|u| Ok((u.id.clone(), u.decompress()?)))
            .collect()
    }

    pub fn stats(&self) -> ReplayStats {
        let mut stats = ReplayStats {
            pending_updates: self.updates.len(),
            base_ref: self.base.as_ref().and_then(|s| s.last_update_id.clone()),
            ..Default::default()
        };
        for u in &self.updates {
            stats.total_original_bytes += u.original_size;
            stats.total_compressed_bytes += u.compressed.len() as u64;
        }
        stats
    }
}
