//! # folio-sync — CRDT document sync over a messaging channel
//!
//! Keeps a Yrs document in sync across peers that share nothing but an
//! ordered, append-only message channel, with a local copy for fast and
//! offline startup.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   publish / subscribe   ┌──────────────────┐
//! │ SharedDoc   │ ◄─────────────────────► │ Transport        │
//! │ (Yrs Doc)   │                         │ (channel log)    │
//! └──────┬──────┘                         └────────┬─────────┘
//!        │                                         │
//!        ▼                                         ▼
//! ┌─────────────────────┐  classify/decode ┌──────────────────┐
//! │ RoomSyncCoordinator │ ◄─────────────── │ Classifier+Codec │
//! │ (one per room)      │                  └──────────────────┘
//! └──┬───────────────┬──┘
//!    │               │
//!    ▼               ▼
//! ┌──────────┐  ┌───────────────────┐
//! │ Local    │  │ ReplayLog +       │
//! │ storage  │  │ Snapshot compactor│
//! └──────────┘  └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`] — Text encoding of updates and snapshots
//! - [`classify`] — Recognize sync messages among ordinary channel traffic
//! - [`persistence`] — Local document store (in-memory and RocksDB)
//! - [`compactor`] — Fold updates into snapshots
//! - [`coordinator`] — Per-room lifecycle, history replay, live sync
//! - [`transport`] — Messaging seam and an in-process hub

pub mod classify;
pub mod codec;
pub mod compactor;
pub mod config;
pub mod coordinator;
pub mod doc;
pub mod message;
pub mod outbox;
pub mod persistence;
pub mod replay;
pub mod retry;
pub mod transport;

// Re-exports for convenience
pub use classify::{Classified, Classifier, MessageKind, Section};
pub use codec::{CodecError, SnapshotPayload};
pub use compactor::{compact, compact_through, CompactionError};
pub use config::{ClassifierMode, RetryConfig, SyncConfig};
pub use coordinator::{RoomSyncCoordinator, SyncError, SyncState, SyncStats};
pub use doc::{merge_states, validate_update, DocError, SharedDoc};
pub use message::{
    ChannelId, MessageBody, MessageId, TransportMessage, GENERIC_MESSAGE_TYPE,
    SNAPSHOT_MESSAGE_TYPE, SNAPSHOT_PREFIX, UPDATE_MESSAGE_TYPE, UPDATE_PREFIX,
};
pub use outbox::OfflineQueue;
pub use persistence::{
    LocalPersistence, MemoryPersistence, PersistedRecord, PersistenceError, RecordMetadata,
    RocksPersistence, StoreConfig, SyncedSignal,
};
pub use replay::{ReplayLog, ReplayStats, Snapshot};
pub use retry::{retry_with_backoff, Backoff};
pub use transport::{
    HistoryPage, MemoryHub, MemoryTransport, SubscriptionEvent, Transport, TransportError,
    TransportSubscription,
};
