//! Room sync coordinator.
//!
//! Binds one in-memory document to one transport channel and one local
//! persistence record.
//!
//! ```text
//!  Uninitialized ──initialize()──► LoadingHistory ──history applied──► Live
//!        ▲                              │                               │
//!        └──── transport unreachable ───┘                          dispose()
//!              and no local state                                    │
//!                                                                     ▼
//!                                                                 Disposed
//! ```
//!
//! Loading restores the local record, then pages history backward from the
//! newest message until it reaches the local checkpoint, the reference of
//! the newest valid snapshot, or the start of the channel. The snapshot is
//! applied first, then every update after the cut in delivery order.
//!
//! While live, a single task owns the inbound subscription and the local
//! update observer:
//!
//! ```text
//!   transport ──► classify ──► decode ──► apply ──► persist ──► maybe compact
//!   local edit ──► encode ──► publish (or outbox while offline) ──► persist
//! ```
//!
//! Compaction runs in its own task on a copy of the replay log and never
//! blocks either path. A snapshot is tagged with the checkpoint, the newest
//! message up to which this client has seen the channel without holes, not
//! with the last update it happened to apply. While the subscription has
//! reported a gap the checkpoint is frozen and no snapshot is published
//! until the gap is filled from history.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;
use yrs::TransactionMut;

use crate::classify::{Classified, Classifier, MessageKind, Section};
use crate::codec::{self, CodecError};
use crate::compactor::{self, CompactionError};
use crate::config::SyncConfig;
use crate::doc::{validate_update, DocError, SharedDoc};
use crate::message::{ChannelId, MessageId, TransportMessage};
use crate::outbox::OfflineQueue;
use crate::persistence::{LocalPersistence, PersistedRecord, PersistenceError};
use crate::replay::{ReplayError, ReplayLog, Snapshot};
use crate::retry::retry_with_backoff;
use crate::transport::{SubscriptionEvent, Transport, TransportError, TransportSubscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Uninitialized,
    LoadingHistory,
    Live,
    Disposed,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("Transport error: {0}")]
    Transport(TransportError),
    #[error("Coordinator already disposed")]
    AlreadyDisposed,
    #[error("Compaction failed: {0}")]
    CompactionFailed(String),
    #[error("Invalid state: expected {expected:?}, found {actual:?}")]
    InvalidState {
        expected: SyncState,
        actual: SyncState,
    },
    #[error("Local update observer already taken")]
    ObserverTaken,
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Crdt(#[from] DocError),
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unavailable(reason) => SyncError::TransportUnavailable(reason),
            other => SyncError::Transport(other),
        }
    }
}

impl From<CodecError> for SyncError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::CorruptPayload(reason) => SyncError::CorruptPayload(reason),
        }
    }
}

impl From<CompactionError> for SyncError {
    fn from(e: CompactionError) -> Self {
        SyncError::CompactionFailed(e.to_string())
    }
}

impl From<ReplayError> for SyncError {
    fn from(e: ReplayError) -> Self {
        SyncError::CompactionFailed(e.to_string())
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub updates_applied: u64,
    pub snapshots_applied: u64,
    pub skipped_corrupt: u64,
    pub updates_published: u64,
    pub snapshots_published: u64,
    /// Local updates waiting in the outbox
    pub queued_offline: usize,
    /// Updates held since the last snapshot
    pub pending_since_snapshot: usize,
    pub online: bool,
    /// Newest message with no undelivered message before it
    pub checkpoint: Option<MessageId>,
}

#[derive(Default)]
struct AtomicSyncStats {
    updates_applied: AtomicU64,
    snapshots_applied: AtomicU64,
    skipped_corrupt: AtomicU64,
    updates_published: AtomicU64,
    snapshots_published: AtomicU64,
}

/// Mutable sync bookkeeping, guarded as one unit.
struct Session {
    applied: BTreeSet<MessageId>,
    seen_snapshots: HashSet<MessageId>,
    last_message_id: Option<MessageId>,
    snapshot_ref: Option<MessageId>,
    replay: ReplayLog,
    outbox: OfflineQueue,
    online: bool,
    /// Subscription lost messages after `last_message_id`
    gap: bool,
    save_seq: u64,
}

impl Session {
    /// Position a snapshot may claim to cover.
    fn frontier(&self) -> Option<MessageId> {
        if self.gap {
            None
        } else {
            self.last_message_id.clone()
        }
    }
}

/// Result of paging history backward.
struct HistoryScan {
    /// Newest valid snapshot, with the ID of the message that carried it
    snapshot: Option<(MessageId, Snapshot)>,
    /// Messages after the cut point, oldest first
    messages: Vec<TransportMessage>,
    newest: Option<MessageId>,
    pages: usize,
}

enum Command {
    Attach(TransportSubscription),
}

struct LiveHandle {
    commands: mpsc::UnboundedSender<Command>,
    join: JoinHandle<()>,
}

struct Shared {
    doc_id: Uuid,
    channel: ChannelId,
    doc: SharedDoc,
    transport: Arc<dyn Transport>,
    persistence: Arc<dyn LocalPersistence>,
    config: SyncConfig,
    classifier: Classifier,
    state: RwLock<SyncState>,
    session: Mutex<Session>,
    stats: AtomicSyncStats,
    compacting: AtomicBool,
    cancel: watch::Sender<bool>,
}

/// Keeps one document in sync with one transport channel.
pub struct RoomSyncCoordinator {
    shared: Arc<Shared>,
    live: Mutex<Option<LiveHandle>>,
    local_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl RoomSyncCoordinator {
    pub fn new(
        doc_id: Uuid,
        channel: ChannelId,
        doc: SharedDoc,
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn LocalPersistence>,
        config: SyncConfig,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        let session = Session {
            applied: BTreeSet::new(),
            seen_snapshots: HashSet::new(),
            last_message_id: None,
            snapshot_ref: None,
            replay: ReplayLog::new(config.snapshot_interval_updates),
            outbox: OfflineQueue::new(config.offline_queue_capacity),
            online: true,
            gap: false,
            save_seq: 0,
        };
        Self {
            shared: Arc::new(Shared {
                doc_id,
                channel,
                doc,
                transport,
                persistence,
                classifier: Classifier::new(config.classifier),
                config,
                state: RwLock::new(SyncState::Uninitialized),
                session: Mutex::new(session),
                stats: AtomicSyncStats::default(),
                compacting: AtomicBool::new(false),
                cancel,
            }),
            live: Mutex::new(None),
            local_rx: Mutex::new(None),
        }
    }

    pub fn doc(&self) -> &SharedDoc {
        &self.shared.doc
    }

    pub fn doc_id(&self) -> Uuid {
        self.shared.doc_id
    }

    pub fn channel(&self) -> &ChannelId {
        &self.shared.channel
    }

    pub async fn state(&self) -> SyncState {
        *self.shared.state.read().await
    }

    /// Load local state and history, subscribe, and go live.
    ///
    /// Falls back to offline operation when the transport cannot be reached
    /// but a local record exists. Without one, returns
    /// `TransportUnavailable` and the coordinator can be initialized again.
    pub async fn initialize(&self) -> Result<(), SyncError> {
        self.shared.begin_loading().await?;

        {
            let mut slot = self.local_rx.lock().await;
            if slot.is_none() {
                *slot = self.shared.doc.observe_local().await;
            }
            if slot.is_none() {
                self.shared.abort_loading().await;
                return Err(SyncError::ObserverTaken);
            }
        }

        let mut cancel = self.shared.cancel.subscribe();
        let loaded = tokio::select! {
            loaded = self.shared.load() => loaded,
            _ = cancelled(&mut cancel) => Err(SyncError::AlreadyDisposed),
        };
        let subscription = match loaded {
            Ok(subscription) => subscription,
            Err(e) => {
                self.shared.abort_loading().await;
                return Err(e);
            }
        };

        {
            let mut state = self.shared.state.write().await;
            if *state != SyncState::LoadingHistory {
                return Err(SyncError::AlreadyDisposed);
            }
            let local = self
                .local_rx
                .lock()
                .await
                .take()
                .ok_or(SyncError::ObserverTaken)?;
            let (commands, command_rx) = mpsc::unbounded_channel();
            let join = tokio::spawn(run_live(
                self.shared.clone(),
                subscription,
                local,
                command_rx,
                self.shared.cancel.subscribe(),
            ));
            *self.live.lock().await = Some(LiveHandle { commands, join });
            *state = SyncState::Live;
        }

        let online = self.shared.session.lock().await.online;
        log::info!(
            "{}: live ({})",
            self.shared.channel,
            if online { "online" } else { "offline" }
        );
        if online {
            if let Err(e) = self.shared.flush_outbox().await {
                log::warn!("{}: could not flush outbox: {e}", self.shared.channel);
            }
        }
        self.shared.maybe_compact();
        Ok(())
    }

    /// Apply a local mutation. It is published by the live loop.
    pub async fn edit<F, R>(&self, f: F) -> Result<R, SyncError>
    where
        F: FnOnce(&mut TransactionMut) -> R,
    {
        self.shared.ensure_not_disposed().await?;
        let (result, _) = self.shared.doc.edit(f);
        Ok(result)
    }

    /// Set `key` in the root map `map`.
    pub async fn set_key(&self, map: &str, key: &str, value: &str) -> Result<(), SyncError> {
        self.shared.ensure_not_disposed().await?;
        self.shared.doc.set_key(map, key, value);
        Ok(())
    }

    /// Catch up after connectivity returns.
    ///
    /// Fetches history newer than the local checkpoint, attaches a fresh
    /// subscription and publishes the outbox.
    pub async fn reconnect(&self) -> Result<(), SyncError> {
        self.shared.ensure_live().await?;
        let shared = &self.shared;
        let transport = &shared.transport;
        let channel = &shared.channel;

        let subscription = retry_with_backoff(&shared.config.retry, "subscribe", move || {
            transport.subscribe(channel)
        })
        .await?;
        let checkpoint = shared.session.lock().await.last_message_id.clone();
        let scan = shared.scan_history(checkpoint).await?;
        let caught_up = shared.apply_history(scan).await;

        shared.session.lock().await.online = true;
        if let Some(live) = self.live.lock().await.as_ref() {
            if live.commands.send(Command::Attach(subscription)).is_err() {
                log::warn!("{channel}: live loop gone, subscription dropped");
            }
        }
        shared.persist().await;

        let flushed = shared.flush_outbox().await?;
        log::info!("{channel}: reconnected ({caught_up} updates caught up, {flushed} queued sent)");
        shared.maybe_compact();
        Ok(())
    }

    /// Compact and publish a snapshot now, regardless of the threshold.
    pub async fn compact_now(&self) -> Result<MessageId, SyncError> {
        self.shared.ensure_live().await?;
        self.shared.compact_and_publish().await
    }

    pub async fn stats(&self) -> SyncStats {
        let s = self.shared.session.lock().await;
        let stats = &self.shared.stats;
        SyncStats {
            updates_applied: stats.updates_applied.load(Ordering::Relaxed),
            snapshots_applied: stats.snapshots_applied.load(Ordering::Relaxed),
            skipped_corrupt: stats.skipped_corrupt.load(Ordering::Relaxed),
            updates_published: stats.updates_published.load(Ordering::Relaxed),
            snapshots_published: stats.snapshots_published.load(Ordering::Relaxed),
            queued_offline: s.outbox.len(),
            pending_since_snapshot: s.replay.pending_count(),
            online: s.online,
            checkpoint: s.last_message_id.clone(),
        }
    }

    /// Stop syncing: cancel pending work, unsubscribe, persist final state.
    ///
    /// A second call returns `AlreadyDisposed`.
    pub async fn dispose(&self) -> Result<(), SyncError> {
        {
            let mut state = self.shared.state.write().await;
            if *state == SyncState::Disposed {
                return Err(SyncError::AlreadyDisposed);
            }
            *state = SyncState::Disposed;
        }
        self.shared.cancel.send_replace(true);

        if let Some(live) = self.live.lock().await.take() {
            drop(live.commands);
            if let Err(e) = live.join.await {
                log::warn!("{}: live loop ended abnormally: {e}", self.shared.channel);
            }
        }
        self.local_rx.lock().await.take();
        self.shared.persist().await;
        log::info!("{}: disposed", self.shared.channel);
        Ok(())
    }
}

impl Drop for RoomSyncCoordinator {
    fn drop(&mut self) {
        self.shared.cancel.send_replace(true);
    }
}

impl Shared {
    async fn begin_loading(&self) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        match *state {
            SyncState::Uninitialized => {
                *state = SyncState::LoadingHistory;
                Ok(())
            }
            SyncState::Disposed => Err(SyncError::AlreadyDisposed),
            actual => Err(SyncError::InvalidState {
                expected: SyncState::Uninitialized,
                actual,
            }),
        }
    }

    async fn abort_loading(&self) {
        let mut state = self.state.write().await;
        if *state == SyncState::LoadingHistory {
            *state = SyncState::Uninitialized;
        }
    }

    async fn ensure_live(&self) -> Result<(), SyncError> {
        match *self.state.read().await {
            SyncState::Live => Ok(()),
            SyncState::Disposed => Err(SyncError::AlreadyDisposed),
            actual => Err(SyncError::InvalidState {
                expected: SyncState::Live,
                actual,
            }),
        }
    }

    async fn ensure_not_disposed(&self) -> Result<(), SyncError> {
        if *self.state.read().await == SyncState::Disposed {
            return Err(SyncError::AlreadyDisposed);
        }
        Ok(())
    }

    /// Restore local state, subscribe and replay history.
    ///
    /// Returns `None` for the subscription when starting offline.
    async fn load(&self) -> Result<Option<TransportSubscription>, SyncError> {
        if !self.persistence.synced().wait().await {
            log::warn!("{}: persistence closed before syncing", self.channel);
        }
        let record = match self.persistence.load(self.doc_id).await {
            Ok(record) => record,
            Err(e) => {
                log::error!("{}: failed to load local state: {e}", self.channel);
                None
            }
        };
        let has_local = match record {
            Some(record) => self.restore(record).await,
            None => false,
        };
        {
            let mut s = self.session.lock().await;
            let reference = s.snapshot_ref.clone();
            self.rebase(&mut s, reference);
        }

        let transport = &self.transport;
        let channel = &self.channel;
        let subscription = match retry_with_backoff(&self.config.retry, "subscribe", move || {
            transport.subscribe(channel)
        })
        .await
        {
            Ok(subscription) => subscription,
            Err(e) => return self.start_offline(has_local, e).await,
        };

        let checkpoint = self.session.lock().await.last_message_id.clone();
        let scan = match self.scan_history(checkpoint).await {
            Ok(scan) => scan,
            Err(e) => return self.start_offline(has_local, e).await,
        };
        let pages = scan.pages;
        let applied = self.apply_history(scan).await;
        log::info!("{}: history loaded ({pages} pages, {applied} updates applied)", self.channel);

        self.persist().await;
        Ok(Some(subscription))
    }

    async fn start_offline(
        &self,
        has_local: bool,
        err: TransportError,
    ) -> Result<Option<TransportSubscription>, SyncError> {
        if has_local && matches!(err, TransportError::Unavailable(_)) {
            log::warn!("{}: {err}; continuing from local state", self.channel);
            self.session.lock().await.online = false;
            Ok(None)
        } else {
            Err(err.into())
        }
    }

    /// Apply a persisted record. Returns whether it was usable.
    async fn restore(&self, record: PersistedRecord) -> bool {
        if !record.state.is_empty() {
            if let Err(e) = self.doc.apply_update(&record.state) {
                log::warn!("{}: ignoring unreadable local state: {e}", self.channel);
                return false;
            }
        }
        let mut s = self.session.lock().await;
        s.applied = record.applied;
        s.last_message_id = record.last_message_id;
        s.snapshot_ref = record.snapshot_ref;
        s.save_seq = record.seq;
        for update in record.outbox {
            s.outbox.enqueue(update);
        }
        log::debug!(
            "{}: restored local state ({} applied, checkpoint {:?})",
            self.channel,
            s.applied.len(),
            s.last_message_id
        );
        true
    }

    /// Page history backward until the checkpoint, the newest snapshot's
    /// reference, or the channel start.
    async fn scan_history(&self, checkpoint: Option<MessageId>) -> Result<HistoryScan, TransportError> {
        let transport = &self.transport;
        let channel = &self.channel;
        let limit = self.config.history_page_size.max(1);

        let mut pages: Vec<Vec<TransportMessage>> = Vec::new();
        let mut positions: HashMap<MessageId, (usize, usize)> = HashMap::new();
        let mut snapshot: Option<(MessageId, Snapshot)> = None;
        let mut cut: Option<(usize, usize)> = None;
        let mut before: Option<MessageId> = None;

        loop {
            let cursor = before.as_ref();
            let page = retry_with_backoff(&self.config.retry, "fetch_history", move || {
                transport.fetch_history(channel, cursor, limit)
            })
            .await?;
            let index = pages.len();

            for (pos, msg) in page.messages.iter().enumerate().rev() {
                if checkpoint.as_ref() == Some(&msg.id) {
                    cut = Some((index, pos));
                    break;
                }
                positions.insert(msg.id.clone(), (index, pos));

                if let Some((_, found)) = &snapshot {
                    if found.last_update_id.as_ref() == Some(&msg.id) {
                        cut = Some((index, pos));
                        break;
                    }
                    continue;
                }
                let Classified::Snapshot(section) = self.classifier.classify(msg) else {
                    continue;
                };
                match decode_valid_snapshot(section) {
                    Ok(found) => {
                        log::debug!("{channel}: found snapshot {} (ref {:?})", msg.id, found.last_update_id);
                        // The reference may sit after the snapshot in delivery order
                        if let Some(at) = found.last_update_id.as_ref().and_then(|r| positions.get(r)) {
                            cut = Some(*at);
                        }
                        snapshot = Some((msg.id.clone(), found));
                        if cut.is_some() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("{channel}: skipping corrupt snapshot {}: {e}", msg.id);
                        self.stats.skipped_corrupt.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            let prev = page.prev_cursor;
            pages.push(page.messages);
            match prev {
                Some(prev) if cut.is_none() => before = Some(prev),
                _ => break,
            }
        }

        let newest = pages.first().and_then(|p| p.last()).map(|m| m.id.clone());
        let page_count = pages.len();
        let mut messages = Vec::new();
        for (index, page) in pages.into_iter().enumerate().rev() {
            for (pos, msg) in page.into_iter().enumerate() {
                if let Some((cut_index, cut_pos)) = cut {
                    if index > cut_index || (index == cut_index && pos <= cut_pos) {
                        continue;
                    }
                }
                messages.push(msg);
            }
        }

        Ok(HistoryScan {
            snapshot,
            messages,
            newest,
            pages: page_count,
        })
    }

    /// Apply a scanned history: snapshot first, then updates in order.
    async fn apply_history(&self, scan: HistoryScan) -> usize {
        let mut s = self.session.lock().await;
        if let Some((id, snapshot)) = scan.snapshot {
            if !s.seen_snapshots.contains(&id) {
                self.apply_snapshot(&mut s, id, snapshot);
            }
        }
        let mut applied = 0;
        for msg in &scan.messages {
            if let Classified::Update(section) = self.classifier.classify(msg) {
                if self.apply_update(&mut s, &msg.id, section) {
                    applied += 1;
                }
            }
        }
        if let Some(newest) = scan.newest {
            s.last_message_id = Some(newest);
        }
        s.gap = false;
        applied
    }

    /// Decode and apply one update. Corrupt input is logged and skipped.
    fn apply_update(&self, s: &mut Session, id: &MessageId, section: Section<'_>) -> bool {
        if s.applied.contains(id) {
            return false;
        }
        let update = match section.decode_update() {
            Ok(update) => update,
            Err(e) => {
                log::warn!("{}: skipping update {id}: {e}", self.channel);
                self.stats.skipped_corrupt.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        if let Err(e) = self.doc.apply_update(&update) {
            log::warn!("{}: skipping update {id}: {e}", self.channel);
            self.stats.skipped_corrupt.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        s.applied.insert(id.clone());
        s.replay.append(id.clone(), &update);
        self.stats.updates_applied.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn apply_snapshot(&self, s: &mut Session, id: MessageId, snapshot: Snapshot) -> bool {
        if let Err(e) = self.doc.apply_update(&snapshot.state) {
            log::warn!("{}: skipping snapshot {id}: {e}", self.channel);
            self.stats.skipped_corrupt.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        log::debug!("{}: applied snapshot {id}", self.channel);
        s.seen_snapshots.insert(id);
        s.snapshot_ref = snapshot.last_update_id.clone();
        self.rebase(s, snapshot.last_update_id);
        self.stats.snapshots_applied.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Make the current document state the replay base.
    fn rebase(&self, s: &mut Session, reference: Option<MessageId>) {
        let covered = s.replay.pending_count();
        s.replay.subsume(
            Snapshot {
                state: self.doc.encode_state_as_update(),
                last_update_id: reference,
            },
            covered,
        );
    }

    async fn handle_inbound(self: &Arc<Self>, msg: TransportMessage) {
        let changed = {
            let mut s = self.session.lock().await;
            if !s.gap {
                s.last_message_id = Some(msg.id.clone());
            }
            match self.classifier.classify(&msg) {
                Classified::Update(section) => self.apply_update(&mut s, &msg.id, section),
                Classified::Snapshot(_) if s.seen_snapshots.contains(&msg.id) => false,
                Classified::Snapshot(section) => match decode_valid_snapshot(section) {
                    Ok(snapshot) => self.apply_snapshot(&mut s, msg.id.clone(), snapshot),
                    Err(e) => {
                        log::warn!("{}: skipping snapshot {}: {e}", self.channel, msg.id);
                        self.stats.skipped_corrupt.fetch_add(1, Ordering::Relaxed);
                        false
                    }
                },
                Classified::Unrelated => {
                    log::trace!("{}: ignoring unrelated message {}", self.channel, msg.id);
                    false
                }
            }
        };
        if changed {
            self.persist().await;
        }
        // Echoes of our own updates move the checkpoint, which can make compaction possible
        self.maybe_compact();
    }

    /// Fill a subscription gap from history.
    async fn catch_up(self: &Arc<Self>) {
        let checkpoint = {
            let mut s = self.session.lock().await;
            s.gap = true;
            s.last_message_id.clone()
        };
        log::info!("{}: subscription gap after {checkpoint:?}; catching up", self.channel);
        match self.scan_history(checkpoint).await {
            Ok(scan) => {
                let applied = self.apply_history(scan).await;
                log::info!("{}: gap filled ({applied} updates applied)", self.channel);
                self.persist().await;
                self.maybe_compact();
            }
            Err(e) => {
                log::warn!("{}: could not fill gap ({e}); waiting for reconnect", self.channel);
                if matches!(e, TransportError::Unavailable(_)) {
                    self.session.lock().await.online = false;
                }
            }
        }
    }

    async fn handle_local(self: &Arc<Self>, update: Vec<u8>) {
        let online = self.session.lock().await.online;
        if online {
            match self.publish_update(&update).await {
                Ok(id) => {
                    log::debug!("{}: published {id}", self.channel);
                    self.persist().await;
                    self.maybe_compact();
                    return;
                }
                Err(e) => {
                    log::warn!("{}: publish failed ({e}); queued for reconnect", self.channel);
                    if matches!(e, TransportError::Unavailable(_)) {
                        self.session.lock().await.online = false;
                    }
                }
            }
        }
        {
            let mut s = self.session.lock().await;
            if !s.outbox.enqueue(update) {
                log::warn!("{}: outbox full; full state will be sent on reconnect", self.channel);
            }
        }
        self.persist().await;
    }

    async fn publish_update(&self, update: &[u8]) -> Result<MessageId, TransportError> {
        let (msg_type, body) = self
            .classifier
            .envelope(MessageKind::Update, codec::encode_update(update));
        let id = self.transport.publish(&self.channel, msg_type, body).await?;

        let mut s = self.session.lock().await;
        s.applied.insert(id.clone());
        s.replay.append(id.clone(), update);
        self.stats.updates_published.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Publish queued updates in order; stops at the first failure.
    async fn flush_outbox(&self) -> Result<usize, SyncError> {
        let (queued, overflowed) = self.session.lock().await.outbox.drain();
        let updates = if overflowed {
            vec![self.doc.encode_state_as_update()]
        } else {
            queued
        };
        if updates.is_empty() {
            return Ok(0);
        }

        let mut sent = 0;
        let mut remaining = updates.into_iter();
        while let Some(update) = remaining.next() {
            if let Err(e) = self.publish_update(&update).await {
                let mut unsent = vec![update];
                unsent.extend(remaining);
                {
                    let mut s = self.session.lock().await;
                    s.outbox.requeue_front(unsent);
                    if matches!(e, TransportError::Unavailable(_)) {
                        s.online = false;
                    }
                }
                self.persist().await;
                return Err(e.into());
            }
            sent += 1;
        }
        log::info!("{}: flushed {sent} queued updates", self.channel);
        self.persist().await;
        Ok(sent)
    }

    /// Spawn a background compaction if the replay log is over threshold.
    fn maybe_compact(self: &Arc<Self>) {
        // Automatic compaction disabled
        if self.config.snapshot_interval_updates == 0 {
            return;
        }
        if self.compacting.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = self.clone();
        tokio::spawn(async move {
            let due = {
                let s = shared.session.lock().await;
                s.online && s.replay.needs_compaction() && s.frontier().is_some()
            };
            let stopping = *shared.cancel.borrow();
            if due && !stopping {
                if let Err(e) = shared.compact_and_publish().await {
                    log::warn!("{}: {e}; peers fall back to incremental replay", shared.channel);
                }
            }
            shared.compacting.store(false, Ordering::Release);
        });
    }

    async fn compact_and_publish(&self) -> Result<MessageId, SyncError> {
        let (base, updates, frontier) = {
            let s = self.session.lock().await;
            (s.replay.base().cloned(), s.replay.updates()?, s.frontier())
        };
        if updates.is_empty() {
            return Err(CompactionError::Empty.into());
        }
        // Everything up to the frontier has been applied, so it is in `updates` or the base
        let Some(frontier) = frontier else {
            return Err(SyncError::CompactionFailed(
                "no gap-free channel position to tag the snapshot with".into(),
            ));
        };
        let covered = updates.len();
        let last_covered = updates.last().map(|(id, _)| id.clone());

        let snapshot = compactor::compact_through(base.as_ref(), &updates, Some(frontier))?;
        let encoded = codec::encode_snapshot(&snapshot, self.config.compress_snapshots)
            .map_err(|e| SyncError::CompactionFailed(e.to_string()))?;
        let (msg_type, body) = self.classifier.envelope(MessageKind::Snapshot, encoded);
        let id = self
            .transport
            .publish(&self.channel, msg_type, body)
            .await
            .map_err(|e| SyncError::CompactionFailed(e.to_string()))?;

        let dropped = {
            let mut s = self.session.lock().await;
            s.seen_snapshots.insert(id.clone());
            // A snapshot applied meanwhile has already rebased past these updates
            if last_covered.is_some_and(|last| s.replay.contains(&last)) {
                s.snapshot_ref = snapshot.last_update_id.clone();
                s.replay.subsume(snapshot, covered)
            } else {
                0
            }
        };
        self.stats.snapshots_published.fetch_add(1, Ordering::Relaxed);
        log::info!("{}: published snapshot {id} covering {dropped} updates", self.channel);
        self.persist().await;
        Ok(id)
    }

    /// Mirror the current state to local persistence.
    async fn persist(&self) {
        let record = {
            let mut s = self.session.lock().await;
            s.save_seq += 1;
            PersistedRecord {
                state: self.doc.encode_state_as_update(),
                applied: s.applied.clone(),
                last_message_id: s.last_message_id.clone(),
                snapshot_ref: s.snapshot_ref.clone(),
                outbox: s.outbox.pending(),
                seq: s.save_seq,
            }
        };
        if let Err(e) = self.persistence.save(self.doc_id, &record).await {
            log::error!("{}: failed to persist state: {e}", self.channel);
        }
    }
}

fn decode_valid_snapshot(section: Section<'_>) -> Result<Snapshot, String> {
    let snapshot = section.decode_snapshot().map_err(|e| e.to_string())?;
    validate_update(&snapshot.state).map_err(|e| e.to_string())?;
    Ok(snapshot)
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

async fn next_inbound(subscription: &mut Option<TransportSubscription>) -> Option<SubscriptionEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_live(
    shared: Arc<Shared>,
    mut subscription: Option<TransportSubscription>,
    mut local: mpsc::UnboundedReceiver<Vec<u8>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break,
            Some(command) = commands.recv() => match command {
                Command::Attach(fresh) => subscription = Some(fresh),
            },
            inbound = next_inbound(&mut subscription) => match inbound {
                Some(SubscriptionEvent::Message(msg)) => shared.handle_inbound(msg).await,
                Some(SubscriptionEvent::Gap) => shared.catch_up().await,
                None => {
                    log::warn!("{}: subscription ended", shared.channel);
                    subscription = None;
                    shared.session.lock().await.online = false;
                }
            },
            update = local.recv() => match update {
                Some(update) => shared.handle_local(update).await,
                None => break,
            },
        }
    }
    log::debug!("{}: live loop stopped", shared.channel);
}
