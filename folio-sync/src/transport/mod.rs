//! Messaging transport seam.
//!
//! A transport is an append-only, ordered log of messages per channel with
//! live fan-out to subscribers. The coordinator only needs three calls:
//!
//! ```text
//!   fetch_history(channel, before, limit) ──► HistoryPage (oldest → newest)
//!   subscribe(channel)                    ──► TransportSubscription
//!   publish(channel, msg_type, body)      ──► MessageId
//! ```
//!
//! A subscription delivers messages in channel order. When it drops
//! messages (slow reader, connection blip) it says so with a
//! [`SubscriptionEvent::Gap`] before the next message it does deliver.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::{ChannelId, MessageBody, MessageId, TransportMessage};

pub use memory::{MemoryHub, MemoryTransport};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Transport cannot be reached right now; worth retrying.
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
    #[error("Unknown history cursor: {0}")]
    InvalidCursor(MessageId),
    #[error("Transport closed")]
    Closed,
}

/// One page of channel history.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    /// Messages in delivery order, oldest first
    pub messages: Vec<TransportMessage>,
    /// Cursor for the next older page; `None` at the start of the channel
    pub prev_cursor: Option<MessageId>,
}

impl HistoryPage {
    pub fn is_start(&self) -> bool {
        self.prev_cursor.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Message(TransportMessage),
    /// One or more messages were not delivered; fill in from history.
    Gap,
}

/// Live message stream for one channel.
///
/// Dropping the subscription unsubscribes.
pub struct TransportSubscription {
    rx: mpsc::Receiver<SubscriptionEvent>,
}

impl TransportSubscription {
    pub fn new(rx: mpsc::Receiver<SubscriptionEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the transport ends the stream.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Up to `limit` messages strictly older than `before` (or the newest
    /// messages when `before` is `None`).
    async fn fetch_history(
        &self,
        channel: &ChannelId,
        before: Option<&MessageId>,
        limit: usize,
    ) -> Result<HistoryPage, TransportError>;

    async fn subscribe(&self, channel: &ChannelId) -> Result<TransportSubscription, TransportError>;

    /// Append a message; returns the transport-assigned ID.
    async fn publish(
        &self,
        channel: &ChannelId,
        msg_type: &str,
        body: MessageBody,
    ) -> Result<MessageId, TransportError>;
}
