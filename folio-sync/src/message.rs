//! Transport envelope types.
//!
//! ```text
//! ┌──────────────┬──────────────────────────┬────────────────────────┐
//! │ id           │ msg_type                 │ body                   │
//! │ transport-   │ org.folio.crdt.update    │ base64 update          │
//! │ assigned     │ org.folio.crdt.snapshot  │ JSON snapshot payload  │
//! │              │ m.room.message (generic) │ prefix + one of above  │
//! └──────────────┴──────────────────────────┴────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dedicated message type for incremental updates.
pub const UPDATE_MESSAGE_TYPE: &str = "org.folio.crdt.update";
/// Dedicated message type for snapshots.
pub const SNAPSHOT_MESSAGE_TYPE: &str = "org.folio.crdt.snapshot";
/// Generic message type used when the transport only carries one kind.
pub const GENERIC_MESSAGE_TYPE: &str = "m.room.message";
/// Body prefix marking an update inside a generic message.
pub const UPDATE_PREFIX: &str = "crdt-update:";
/// Body prefix marking a snapshot inside a generic message.
pub const SNAPSHOT_PREFIX: &str = "crdt-snapshot:";

/// Transport-assigned message identifier.
///
/// Opaque to the sync layer; only equality and delivery position matter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a transport channel (one per document).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Message body: text for text-only transports, raw bytes otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    Text(String),
    Binary(Vec<u8>),
}

impl MessageBody {
    /// Text content, if this is a text body.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageBody::Text(s) => Some(s),
            MessageBody::Binary(_) => None,
        }
    }

    /// Body size in bytes.
    pub fn len(&self) -> usize {
        match self {
            MessageBody::Text(s) => s.len(),
            MessageBody::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A message as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub id: MessageId,
    pub msg_type: String,
    pub body: MessageBody,
    /// Sender identity, when the transport reports one
    pub sender: Option<String>,
}

impl TransportMessage {
    pub fn new(id: impl Into<MessageId>, msg_type: impl Into<String>, body: MessageBody) -> Self {
        Self {
            id: id.into(),
            msg_type: msg_type.into(),
            body,
            sender: None,
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
