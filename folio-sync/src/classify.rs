//! Message classifier.
//!
//! Sorts transport messages into updates, snapshots and everything else.
//! The strategy is chosen once from [`ClassifierMode`]; messages are never
//! sniffed to guess which convention a sender used.

use crate::codec::{self, CodecError};
use crate::config::ClassifierMode;
use crate::message::{
    MessageBody, TransportMessage, GENERIC_MESSAGE_TYPE, SNAPSHOT_MESSAGE_TYPE, SNAPSHOT_PREFIX,
    UPDATE_MESSAGE_TYPE, UPDATE_PREFIX,
};
use crate::replay::Snapshot;

/// What a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Update,
    Snapshot,
    Unrelated,
}

/// The part of a message body holding the encoded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

impl<'a> Section<'a> {
    /// Decode as an incremental update.
    pub fn decode_update(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Section::Text(text) => codec::decode_update(text),
            Section::Binary(bytes) => Ok(bytes.to_vec()),
        }
    }

    /// Decode as a snapshot envelope.
    pub fn decode_snapshot(&self) -> Result<Snapshot, CodecError> {
        match self {
            Section::Text(text) => codec::decode_snapshot(text),
            Section::Binary(bytes) => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| CodecError::CorruptPayload(e.to_string()))?;
                codec::decode_snapshot(text)
            }
        }
    }
}

/// A classified message, borrowing its payload section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classified<'a> {
    Update(Section<'a>),
    Snapshot(Section<'a>),
    Unrelated,
}

impl Classified<'_> {
    pub fn kind(&self) -> MessageKind {
        match self {
            Classified::Update(_) => MessageKind::Update,
            Classified::Snapshot(_) => MessageKind::Snapshot,
            Classified::Unrelated => MessageKind::Unrelated,
        }
    }
}

/// Configuration-selected classification strategy.
#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    mode: ClassifierMode,
}

impl Classifier {
    pub fn new(mode: ClassifierMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ClassifierMode {
        self.mode
    }

    /// Classify a message.
    pub fn classify<'a>(&self, msg: &'a TransportMessage) -> Classified<'a> {
        match self.mode {
            ClassifierMode::Dedicated => {
                let section = match &msg.body {
                    MessageBody::Text(text) => Section::Text(text),
                    MessageBody::Binary(bytes) => Section::Binary(bytes),
                };
                match msg.msg_type.as_str() {
                    UPDATE_MESSAGE_TYPE => Classified::Update(section),
                    SNAPSHOT_MESSAGE_TYPE => Classified::Snapshot(section),
                    _ => Classified::Unrelated,
                }
            }
            ClassifierMode::GenericPrefix => {
                if msg.msg_type != GENERIC_MESSAGE_TYPE {
                    return Classified::Unrelated;
                }
                let Some(text) = msg.body.as_text() else {
                    return Classified::Unrelated;
                };
                if let Some(rest) = text.strip_prefix(UPDATE_PREFIX) {
                    Classified::Update(Section::Text(rest))
                } else if let Some(rest) = text.strip_prefix(SNAPSHOT_PREFIX) {
                    Classified::Snapshot(Section::Text(rest))
                } else {
                    Classified::Unrelated
                }
            }
        }
    }

    /// Build the `(msg_type, body)` pair for publishing an encoded payload.
    ///
    /// `kind` must be `Update` or `Snapshot`; `Unrelated` is sent as-is
    /// under the generic type.
    pub fn envelope(&self, kind: MessageKind, encoded: String) -> (&'static str, MessageBody) {
        match (self.mode, kind) {
            (ClassifierMode::Dedicated, MessageKind::Update) => {
                (UPDATE_MESSAGE_TYPE, MessageBody::Text(encoded))
            }
            (ClassifierMode::Dedicated, MessageKind::Snapshot) => {
                (SNAPSHOT_MESSAGE_TYPE, MessageBody::Text(encoded))
            }
            (ClassifierMode::GenericPrefix, MessageKind::Update) => (
                GENERIC_MESSAGE_TYPE,
                MessageBody::Text(format!("{UPDATE_PREFIX}{encoded}")),
            ),
            (ClassifierMode::GenericPrefix, MessageKind::Snapshot) => (
                GENERIC_MESSAGE_TYPE,
                MessageBody::Text(format!("{SNAPSHOT_PREFIX}{encoded}")),
            ),
            (_, MessageKind::Unrelated) => (GENERIC_MESSAGE_TYPE, MessageBody::Text(encoded)),
        }
    }
}
