//! Update codec: CRDT bytes ⇄ transport-safe text.
//!
//! Updates travel as standard base64. Snapshots travel as a small JSON
//! envelope carrying the base64 state (optionally LZ4-compressed first) and
//! the channel position up to which they contain every update.
//!
//! Decoding is all-or-nothing: a malformed payload yields
//! [`CodecError::CorruptPayload`] and no bytes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::MessageId;
use crate::replay::Snapshot;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),
}

/// Wire form of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotPayload {
    /// Last update message folded into this snapshot
    pub last_update_id: Option<MessageId>,
    /// Whether `state` was LZ4-compressed before base64
    #[serde(default)]
    pub compressed: bool,
    /// base64 document state
    pub state: String,
}

/// Encode an update for a text transport.
pub fn encode_update(update: &[u8]) -> String {
    STANDARD.encode(update)
}

/// Decode an update received as text.
pub fn decode_update(payload: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD
        .decode(payload.trim())
        .map_err(|e| CodecError::CorruptPayload(e.to_string()))
}

/// Encode a snapshot as JSON text.
pub fn encode_snapshot(snapshot: &Snapshot, compress: bool) -> Result<String, CodecError> {
    let state = if compress {
        STANDARD.encode(lz4_flex::compress_prepend_size(&snapshot.state))
    } else {
        STANDARD.encode(&snapshot.state)
    };
    let payload = SnapshotPayload {
        last_update_id: snapshot.last_update_id.clone(),
        compressed: compress,
        state,
    };
    serde_json::to_string(&payload).map_err(|e| CodecError::CorruptPayload(e.to_string()))
}

/// Decode a snapshot from JSON text.
pub fn decode_snapshot(text: &str) -> Result<Snapshot, CodecError> {
    let payload: SnapshotPayload =
        serde_json::from_str(text).map_err(|e| CodecError::CorruptPayload(e.to_string()))?;
    let raw = decode_update(&payload.state)?;
    let state = if payload.compressed {
        lz4_flex::decompress_size_prepended(&raw)
            .map_err(|e| CodecError::CorruptPayload(e.to_string()))?
    } else {
        raw
    };
    Ok(Snapshot {
        state,
        last_update_id: payload.last_update_id,
    })
}
