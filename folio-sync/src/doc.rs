//! Shared CRDT document handle backed by a Yrs `Doc`.
//!
//! All mutations go through Yrs transactions, which serialize writers on the
//! same document. Local edits made through [`SharedDoc::edit`] are encoded
//! as v1 updates and emitted to a single local-update observer; remote
//! updates applied through [`SharedDoc::apply_update`] are not echoed.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, GetString, Map, Out, ReadTxn, StateVector, Text, Transact, TransactionMut, Update,
    WriteTxn,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocError {
    #[error("Failed to decode update: {0}")]
    Decode(String),
    #[error("Failed to apply update: {0}")]
    Apply(String),
}

struct Inner {
    doc: Doc,
    local_tx: mpsc::UnboundedSender<Vec<u8>>,
    local_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

/// Cloneable handle to one in-memory CRDT document.
#[derive(Clone)]
pub struct SharedDoc {
    inner: Arc<Inner>,
}

impl SharedDoc {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Wrap an existing Yrs document.
    pub fn from_doc(doc: Doc) -> Self {
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                doc,
                local_tx,
                local_rx: Mutex::new(Some(local_rx)),
            }),
        }
    }

    /// Underlying Yrs document.
    pub fn yrs(&self) -> &Doc {
        &self.inner.doc
    }

    /// Apply an encoded v1 update.
    ///
    /// The update is fully decoded before the document is touched, so a
    /// malformed update never leaves a partial mutation behind.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocError> {
        let decoded = Update::decode_v1(update).map_err(|e| DocError::Decode(e.to_string()))?;
        let mut txn = self.inner.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| DocError::Apply(e.to_string()))
    }

    /// Full document state as a single update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.inner.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Everything the holder of `state_vector` is missing.
    pub fn encode_state_as_update_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(state_vector).map_err(|e| DocError::Decode(e.to_string()))?;
        let txn = self.inner.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Encoded state vector.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.inner.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Run a local mutation and emit the resulting update to the observer.
    pub fn edit<F, R>(&self, f: F) -> (R, Vec<u8>)
    where
        F: FnOnce(&mut TransactionMut) -> R,
    {
        let (result, update) = {
            let mut txn = self.inner.doc.transact_mut();
            let result = f(&mut txn);
            (result, txn.encode_update_v1())
        };
        // Receiver may not be attached yet; updates then wait in the channel.
        if self.inner.local_tx.send(update.clone()).is_err() {
            log::debug!("Local update of {} bytes not forwarded: observer dropped", update.len());
        }
        (result, update)
    }

    /// Take the local-update observer (can only be called once).
    pub async fn observe_local(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.inner.local_rx.lock().await.take()
    }

    /// Set `key` to `value` in the root map `map`.
    pub fn set_key(&self, map: &str, key: &str, value: &str) -> Vec<u8> {
        let ((), update) = self.edit(|txn| {
            let root = txn.get_or_insert_map(map);
            root.insert(txn, key, value.to_string());
        });
        update
    }

    /// Read a string value from the root map `map`.
    pub fn get_key(&self, map: &str, key: &str) -> Option<String> {
        let txn = self.inner.doc.transact();
        let root = txn.get_map(map)?;
        match root.get(&txn, key) {
            Some(Out::Any(Any::String(s))) => Some(s.to_string()),
            _ => None,
        }
    }

    /// Sorted keys of the root map `map`.
    pub fn keys(&self, map: &str) -> Vec<String> {
        let txn = self.inner.doc.transact();
        let mut keys: Vec<String> = match txn.get_map(map) {
            Some(root) => root.keys(&txn).map(|k| k.to_string()).collect(),
            None => Vec::new(),
        };
        keys.sort();
        keys
    }

    /// Append text to the root text `name`.
    pub fn append_text(&self, name: &str, chunk: &str) -> Vec<u8> {
        let ((), update) = self.edit(|txn| {
            let text = txn.get_or_insert_text(name);
            let len = text.len(&*txn);
            text.insert(txn, len, chunk);
        });
        update
    }

    /// Contents of the root text `name`.
    pub fn text(&self, name: &str) -> String {
        let txn = self.inner.doc.transact();
        txn.get_text(name)
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }
}

impl Default for SharedDoc {
    fn default() -> Self {
        Self::new()
    }
}

/// Check that `update` decodes, without applying it anywhere.
pub fn validate_update(update: &[u8]) -> Result<(), DocError> {
    Update::decode_v1(update)
        .map(|_| ())
        .map_err(|e| DocError::Decode(e.to_string()))
}

/// Merge encoded document states into one update.
pub fn merge_states<T: AsRef<[u8]>>(states: &[T]) -> Result<Vec<u8>, DocError> {
    let doc = SharedDoc::new();
    for state in states {
        doc.apply_update(state.as_ref())?;
    }
    Ok(doc.encode_state_as_update())
}
