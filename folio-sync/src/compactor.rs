//! Snapshot compactor.
//!
//! Folds a base snapshot and the updates received after it into a single
//! new snapshot. Compaction works on owned, point-in-time inputs in a fresh
//! document, so it never touches the live document or its transaction lock.

use thiserror::Error;

use crate::doc::SharedDoc;
use crate::message::MessageId;
use crate::replay::Snapshot;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompactionError {
    #[error("Nothing to compact")]
    Empty,
    #[error("Failed to merge {id}: {reason}")]
    Crdt { id: String, reason: String },
}

/// Merge `base` and `updates_since` into a new snapshot.
///
/// `updates_since` must be in channel order: the result references the last
/// update in it, or keeps the base reference when it is empty.
pub fn compact(
    base: Option<&Snapshot>,
    updates_since: &[(MessageId, Vec<u8>)],
) -> Result<Snapshot, CompactionError> {
    let through = match updates_since.last() {
        Some((id, _)) => Some(id.clone()),
        None => base.and_then(|b| b.last_update_id.clone()),
    };
    compact_through(base, updates_since, through)
}

/// Merge `base` and `updates_since`, tagging the result with `through`.
///
/// The caller guarantees that every update at or before `through` in
/// channel order is in `base` or `updates_since`. Updates in
/// `updates_since` may be newer than `through`; readers re-apply those
/// harmlessly.
pub fn compact_through(
    base: Option<&Snapshot>,
    updates_since: &[(MessageId, Vec<u8>)],
    through: Option<MessageId>,
) -> Result<Snapshot, CompactionError> {
    if base.is_none() && updates_since.is_empty() {
        return Err(CompactionError::Empty);
    }

    let doc = SharedDoc::new();
    if let Some(base) = base {
        doc.apply_update(&base.state).map_err(|e| CompactionError::Crdt {
            id: "base".to_string(),
            reason: e.to_string(),
        })?;
    }
    for (id, update) in updates_since {
        doc.apply_update(update).map_err(|e| CompactionError::Crdt {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
    }

    log::debug!(
        "Compacted {} updates into snapshot (ref={:?})",
        updates_since.len(),
        through
    );

    Ok(Snapshot {
        state: doc.encode_state_as_update(),
        last_update_id: through,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn updates(doc: &SharedDoc, n: usize) -> Vec<(MessageId, Vec<u8>)> {
        (0..n)
            .map(|i| {
                let u = doc.set_key("cells", &format!("k{i}"), &format!("v{i}"));
                (MessageId::new(format!("m{i}")), u)
            })
            .collect()
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(compact(None, &[]).unwrap_err(), CompactionError::Empty);
    }

    #[test]
    fn test_compact_matches_full_replay() {
        let source = SharedDoc::new();
        let all = updates(&source, 10);

        let snapshot = compact(None, &all[..6]).unwrap();
        assert_eq!(snapshot.last_update_id, Some(MessageId::from("m5")));

        let replayed = SharedDoc::new();
        replayed.apply_update(&snapshot.state).unwrap();
        for (_, u) in &all[6..] {
            replayed.apply_update(u).unwrap();
        }

        let full = SharedDoc::new();
        for (_, u) in &all {
            full.apply_update(u).unwrap();
        }
        assert_eq!(replayed.keys("cells"), full.keys("cells"));
        assert_eq!(replayed.keys("cells").len(), 10);
    }

    #[test]
    fn test_compact_on_top_of_base() {
        let source = SharedDoc::new();
        let all = updates(&source, 4);
        let base = compact(None, &all[..2]).unwrap();
        let next = compact(Some(&base), &all[2..]).unwrap();
        assert_eq!(next.last_update_id, Some(MessageId::from("m3")));

        let doc = SharedDoc::new();
        doc.apply_update(&next.state).unwrap();
        assert_eq!(doc.keys("cells").len(), 4);
    }

    #[test]
    fn test_base_only_keeps_reference() {
        let base = Snapshot {
            state: SharedDoc::new().encode_state_as_update(),
            last_update_id: Some(MessageId::from("m9")),
        };
        let snapshot = compact(Some(&base), &[]).unwrap();
        assert_eq!(snapshot.last_update_id, Some(MessageId::from("m9")));
    }

    #[test]
    fn test_compact_through_keeps_given_reference() {
        let source = SharedDoc::new();
        let all = updates(&source, 3);
        // m2 was applied before m0 and m1 were confirmed in channel order
        let snapshot = compact_through(None, &all, Some(MessageId::from("m0"))).unwrap();
        assert_eq!(snapshot.last_update_id, Some(MessageId::from("m0")));

        let doc = SharedDoc::new();
        doc.apply_update(&snapshot.state).unwrap();
        assert_eq!(doc.keys("cells").len(), 3);

        let unanchored = compact_through(None, &all, None).unwrap();
        assert_eq!(unanchored.last_update_id, None);
    }

    #[test]
    fn test_corrupt_update_reported() {
        let bad = vec![(MessageId::from("m1"), vec![0xFF, 0xFF])];
        match compact(None, &bad).unwrap_err() {
            CompactionError::Crdt { id, .. } => assert_eq!(id, "m1"),
            other => panic!("Expected Crdt error, got {other:?}"),
        }
    }
}
