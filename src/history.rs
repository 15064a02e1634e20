//! Append-only audit history for transaction records.
//!
//! The first entry is a full snapshot of the record; each later entry is a
//! JSON-Patch against the replay of everything before it, so the full record
//! can be rebuilt at any point in its life.

use json_patch::Patch;
use serde::Serialize;
use serde_json::Value;

use crate::types::TransactionMeta;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum HistoryEntry {
    Snapshot(Value),
    Diff(Patch),
}

/// Record as JSON, minus its own history.
pub fn snapshot_from_meta(meta: &TransactionMeta) -> Value {
    let mut snapshot = serde_json::to_value(meta).unwrap_or_default();
    if let Value::Object(map) = &mut snapshot {
        map.remove("history");
    }
    snapshot
}

pub fn generate_history_entry(previous: &Value, next: &Value) -> Patch {
    json_patch::diff(previous, next)
}

/// Rebuilds the latest snapshot. `None` for an empty or corrupt history.
pub fn replay_history(history: &[HistoryEntry]) -> Option<Value> {
    let mut entries = history.iter();
    let mut state = match entries.next()? {
        HistoryEntry::Snapshot(snapshot) => snapshot.clone(),
        HistoryEntry::Diff(_) => return None,
    };

    for entry in entries {
        match entry {
            HistoryEntry::Diff(patch) => json_patch::patch(&mut state, &patch.0).ok()?,
            HistoryEntry::Snapshot(snapshot) => state = snapshot.clone(),
        }
    }

    Some(state)
}

/// Appends one entry describing the record's current state.
pub fn push_history(meta: &mut TransactionMeta) {
    let current = snapshot_from_meta(meta);
    let entry = match replay_history(&meta.history) {
        Some(previous) => HistoryEntry::Diff(generate_history_entry(&previous, &current)),
        None => HistoryEntry::Snapshot(current),
    };
    meta.history.push(entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TxParams, TxStatus};

    fn sample_meta() -> TransactionMeta {
        TransactionMeta::new(
            7,
            "42",
            TxParams {
                from: "0xc684832530fcbddae4b4230a47e991ddcec2831d".to_string(),
                to: Some("0xc684832530fcbddae4b4230a47e991ddcec2831d".to_string()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn first_entry_is_snapshot() {
        let mut meta = sample_meta();
        push_history(&mut meta);
        assert_eq!(meta.history.len(), 1);
        match &meta.history[0] {
            HistoryEntry::Snapshot(snapshot) => {
                assert_eq!(snapshot["status"], "unapproved");
                assert!(snapshot.get("history").is_none());
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn replay_reconstructs_latest_state() {
        let mut meta = sample_meta();
        push_history(&mut meta);

        meta.status = TxStatus::Approved;
        meta.tx_params.nonce = Some("0x4".to_string());
        push_history(&mut meta);

        meta.status = TxStatus::Signed;
        meta.raw_tx = Some("0xf86c".to_string());
        push_history(&mut meta);

        assert_eq!(meta.history.len(), 3);
        assert!(matches!(meta.history[1], HistoryEntry::Diff(_)));

        let replayed = replay_history(&meta.history).unwrap();
        assert_eq!(replayed, snapshot_from_meta(&meta));
        assert_eq!(replayed["txParams"]["nonce"], "0x4");
    }

    #[test]
    fn unchanged_record_still_appends() {
        let mut meta = sample_meta();
        push_history(&mut meta);
        push_history(&mut meta);
        assert_eq!(meta.history.len(), 2);
        match &meta.history[1] {
            HistoryEntry::Diff(patch) => assert!(patch.0.is_empty()),
            other => panic!("expected diff, got {:?}", other),
        }
    }

    #[test]
    fn history_without_snapshot_does_not_replay() {
        let history = vec![HistoryEntry::Diff(Patch(Vec::new()))];
        assert!(replay_history(&history).is_none());
    }
}
