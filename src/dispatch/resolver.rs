//! Conflict resolution for temporally-overlapping edits.
//!
//! `resolve` is a pure function: the outcome depends only on the policy
//! and the conflicting edits, never on call order or hidden state.
//! Timestamp ties are broken by edit id so that equal inputs always
//! produce the identical output edit.

use crate::engine::{CollaborativeEdit, EditKind, SYSTEM_MERGE_USER};
use crate::session::ConflictPolicy;

/// Ordering key for deterministic edit comparison
fn order_key(edit: &CollaborativeEdit) -> (chrono::DateTime<chrono::Utc>, &str) {
    (edit.timestamp, edit.edit_id.as_str())
}

/// Resolve a set of conflicting edits into the single accepted edit.
///
/// Returns `None` only for an empty input set.
pub fn resolve(policy: ConflictPolicy, edits: &[CollaborativeEdit]) -> Option<CollaborativeEdit> {
    if edits.is_empty() {
        return None;
    }

    match policy {
        ConflictPolicy::LastWriteWins => edits.iter().max_by_key(|e| order_key(e)).cloned(),
        ConflictPolicy::FirstWriteWins => edits.iter().min_by_key(|e| order_key(e)).cloned(),
        ConflictPolicy::Merge => merge_edits(edits),
    }
}

/// Merge insert edits in timestamp order into one synthetic edit
/// attributed to the system pseudo-user.
///
/// Non-insert edits contribute nothing to the merged content; if the
/// conflict set contains no insert at all, the merge degrades to
/// last-write-wins rather than producing an empty edit.
fn merge_edits(edits: &[CollaborativeEdit]) -> Option<CollaborativeEdit> {
    let mut ordered: Vec<&CollaborativeEdit> = edits.iter().collect();
    ordered.sort_by_key(|e| order_key(e));

    let inserts: Vec<&CollaborativeEdit> = ordered
        .iter()
        .copied()
        .filter(|e| e.kind == EditKind::Insert)
        .collect();

    if inserts.is_empty() {
        return resolve(ConflictPolicy::LastWriteWins, edits);
    }

    let earliest = inserts[0];
    let content: String = inserts.iter().map(|e| e.content.as_str()).collect();

    // Derived id: a fresh uuid here would make equal inputs produce
    // unequal outputs.
    let merged_id = format!("merged_{}", earliest.edit_id.trim_start_matches("edit_"));

    Some(CollaborativeEdit {
        edit_id: merged_id,
        session_id: earliest.session_id.clone(),
        user_id: SYSTEM_MERGE_USER.to_string(),
        kind: EditKind::Insert,
        position: earliest.position.clone(),
        content,
        timestamp: ordered.last().map(|e| e.timestamp).unwrap_or(earliest.timestamp),
        version: ordered.iter().map(|e| e.version).max().unwrap_or(1),
        previous_version: None,
    })
}
