//! Append-only document version store.
//!
//! Versions are immutable snapshots plus the accepted edits that
//! produced them. Version numbers are gapless and strictly increasing
//! per document; the number is derived from the sequence length under
//! the document's map entry, and the single-writer dispatcher is the
//! only component feeding the accepted-edit buffer.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::{CollaborativeEdit, DocumentId, UserId};

/// Unique identifier for a document version
pub type VersionId = String;

/// An immutable, numbered snapshot of a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub version_id: VersionId,
    pub document_id: DocumentId,
    /// Strictly increasing, gapless, never reused
    pub version_number: u64,
    pub content_snapshot: String,
    /// Accepted edits that produced this version, in global order
    pub changes: Vec<CollaborativeEdit>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Summary diff between two versions of a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionDiff {
    pub from_version: u64,
    pub to_version: u64,
    /// Difference in edit counts; negative when diffing backwards
    pub changes_count: i64,
    pub created_by: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Store owning the per-document version sequences and the buffer of
/// accepted edits awaiting the next snapshot.
pub struct VersionStore {
    versions: DashMap<DocumentId, Vec<DocumentVersion>>,
    pending: DashMap<DocumentId, Vec<CollaborativeEdit>>,
}

impl VersionStore {
    pub fn new() -> Self {
        Self {
            versions: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Append a new version. The version number is the current sequence
    /// length plus one, computed under the document's entry lock.
    pub fn create_version(
        &self,
        document_id: &str,
        content_snapshot: String,
        changes: Vec<CollaborativeEdit>,
        created_by: &str,
        description: Option<String>,
    ) -> VersionId {
        let mut entry = self.versions.entry(document_id.to_string()).or_default();

        let version_number = entry.len() as u64 + 1;
        let version_id = format!("version_{}_{}", document_id, version_number);

        entry.push(DocumentVersion {
            version_id: version_id.clone(),
            document_id: document_id.to_string(),
            version_number,
            content_snapshot,
            changes,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
            description,
        });

        info!(document_id = %document_id, version = version_number, "Created document version");
        version_id
    }

    /// All versions of a document, oldest first; empty if unknown
    pub fn versions(&self, document_id: &str) -> Vec<DocumentVersion> {
        self.versions
            .get(document_id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// The version number the next accepted edit targets
    pub fn next_version_number(&self, document_id: &str) -> u64 {
        self.versions
            .get(document_id)
            .map(|v| v.len() as u64)
            .unwrap_or(0)
            + 1
    }

    /// Diff two versions by number. Returns `None` if either version
    /// does not exist.
    pub fn diff(&self, document_id: &str, from_version: u64, to_version: u64) -> Option<VersionDiff> {
        let versions = self.versions.get(document_id)?;
        let from = versions.iter().find(|v| v.version_number == from_version)?;
        let to = versions.iter().find(|v| v.version_number == to_version)?;

        Some(VersionDiff {
            from_version,
            to_version,
            changes_count: to.changes.len() as i64 - from.changes.len() as i64,
            created_by: to.created_by.clone(),
            description: to.description.clone(),
            timestamp: to.created_at,
        })
    }

    /// Record an accepted edit into the document's pending buffer.
    /// Called only by the dispatcher.
    pub fn record_edit(&self, document_id: &str, edit: CollaborativeEdit) {
        self.pending
            .entry(document_id.to_string())
            .or_default()
            .push(edit);
    }

    /// Drain the accepted edits buffered since the last snapshot
    pub fn take_pending(&self, document_id: &str) -> Vec<CollaborativeEdit> {
        self.pending
            .get_mut(document_id)
            .map(|mut p| std::mem::take(p.value_mut()))
            .unwrap_or_default()
    }

    /// Accepted edits buffered since the last snapshot, without draining
    pub fn pending_edits(&self, document_id: &str) -> Vec<CollaborativeEdit> {
        self.pending
            .get(document_id)
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn version_count(&self, document_id: &str) -> usize {
        self.versions.get(document_id).map(|v| v.len()).unwrap_or(0)
    }

    pub fn total_version_count(&self) -> usize {
        self.versions.iter().map(|e| e.value().len()).sum()
    }
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EditKind, Position};

    fn edit(content: &str) -> CollaborativeEdit {
        CollaborativeEdit::new("s1", "user_a", EditKind::Insert, Position::at_offset(0), content)
    }

    #[test]
    fn test_version_numbers_are_gapless() {
        let store = VersionStore::new();

        for i in 1..=5u64 {
            store.create_version("doc1", format!("snapshot {}", i), vec![], "user_a", None);
        }

        let versions = store.versions("doc1");
        let numbers: Vec<u64> = versions.iter().map(|v| v.version_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert_eq!(versions[2].version_id, "version_doc1_3");
    }

    #[test]
    fn test_versions_are_per_document() {
        let store = VersionStore::new();
        store.create_version("doc1", "a".into(), vec![], "user_a", None);
        store.create_version("doc2", "b".into(), vec![], "user_a", None);
        store.create_version("doc1", "c".into(), vec![], "user_a", None);

        assert_eq!(store.version_count("doc1"), 2);
        assert_eq!(store.version_count("doc2"), 1);
        assert_eq!(store.total_version_count(), 3);
        assert_eq!(store.next_version_number("doc1"), 3);
    }

    #[test]
    fn test_diff() {
        let store = VersionStore::new();
        store.create_version("doc1", "a".into(), vec![edit("x")], "user_a", None);
        store.create_version(
            "doc1",
            "ab".into(),
            vec![edit("x"), edit("y"), edit("z")],
            "user_b",
            Some("second pass".into()),
        );

        let diff = store.diff("doc1", 1, 2).unwrap();
        assert_eq!(diff.changes_count, 2);
        assert_eq!(diff.created_by, "user_b");
        assert_eq!(diff.description.as_deref(), Some("second pass"));

        // Backwards diff is negative, not an error
        assert_eq!(store.diff("doc1", 2, 1).unwrap().changes_count, -2);
    }

    #[test]
    fn test_diff_unknown_version_is_empty() {
        let store = VersionStore::new();
        store.create_version("doc1", "a".into(), vec![], "user_a", None);

        assert!(store.diff("doc1", 1, 7).is_none());
        assert!(store.diff("missing", 1, 1).is_none());
    }

    #[test]
    fn test_pending_edit_buffer() {
        let store = VersionStore::new();
        store.record_edit("doc1", edit("one"));
        store.record_edit("doc1", edit("two"));

        assert_eq!(store.pending_edits("doc1").len(), 2);

        let drained = store.take_pending("doc1");
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].content, "one");
        assert!(store.take_pending("doc1").is_empty());
    }
}
