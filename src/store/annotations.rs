//! Annotation and threaded comment store.
//!
//! Annotations are the only mutable records in the engine: content and
//! position can change, and `is_resolved` is a one-way latch that is
//! idempotent once set. Comments form trees through a thread index of
//! parent id to reply ids; `thread()` rebuilds a thread depth-first in
//! insertion order rather than storing reply lists on the records.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::{DocumentId, Position, UserId};

/// Unique identifier for an annotation
pub type AnnotationId = String;

/// Unique identifier for a comment
pub type CommentId = String;

/// The kind of a document annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationKind {
    Comment,
    Highlight,
    Note,
    Suggestion,
}

impl AnnotationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationKind::Comment => "comment",
            AnnotationKind::Highlight => "highlight",
            AnnotationKind::Note => "note",
            AnnotationKind::Suggestion => "suggestion",
        }
    }
}

/// A positioned, typed annotation on a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentAnnotation {
    pub annotation_id: AnnotationId,
    pub document_id: DocumentId,
    pub user_id: UserId,
    pub kind: AnnotationKind,
    pub content: String,
    pub position: Position,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// One-way latch: false to true only
    pub is_resolved: bool,
}

impl DocumentAnnotation {
    pub fn new(
        document_id: impl Into<String>,
        user_id: impl Into<String>,
        kind: AnnotationKind,
        content: impl Into<String>,
        position: Position,
    ) -> Self {
        let now = Utc::now();
        Self {
            annotation_id: format!("annotation_{}", uuid::Uuid::new_v4().simple()),
            document_id: document_id.into(),
            user_id: user_id.into(),
            kind,
            content: content.into(),
            position,
            created_at: now,
            updated_at: now,
            is_resolved: false,
        }
    }
}

/// A comment on a document, optionally replying to another comment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub comment_id: CommentId,
    pub document_id: DocumentId,
    pub user_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_comment_id: Option<CommentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_resolved: bool,
}

/// Store owning annotations, comments and the comment thread index.
pub struct AnnotationStore {
    annotations: DashMap<DocumentId, Vec<DocumentAnnotation>>,
    /// annotation id -> owning document, for direct lookups
    annotation_index: DashMap<AnnotationId, DocumentId>,

    /// Ids minted at enqueue time whose insert is still in flight
    reserved_ids: DashSet<AnnotationId>,

    comments: DashMap<DocumentId, Vec<Comment>>,
    comment_index: DashMap<CommentId, DocumentId>,
    /// comment id -> reply ids, in insertion order
    threads: DashMap<CommentId, Vec<CommentId>>,
}

impl AnnotationStore {
    pub fn new() -> Self {
        Self {
            annotations: DashMap::new(),
            annotation_index: DashMap::new(),
            reserved_ids: DashSet::new(),
            comments: DashMap::new(),
            comment_index: DashMap::new(),
            threads: DashMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // Annotations
    // ------------------------------------------------------------------

    /// Mark an id as minted before its insert reaches the store, so
    /// follow-up operations on it are accepted while it is in flight.
    pub fn reserve_annotation_id(&self, annotation_id: &str) {
        self.reserved_ids.insert(annotation_id.to_string());
    }

    /// Drop a reservation whose insert was never enqueued
    pub fn cancel_reservation(&self, annotation_id: &str) {
        self.reserved_ids.remove(annotation_id);
    }

    /// Whether the id refers to a stored annotation or one in flight
    pub fn annotation_known(&self, annotation_id: &str) -> bool {
        self.annotation_index.contains_key(annotation_id)
            || self.reserved_ids.contains(annotation_id)
    }

    /// Insert a fully-formed annotation record. The id was minted when
    /// the operation was enqueued.
    pub fn insert_annotation(&self, annotation: DocumentAnnotation) {
        self.reserved_ids.remove(&annotation.annotation_id);
        self.annotation_index.insert(
            annotation.annotation_id.clone(),
            annotation.document_id.clone(),
        );
        info!(
            annotation_id = %annotation.annotation_id,
            document_id = %annotation.document_id,
            "Added annotation"
        );
        self.annotations
            .entry(annotation.document_id.clone())
            .or_default()
            .push(annotation);
    }

    /// Update an annotation's content and, optionally, its position.
    /// Returns false if the id is unknown.
    pub fn update_annotation(
        &self,
        annotation_id: &str,
        content: String,
        position: Option<Position>,
    ) -> bool {
        self.with_annotation_mut(annotation_id, |annotation| {
            annotation.content = content;
            if let Some(position) = position {
                annotation.position = position;
            }
            annotation.updated_at = Utc::now();
        })
    }

    /// Latch an annotation resolved. Resolving twice is not an error;
    /// the second call still returns true.
    pub fn resolve_annotation(&self, annotation_id: &str) -> bool {
        self.with_annotation_mut(annotation_id, |annotation| {
            annotation.is_resolved = true;
            annotation.updated_at = Utc::now();
        })
    }

    fn with_annotation_mut(
        &self,
        annotation_id: &str,
        f: impl FnOnce(&mut DocumentAnnotation),
    ) -> bool {
        let Some(document_id) = self.annotation_index.get(annotation_id).map(|d| d.clone())
        else {
            return false;
        };
        let Some(mut annotations) = self.annotations.get_mut(&document_id) else {
            return false;
        };
        match annotations
            .iter_mut()
            .find(|a| a.annotation_id == annotation_id)
        {
            Some(annotation) => {
                f(annotation);
                true
            }
            None => false,
        }
    }

    /// Look up a single annotation by id
    pub fn annotation(&self, annotation_id: &str) -> Option<DocumentAnnotation> {
        let document_id = self.annotation_index.get(annotation_id)?.clone();
        self.annotations
            .get(&document_id)?
            .iter()
            .find(|a| a.annotation_id == annotation_id)
            .cloned()
    }

    /// All annotations on a document, in insertion order
    pub fn document_annotations(&self, document_id: &str) -> Vec<DocumentAnnotation> {
        self.annotations
            .get(document_id)
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    /// Annotations by one user on a document
    pub fn user_annotations(&self, user_id: &str, document_id: &str) -> Vec<DocumentAnnotation> {
        self.annotations
            .get(document_id)
            .map(|annotations| {
                annotations
                    .iter()
                    .filter(|a| a.user_id == user_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn annotation_count(&self, document_id: &str) -> usize {
        self.annotations
            .get(document_id)
            .map(|a| a.len())
            .unwrap_or(0)
    }

    pub fn total_annotation_count(&self) -> usize {
        self.annotations.iter().map(|e| e.value().len()).sum()
    }

    // ------------------------------------------------------------------
    // Comments
    // ------------------------------------------------------------------

    /// Add a comment. A reply is appended to its parent's thread list;
    /// a root comment starts its own empty thread list.
    pub fn add_comment(
        &self,
        document_id: &str,
        user_id: &str,
        content: String,
        parent_comment_id: Option<CommentId>,
        position: Option<Position>,
    ) -> CommentId {
        let comment_id = format!("comment_{}", uuid::Uuid::new_v4().simple());
        let now = Utc::now();

        let comment = Comment {
            comment_id: comment_id.clone(),
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
            content,
            parent_comment_id: parent_comment_id.clone(),
            position,
            created_at: now,
            updated_at: now,
            is_resolved: false,
        };

        self.comment_index
            .insert(comment_id.clone(), document_id.to_string());
        self.comments
            .entry(document_id.to_string())
            .or_default()
            .push(comment);

        match parent_comment_id {
            Some(parent) => {
                self.threads.entry(parent).or_default().push(comment_id.clone());
            }
            None => {
                self.threads.entry(comment_id.clone()).or_default();
            }
        }

        info!(comment_id = %comment_id, document_id = %document_id, "Added comment");
        comment_id
    }

    /// All comments on a document, in insertion order
    pub fn document_comments(&self, document_id: &str) -> Vec<Comment> {
        self.comments
            .get(document_id)
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Latch a comment resolved; idempotent like annotations
    pub fn resolve_comment(&self, comment_id: &str) -> bool {
        let Some(document_id) = self.comment_index.get(comment_id).map(|d| d.clone()) else {
            return false;
        };
        let Some(mut comments) = self.comments.get_mut(&document_id) else {
            return false;
        };
        match comments.iter_mut().find(|c| c.comment_id == comment_id) {
            Some(comment) => {
                comment.is_resolved = true;
                comment.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    fn comment(&self, comment_id: &str) -> Option<Comment> {
        let document_id = self.comment_index.get(comment_id)?.clone();
        self.comments
            .get(&document_id)?
            .iter()
            .find(|c| c.comment_id == comment_id)
            .cloned()
    }

    /// Reconstruct a thread: root first, then replies depth-first in
    /// insertion order. An unknown root yields an empty sequence.
    pub fn thread(&self, root_comment_id: &str) -> Vec<Comment> {
        let Some(root) = self.comment(root_comment_id) else {
            return Vec::new();
        };

        let mut thread = vec![root];
        self.collect_replies(root_comment_id, &mut thread);
        thread
    }

    fn collect_replies(&self, comment_id: &str, thread: &mut Vec<Comment>) {
        let reply_ids: Vec<CommentId> = self
            .threads
            .get(comment_id)
            .map(|r| r.clone())
            .unwrap_or_default();

        for reply_id in reply_ids {
            if let Some(reply) = self.comment(&reply_id) {
                thread.push(reply);
                self.collect_replies(&reply_id, thread);
            }
        }
    }

    pub fn total_comment_count(&self) -> usize {
        self.comments.iter().map(|e| e.value().len()).sum()
    }

    /// Annotation counts per kind for one document
    pub fn annotation_type_counts(
        &self,
        document_id: &str,
    ) -> std::collections::BTreeMap<String, usize> {
        let mut counts = std::collections::BTreeMap::new();
        if let Some(annotations) = self.annotations.get(document_id) {
            for annotation in annotations.iter() {
                *counts.entry(annotation.kind.as_str().to_string()).or_insert(0) += 1;
            }
        }
        counts
    }
}

impl Default for AnnotationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotation(document_id: &str, user_id: &str, kind: AnnotationKind) -> DocumentAnnotation {
        DocumentAnnotation::new(document_id, user_id, kind, "check this", Position::on_page(1, 0))
    }

    #[test]
    fn test_insert_and_query_annotations() {
        let store = AnnotationStore::new();
        let a = annotation("doc1", "user_a", AnnotationKind::Comment);
        let id = a.annotation_id.clone();
        store.insert_annotation(a);
        store.insert_annotation(annotation("doc1", "user_b", AnnotationKind::Highlight));

        assert_eq!(store.document_annotations("doc1").len(), 2);
        assert_eq!(store.user_annotations("user_a", "doc1").len(), 1);
        assert_eq!(store.annotation(&id).unwrap().content, "check this");
        assert!(store.document_annotations("missing").is_empty());
    }

    #[test]
    fn test_reserved_id_is_known_until_insert_or_cancel() {
        let store = AnnotationStore::new();
        let a = annotation("doc1", "user_a", AnnotationKind::Comment);
        let id = a.annotation_id.clone();

        assert!(!store.annotation_known(&id));
        store.reserve_annotation_id(&id);
        assert!(store.annotation_known(&id));
        assert!(store.annotation(&id).is_none());

        store.insert_annotation(a);
        assert!(store.annotation_known(&id));
        assert!(store.annotation(&id).is_some());

        store.reserve_annotation_id("annotation_aborted");
        store.cancel_reservation("annotation_aborted");
        assert!(!store.annotation_known("annotation_aborted"));
    }

    #[test]
    fn test_update_annotation() {
        let store = AnnotationStore::new();
        let a = annotation("doc1", "user_a", AnnotationKind::Note);
        let id = a.annotation_id.clone();
        store.insert_annotation(a);

        assert!(store.update_annotation(&id, "revised".into(), Some(Position::on_page(2, 10))));

        let updated = store.annotation(&id).unwrap();
        assert_eq!(updated.content, "revised");
        assert_eq!(updated.position.page, Some(2));
        assert!(updated.updated_at >= updated.created_at);

        assert!(!store.update_annotation("annotation_missing", "x".into(), None));
    }

    #[test]
    fn test_resolve_annotation_is_idempotent() {
        // Literal scenario: resolve twice, both return true, latch holds.
        let store = AnnotationStore::new();
        let a = annotation("doc1", "user_a", AnnotationKind::Comment);
        let id = a.annotation_id.clone();
        store.insert_annotation(a);

        assert!(store.resolve_annotation(&id));
        assert!(store.resolve_annotation(&id));
        assert!(store.annotation(&id).unwrap().is_resolved);

        assert!(!store.resolve_annotation("annotation_missing"));
    }

    #[test]
    fn test_annotation_type_counts() {
        let store = AnnotationStore::new();
        store.insert_annotation(annotation("doc1", "u", AnnotationKind::Comment));
        store.insert_annotation(annotation("doc1", "u", AnnotationKind::Comment));
        store.insert_annotation(annotation("doc1", "u", AnnotationKind::Suggestion));

        let counts = store.annotation_type_counts("doc1");
        assert_eq!(counts.get("comment"), Some(&2));
        assert_eq!(counts.get("suggestion"), Some(&1));
    }

    #[test]
    fn test_comment_thread_depth_first() {
        let store = AnnotationStore::new();
        let root = store.add_comment("doc1", "user_a", "root".into(), None, None);
        let reply1 = store.add_comment("doc1", "user_b", "reply1".into(), Some(root.clone()), None);
        let _nested =
            store.add_comment("doc1", "user_a", "nested".into(), Some(reply1.clone()), None);
        let _reply2 = store.add_comment("doc1", "user_c", "reply2".into(), Some(root.clone()), None);

        let thread = store.thread(&root);
        let contents: Vec<&str> = thread.iter().map(|c| c.content.as_str()).collect();
        // Root first, then depth-first through replies in insertion order
        assert_eq!(contents, vec!["root", "reply1", "nested", "reply2"]);
    }

    #[test]
    fn test_unknown_thread_is_empty() {
        let store = AnnotationStore::new();
        assert!(store.thread("comment_missing").is_empty());
    }

    #[test]
    fn test_resolve_comment() {
        let store = AnnotationStore::new();
        let id = store.add_comment("doc1", "user_a", "hm".into(), None, None);

        assert!(store.resolve_comment(&id));
        assert!(store.resolve_comment(&id));
        assert!(store.document_comments("doc1")[0].is_resolved);
        assert!(!store.resolve_comment("comment_missing"));
    }
}
