//! Audit log of semantic document changes.
//!
//! Records carry optional before/after state maps; the key-level diff
//! between them is recomputed on demand rather than stored. The log is
//! bounded per document, evicting the oldest entry past the limit.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

use crate::engine::{DocumentId, UserId};

/// Unique identifier for a change record
pub type ChangeId = String;

/// Free-form key/value state captured around a change
pub type StateMap = serde_json::Map<String, serde_json::Value>;

/// Immutable audit record of one semantic change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub change_id: ChangeId,
    pub document_id: DocumentId,
    pub user_id: UserId,
    pub change_type: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_state: Option<StateMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_state: Option<StateMap>,
    pub timestamp: DateTime<Utc>,
}

/// One changed key in a recomputed diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDiff {
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
}

/// On-demand diff for a change record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeDiff {
    pub change_id: ChangeId,
    pub change_type: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub diff_details: BTreeMap<String, FieldDiff>,
}

/// Per-user activity summary over a trailing day window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserChangeSummary {
    pub user_id: UserId,
    pub total_changes: usize,
    pub changes_by_type: BTreeMap<String, usize>,
    pub time_period_days: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub most_recent_change: Option<DateTime<Utc>>,
}

/// Bounded, append-only change log.
pub struct ChangeLog {
    max_per_document: usize,
    changes: DashMap<DocumentId, VecDeque<ChangeRecord>>,
    index: DashMap<ChangeId, DocumentId>,
}

impl ChangeLog {
    pub fn new(max_per_document: usize) -> Self {
        Self {
            max_per_document,
            changes: DashMap::new(),
            index: DashMap::new(),
        }
    }

    /// Append a change record. Always succeeds; the oldest record is
    /// evicted once the document's log exceeds its bound.
    pub fn track(
        &self,
        document_id: &str,
        user_id: &str,
        change_type: &str,
        description: impl Into<String>,
        before_state: Option<StateMap>,
        after_state: Option<StateMap>,
    ) -> ChangeId {
        let change_id = format!("change_{}", uuid::Uuid::new_v4().simple());

        let record = ChangeRecord {
            change_id: change_id.clone(),
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
            change_type: change_type.to_string(),
            description: description.into(),
            before_state,
            after_state,
            timestamp: Utc::now(),
        };

        let mut entry = self.changes.entry(document_id.to_string()).or_default();
        self.index.insert(change_id.clone(), document_id.to_string());
        entry.push_back(record);

        while entry.len() > self.max_per_document {
            if let Some(evicted) = entry.pop_front() {
                self.index.remove(&evicted.change_id);
            }
        }

        debug!(change_id = %change_id, document_id = %document_id, change_type, "Tracked change");
        change_id
    }

    /// Change history for a document, newest first
    pub fn history(&self, document_id: &str, limit: usize) -> Vec<ChangeRecord> {
        self.changes
            .get(document_id)
            .map(|records| records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    fn record(&self, change_id: &str) -> Option<ChangeRecord> {
        let document_id = self.index.get(change_id)?.clone();
        self.changes
            .get(&document_id)?
            .iter()
            .find(|c| c.change_id == change_id)
            .cloned()
    }

    /// Recompute the key-level before/after diff for a change.
    /// Unknown ids yield `None`.
    pub fn diff(&self, change_id: &str) -> Option<ChangeDiff> {
        let record = self.record(change_id)?;

        let empty = StateMap::new();
        let before = record.before_state.as_ref().unwrap_or(&empty);
        let after = record.after_state.as_ref().unwrap_or(&empty);

        let mut diff_details = BTreeMap::new();
        let keys: std::collections::BTreeSet<&String> =
            before.keys().chain(after.keys()).collect();

        for key in keys {
            let before_value = before.get(key);
            let after_value = after.get(key);
            if before_value != after_value {
                diff_details.insert(
                    key.clone(),
                    FieldDiff {
                        before: before_value.cloned(),
                        after: after_value.cloned(),
                    },
                );
            }
        }

        Some(ChangeDiff {
            change_id: record.change_id,
            change_type: record.change_type,
            description: record.description,
            timestamp: record.timestamp,
            diff_details,
        })
    }

    /// Summarize one user's changes over the trailing `days` window
    pub fn user_summary(&self, user_id: &str, days: i64) -> UserChangeSummary {
        let cutoff = Utc::now() - chrono::Duration::days(days);

        let mut total = 0;
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut most_recent: Option<DateTime<Utc>> = None;

        for entry in self.changes.iter() {
            for record in entry.value().iter() {
                if record.user_id != user_id || record.timestamp < cutoff {
                    continue;
                }
                total += 1;
                *by_type.entry(record.change_type.clone()).or_insert(0) += 1;
                if most_recent.map_or(true, |t| record.timestamp > t) {
                    most_recent = Some(record.timestamp);
                }
            }
        }

        UserChangeSummary {
            user_id: user_id.to_string(),
            total_changes: total,
            changes_by_type: by_type,
            time_period_days: days,
            most_recent_change: most_recent,
        }
    }

    pub fn total_change_count(&self) -> usize {
        self.changes.iter().map(|e| e.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(pairs: &[(&str, serde_json::Value)]) -> StateMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_track_and_history() {
        let log = ChangeLog::new(1000);
        log.track("doc1", "user_a", "edit", "first", None, None);
        log.track("doc1", "user_a", "annotation", "second", None, None);

        let history = log.history("doc1", 100);
        assert_eq!(history.len(), 2);
        // Newest first
        assert_eq!(history[0].description, "second");
        assert_eq!(history[1].description, "first");

        assert!(log.history("missing", 100).is_empty());
    }

    #[test]
    fn test_bounded_eviction() {
        let log = ChangeLog::new(3);
        let first = log.track("doc1", "user_a", "edit", "one", None, None);
        for i in 0..3 {
            log.track("doc1", "user_a", "edit", format!("more {}", i), None, None);
        }

        assert_eq!(log.history("doc1", 100).len(), 3);
        // The evicted record is gone from the index too
        assert!(log.diff(&first).is_none());
    }

    #[test]
    fn test_diff_reports_changed_keys_only() {
        let log = ChangeLog::new(1000);
        let id = log.track(
            "doc1",
            "user_a",
            "metadata",
            "retitled",
            Some(state(&[("title", json!("Old")), ("pages", json!(4))])),
            Some(state(&[("title", json!("New")), ("pages", json!(4)), ("tag", json!("v2"))])),
        );

        let diff = log.diff(&id).unwrap();
        assert_eq!(diff.diff_details.len(), 2);
        assert_eq!(diff.diff_details["title"].before, Some(json!("Old")));
        assert_eq!(diff.diff_details["title"].after, Some(json!("New")));
        assert_eq!(diff.diff_details["tag"].before, None);
        assert!(!diff.diff_details.contains_key("pages"));
    }

    #[test]
    fn test_diff_with_missing_states() {
        let log = ChangeLog::new(1000);
        let id = log.track(
            "doc1",
            "user_a",
            "create",
            "created",
            None,
            Some(state(&[("title", json!("New"))])),
        );

        let diff = log.diff(&id).unwrap();
        assert_eq!(diff.diff_details["title"].after, Some(json!("New")));

        assert!(log.diff("change_missing").is_none());
    }

    #[test]
    fn test_user_summary() {
        let log = ChangeLog::new(1000);
        log.track("doc1", "user_a", "edit", "a", None, None);
        log.track("doc2", "user_a", "edit", "b", None, None);
        log.track("doc1", "user_a", "annotation", "c", None, None);
        log.track("doc1", "user_b", "edit", "d", None, None);

        let summary = log.user_summary("user_a", 7);
        assert_eq!(summary.total_changes, 3);
        assert_eq!(summary.changes_by_type.get("edit"), Some(&2));
        assert_eq!(summary.changes_by_type.get("annotation"), Some(&1));
        assert!(summary.most_recent_change.is_some());

        let none = log.user_summary("user_z", 7);
        assert_eq!(none.total_changes, 0);
        assert!(none.most_recent_change.is_none());
    }
}
