//! Core types shared across the collaboration engine.
//!
//! This module defines:
//! - Identifier aliases used throughout the engine
//! - The edit operation record and its position locator
//! - Engine-wide configuration with explicit timing windows
//! - The engine error type

pub mod core;

pub use core::CollaborationEngine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unique identifier for a document
pub type DocumentId = String;

/// Unique identifier for a collaboration session
pub type SessionId = String;

/// Unique identifier for a user
pub type UserId = String;

/// Unique identifier for a single edit operation
pub type EditId = String;

/// Result type for engine operations
pub type CollabResult<T> = Result<T, CollabError>;

/// Pseudo-user that merged edits are attributed to
pub const SYSTEM_MERGE_USER: &str = "system_merge";

/// Reference to a user, provided by the external auth directory.
///
/// Treated as opaque and read-only; the engine never validates or
/// enriches it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
    pub username: String,
}

impl UserRef {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

/// Structured locator for a position inside a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Page number (1-based), if the document is paginated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Character offset within the page (or document, if unpaginated)
    #[serde(default)]
    pub offset: u64,
    /// Named anchor the position is relative to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
}

impl Position {
    pub fn at_offset(offset: u64) -> Self {
        Self {
            page: None,
            offset,
            anchor: None,
        }
    }

    pub fn on_page(page: u32, offset: u64) -> Self {
        Self {
            page: Some(page),
            offset,
            anchor: None,
        }
    }

    /// Whether two positions target the same window of the document.
    ///
    /// Positions on different pages or different anchors never overlap;
    /// otherwise they overlap when their offsets are within `window` units
    /// of each other.
    pub fn overlaps(&self, other: &Position, window: u64) -> bool {
        if self.page != other.page || self.anchor != other.anchor {
            return false;
        }
        self.offset.abs_diff(other.offset) <= window
    }
}

/// The kind of a collaborative edit operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditKind {
    Insert,
    Delete,
    Replace,
    Format,
}

/// A single collaborative edit. Immutable once created; a resolution
/// decision supersedes losing edits rather than mutating them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborativeEdit {
    pub edit_id: EditId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub kind: EditKind,
    pub position: Position,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// The document version this edit targets
    pub version: u64,
    /// Causal ordering hint from the client, carried but not enforced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<u64>,
}

impl CollaborativeEdit {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        kind: EditKind,
        position: Position,
        content: impl Into<String>,
    ) -> Self {
        Self {
            edit_id: format!("edit_{}", uuid::Uuid::new_v4().simple()),
            session_id: session_id.into(),
            user_id: user_id.into(),
            kind,
            position,
            content: content.into(),
            timestamp: Utc::now(),
            version: 1,
            previous_version: None,
        }
    }

    pub fn with_version(mut self, version: u64, previous: Option<u64>) -> Self {
        self.version = version;
        self.previous_version = previous;
        self
    }
}

/// Errors that can occur inside the engine.
///
/// Expected-use conditions (unknown ids, full sessions) never surface as
/// errors across the public boundary; they come back as `false`, `None`
/// or empty collections instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollabError {
    #[error("Operation queue is full")]
    QueueFull,

    #[error("Operation queue is closed")]
    QueueClosed,

    #[error("Dispatcher is not running")]
    NotStarted,
}

/// Engine configuration.
///
/// The coalescing window and inactivity threshold are explicit values
/// here rather than constants buried in the dispatch and cleanup paths.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default participant capacity for new sessions
    pub default_max_participants: usize,
    /// Capacity of the shared operation queue
    pub queue_capacity: usize,
    /// Capacity of each connected client's delivery channel
    pub client_channel_capacity: usize,
    /// Two edits enqueued within this window are conflict-checked
    pub coalesce_window: Duration,
    /// Offset distance within which two positions are considered overlapping
    pub position_window: u64,
    /// Sessions idle longer than this are ended by the cleanup task
    pub session_timeout: Duration,
    /// How often the cleanup task runs
    pub cleanup_interval: Duration,
    /// Per-user notification log bound (oldest evicted first)
    pub max_notifications_per_user: usize,
    /// Per-document change log bound (oldest evicted first)
    pub max_changes_per_document: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_participants: 10,
            queue_capacity: 1024,
            client_channel_capacity: 256,
            coalesce_window: Duration::from_millis(500),
            position_window: 8,
            session_timeout: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(60),
            max_notifications_per_user: 100,
            max_changes_per_document: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_overlap() {
        let a = Position::at_offset(10);
        let b = Position::at_offset(14);
        assert!(a.overlaps(&b, 8));
        assert!(!a.overlaps(&b, 2));

        // Different pages never overlap
        let c = Position::on_page(1, 10);
        let d = Position::on_page(2, 10);
        assert!(!c.overlaps(&d, 100));

        // Anchored positions only overlap within the same anchor
        let mut e = Position::at_offset(0);
        e.anchor = Some("figure-3".to_string());
        assert!(!e.overlaps(&Position::at_offset(0), 8));
    }

    #[test]
    fn test_edit_ids_are_unique() {
        let a = CollaborativeEdit::new("s1", "u1", EditKind::Insert, Position::default(), "x");
        let b = CollaborativeEdit::new("s1", "u1", EditKind::Insert, Position::default(), "x");
        assert_ne!(a.edit_id, b.edit_id);
        assert!(a.edit_id.starts_with("edit_"));
    }

    #[test]
    fn test_edit_kind_serde() {
        let json = serde_json::to_string(&EditKind::Insert).unwrap();
        assert_eq!(json, "\"insert\"");
        let kind: EditKind = serde_json::from_str("\"format\"").unwrap();
        assert_eq!(kind, EditKind::Format);
    }

    #[test]
    fn test_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.default_max_participants, 10);
        assert_eq!(config.max_changes_per_document, 1000);
        assert_eq!(config.coalesce_window, Duration::from_millis(500));
    }
}
