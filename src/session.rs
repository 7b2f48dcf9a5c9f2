//! Session registry for collaboration session lifecycle.
//!
//! This module handles:
//! - Session creation, join, leave and end
//! - The participant capacity invariant
//! - Inactivity-based cleanup
//!
//! Sessions are never physically deleted; an ended session stays in the
//! registry flagged inactive so its history remains auditable. Each
//! session sits behind its own mutex so join/leave/cleanup are mutually
//! exclusive per session, which is what keeps the capacity invariant and
//! the "empty means inactive" transition atomic.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::engine::{DocumentId, SessionId, UserId, UserRef};

/// Strategy used to resolve temporally-overlapping edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Pick the edit with the latest timestamp
    LastWriteWins,
    /// Pick the edit with the earliest timestamp
    FirstWriteWins,
    /// Concatenate insert edits in timestamp order into one synthetic
    /// edit. Non-insert edits contribute nothing to the merged content;
    /// a conflict set without any insert falls back to last-write-wins.
    Merge,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self::LastWriteWins
    }
}

/// Per-session collaboration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub allow_anonymous: bool,
    pub require_approval: bool,
    pub auto_save: bool,
    pub conflict_resolution: ConflictPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            allow_anonymous: false,
            require_approval: false,
            auto_save: true,
            conflict_resolution: ConflictPolicy::LastWriteWins,
        }
    }
}

/// State of a collaboration session.
#[derive(Debug, Clone)]
pub struct CollaborativeSession {
    /// Session identifier
    pub session_id: SessionId,
    /// Document being collaborated on
    pub document_id: DocumentId,
    /// Current participants, keyed by user id
    pub participants: HashMap<UserId, UserRef>,
    /// Capacity invariant: participants.len() <= max_participants
    pub max_participants: usize,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last activity timestamp
    pub last_activity: DateTime<Utc>,
    /// Monotonic: once false, never true again
    pub is_active: bool,
    /// Session settings
    pub settings: SessionSettings,
}

impl CollaborativeSession {
    fn new(session_id: SessionId, document_id: DocumentId, max_participants: usize) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            document_id,
            participants: HashMap::new(),
            max_participants,
            created_at: now,
            last_activity: now,
            is_active: true,
            settings: SessionSettings::default(),
        }
    }

    /// Update the last activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.max_participants
    }
}

/// Snapshot of a session's activity, suitable for JSON encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionActivity {
    pub session_id: SessionId,
    pub document_id: DocumentId,
    pub participant_count: usize,
    pub participants: Vec<UserRef>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
    pub settings: SessionSettings,
}

/// Registry owning all collaboration sessions.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Mutex<CollaborativeSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Create a new session for a document. Always succeeds.
    pub fn create(
        &self,
        document_id: &str,
        creator_user_id: &str,
        max_participants: usize,
    ) -> SessionId {
        let suffix: String = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let session_id = format!("collab_{}_{}", document_id, suffix);

        let session = CollaborativeSession::new(
            session_id.clone(),
            document_id.to_string(),
            max_participants,
        );
        self.sessions
            .insert(session_id.clone(), Arc::new(Mutex::new(session)));

        info!(session_id = %session_id, creator = %creator_user_id, "Created collaboration session");
        session_id
    }

    /// Get a session handle by id
    pub fn get(&self, session_id: &str) -> Option<Arc<Mutex<CollaborativeSession>>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Join a session. Returns false if the session is unknown, inactive
    /// or full. Re-joining a session the user is already in returns true
    /// without mutating anything.
    pub fn join(&self, session_id: &str, user: UserRef) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        let mut session = session.lock();

        if !session.is_active {
            return false;
        }
        if session.participants.contains_key(&user.id) {
            return true;
        }
        if session.is_full() {
            return false;
        }

        info!(session_id = %session_id, user = %user.username, "User joined session");
        session.participants.insert(user.id.clone(), user);
        session.touch();
        true
    }

    /// Leave a session. Returns false if the session or the user within
    /// it is unknown. Removing the last participant flips `is_active` to
    /// false under the same lock, so an empty-but-active session is
    /// never observable.
    pub fn leave(&self, session_id: &str, user_id: &str) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        let mut session = session.lock();

        if session.participants.remove(user_id).is_none() {
            return false;
        }
        if session.participants.is_empty() {
            session.is_active = false;
        }
        session.touch();

        info!(session_id = %session_id, user_id = %user_id, "User left session");
        true
    }

    /// End a session, flagging it inactive. Returns false only if the
    /// session is unknown; ending an already-inactive session is a no-op
    /// that still returns true.
    pub fn end(&self, session_id: &str) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        let mut session = session.lock();
        session.is_active = false;

        info!(session_id = %session_id, "Ended collaboration session");
        true
    }

    /// Whether a session exists and is active
    pub fn is_active(&self, session_id: &str) -> bool {
        self.get(session_id)
            .map(|s| s.lock().is_active)
            .unwrap_or(false)
    }

    /// The conflict policy configured for a session
    pub fn policy(&self, session_id: &str) -> Option<ConflictPolicy> {
        self.get(session_id)
            .map(|s| s.lock().settings.conflict_resolution)
    }

    /// Refresh a session's last-activity timestamp. The dispatcher is
    /// the only caller outside this module.
    pub fn touch(&self, session_id: &str) {
        if let Some(session) = self.get(session_id) {
            session.lock().touch();
        }
    }

    /// Current participants of a session; empty if unknown
    pub fn participants(&self, session_id: &str) -> Vec<UserRef> {
        self.get(session_id)
            .map(|s| s.lock().participants.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Activity snapshot for a session
    pub fn activity(&self, session_id: &str) -> Option<SessionActivity> {
        let session = self.get(session_id)?;
        let session = session.lock();
        Some(SessionActivity {
            session_id: session.session_id.clone(),
            document_id: session.document_id.clone(),
            participant_count: session.participant_count(),
            participants: session.participants.values().cloned().collect(),
            created_at: session.created_at,
            last_activity: session.last_activity,
            is_active: session.is_active,
            settings: session.settings.clone(),
        })
    }

    /// Ids of all active sessions on a document
    pub fn active_sessions_for_document(&self, document_id: &str) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|entry| {
                let session = entry.value().lock();
                session.is_active && session.document_id == document_id
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// End all active sessions idle for longer than `max_inactive`.
    /// Returns the ended session ids so the caller can broadcast
    /// session-end events.
    pub fn cleanup_inactive(&self, max_inactive: Duration) -> Vec<SessionId> {
        let now = Utc::now();
        let max_inactive =
            chrono::Duration::from_std(max_inactive).unwrap_or_else(|_| chrono::Duration::hours(1));

        let mut ended = Vec::new();
        for entry in self.sessions.iter() {
            let mut session = entry.value().lock();
            if session.is_active && now - session.last_activity > max_inactive {
                session.is_active = false;
                ended.push(entry.key().clone());
            }
        }

        if !ended.is_empty() {
            info!(count = ended.len(), "Cleaned up inactive sessions");
        }
        ended
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().lock().is_active)
            .count()
    }

    pub fn total_participant_count(&self) -> usize {
        self.sessions
            .iter()
            .map(|entry| entry.value().lock().participant_count())
            .sum()
    }

    /// Per-document view used by collaboration stats: (active session
    /// count, total participants, latest activity timestamp).
    pub fn document_summary(&self, document_id: &str) -> (usize, usize, Option<DateTime<Utc>>) {
        let mut active = 0;
        let mut participants = 0;
        let mut last_activity = None;

        for entry in self.sessions.iter() {
            let session = entry.value().lock();
            if session.document_id != document_id {
                continue;
            }
            if session.is_active {
                active += 1;
            }
            participants += session.participant_count();
            if last_activity.map_or(true, |t| session.last_activity > t) {
                last_activity = Some(session.last_activity);
            }
        }

        (active, participants, last_activity)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
