//! The collaboration engine: one context object owning the session
//! registry, the operation queue, the stores and the client fan-out.
//!
//! Construction wires everything together but spawns nothing; callers
//! drive the lifecycle with `start()` and `stop()`. Producers enqueue
//! through the engine's public methods, the dispatcher task is the
//! single consumer, and a second background task sweeps inactive
//! sessions on a fixed interval.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast as tokio_broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broadcast::{ClientRegistry, ServerEvent};
use crate::dispatch::{AnnotationOp, Dispatcher, Operation};
use crate::engine::{
    CollabError, CollabResult, CollaborativeEdit, DocumentId, EditId, EditKind, EngineConfig,
    Position, SessionId, UserId, UserRef,
};
use crate::notify::{Notification, NotificationCenter, NotificationStats};
use crate::session::{SessionActivity, SessionRegistry};
use crate::store::annotations::{AnnotationId, AnnotationKind, Comment, CommentId, DocumentAnnotation};
use crate::store::changes::{ChangeDiff, ChangeId, ChangeRecord, StateMap, UserChangeSummary};
use crate::store::versions::{DocumentVersion, VersionDiff, VersionId};
use crate::store::{AnnotationStore, ChangeLog, VersionStore};

/// Per-document collaboration snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CollaborationStats {
    pub document_id: DocumentId,
    pub active_sessions: usize,
    pub total_participants: usize,
    pub annotation_count: usize,
    pub version_count: usize,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Whole-engine snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub total_participants: usize,
    pub connected_clients: usize,
    pub total_annotations: usize,
    pub total_versions: usize,
    pub total_comments: usize,
    pub total_notifications: usize,
    pub total_changes: usize,
}

/// Cross-store per-document overview.
#[derive(Debug, Clone, Serialize)]
pub struct CollaborationOverview {
    pub document_id: DocumentId,
    pub active_sessions: usize,
    pub total_participants: usize,
    pub annotations_by_type: BTreeMap<String, usize>,
    pub comment_count: usize,
    pub version_count: usize,
    pub recent_changes: Vec<ChangeRecord>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Central context object for the collaboration subsystem.
pub struct CollaborationEngine {
    config: EngineConfig,
    registry: Arc<SessionRegistry>,
    versions: Arc<VersionStore>,
    annotations: Arc<AnnotationStore>,
    changes: Arc<ChangeLog>,
    notifications: Arc<NotificationCenter>,
    clients: Arc<ClientRegistry>,
    dispatcher: Arc<Dispatcher>,
    op_tx: mpsc::Sender<Operation>,
    /// Taken by the first `start()`
    op_rx: Mutex<Option<mpsc::Receiver<Operation>>>,
    shutdown_tx: tokio_broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CollaborationEngine {
    pub fn new(config: EngineConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let versions = Arc::new(VersionStore::new());
        let annotations = Arc::new(AnnotationStore::new());
        let changes = Arc::new(ChangeLog::new(config.max_changes_per_document));
        let notifications = Arc::new(NotificationCenter::new(config.max_notifications_per_user));
        let clients = Arc::new(ClientRegistry::new(config.client_channel_capacity));

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            versions.clone(),
            annotations.clone(),
            changes.clone(),
            clients.clone(),
            &config,
        ));

        let (op_tx, op_rx) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, _) = tokio_broadcast::channel(4);

        Self {
            config,
            registry,
            versions,
            annotations,
            changes,
            notifications,
            clients,
            dispatcher,
            op_tx,
            op_rx: Mutex::new(Some(op_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    // ---- lifecycle ----

    /// Spawn the dispatcher and cleanup tasks. Calling `start` on an
    /// already-running engine is a no-op.
    pub fn start(&self) {
        let Some(op_rx) = self.op_rx.lock().take() else {
            warn!("Engine already started");
            return;
        };

        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown_tx.subscribe();
        let dispatch_task = tokio::spawn(dispatcher.run(op_rx, shutdown));

        let registry = self.registry.clone();
        let clients = self.clients.clone();
        let timeout = self.config.session_timeout;
        let sweep_every = self.config.cleanup_interval;
        let mut shutdown = self.shutdown_tx.subscribe();
        let cleanup_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for session_id in registry.cleanup_inactive(timeout) {
                            let targets: Vec<UserId> = registry
                                .participants(&session_id)
                                .into_iter()
                                .map(|u| u.id)
                                .collect();
                            clients.broadcast(
                                &targets,
                                &ServerEvent::SessionEnded {
                                    session_id,
                                    timestamp: Utc::now(),
                                },
                            );
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });

        self.tasks.lock().extend([dispatch_task, cleanup_task]);
        info!("Collaboration engine started");
    }

    /// Stop the background tasks. The dispatcher drains the queue and
    /// flushes buffered edits before exiting.
    pub async fn stop(&self) -> CollabResult<()> {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return Err(CollabError::NotStarted);
        }

        let _ = self.shutdown_tx.send(());
        for task in tasks {
            let _ = task.await;
        }
        info!("Collaboration engine stopped");
        Ok(())
    }

    // ---- live clients ----

    /// Register a live client for event fan-out. Returns the event
    /// receiver plus the display color assigned to the client.
    pub fn register_client(&self, user: UserRef) -> (mpsc::Receiver<ServerEvent>, String) {
        self.clients.register(user)
    }

    pub fn unregister_client(&self, user_id: &str) -> bool {
        self.clients.unregister(user_id)
    }

    /// Currently connected clients with their connection timestamps
    pub fn connected_clients(&self) -> Vec<(UserRef, DateTime<Utc>)> {
        self.clients.connected_clients()
    }

    // ---- sessions ----

    /// Create a session on a document and join the creator to it.
    pub fn create_session(
        &self,
        document_id: &str,
        creator: UserRef,
        max_participants: Option<usize>,
    ) -> SessionId {
        let capacity = max_participants.unwrap_or(self.config.default_max_participants);
        let session_id = self.registry.create(document_id, &creator.id, capacity);
        self.registry.join(&session_id, creator.clone());

        self.changes.track(
            document_id,
            &creator.id,
            "session_created",
            format!("Started collaboration session {}", session_id),
            None,
            None,
        );
        self.broadcast_to_session(
            &session_id,
            ServerEvent::ParticipantJoined {
                session_id: session_id.clone(),
                color: self.clients.client_color(&creator.id),
                user: creator,
            },
        );
        session_id
    }

    /// Join a user to a session. False if the session is unknown,
    /// inactive or full.
    pub fn join_session(&self, session_id: &str, user: UserRef) -> bool {
        if !self.registry.join(session_id, user.clone()) {
            return false;
        }
        self.broadcast_to_session(
            session_id,
            ServerEvent::ParticipantJoined {
                session_id: session_id.to_string(),
                color: self.clients.client_color(&user.id),
                user,
            },
        );
        true
    }

    /// Remove a user from a session. A session emptied by this call
    /// becomes inactive in the same step.
    pub fn leave_session(&self, session_id: &str, user_id: &str) -> bool {
        if !self.registry.leave(session_id, user_id) {
            return false;
        }
        self.broadcast_to_session(
            session_id,
            ServerEvent::ParticipantLeft {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
            },
        );
        true
    }

    /// End a session explicitly. Idempotent; false only for unknown ids.
    pub fn end_session(&self, session_id: &str) -> bool {
        if !self.registry.end(session_id) {
            return false;
        }
        self.broadcast_to_session(
            session_id,
            ServerEvent::SessionEnded {
                session_id: session_id.to_string(),
                timestamp: Utc::now(),
            },
        );
        true
    }

    pub fn session_participants(&self, session_id: &str) -> Vec<UserRef> {
        self.registry.participants(session_id)
    }

    pub fn session_activity(&self, session_id: &str) -> Option<SessionActivity> {
        self.registry.activity(session_id)
    }

    /// Sweep sessions idle past the configured timeout, returning the
    /// ids that were ended.
    pub fn cleanup_inactive_sessions(&self) -> Vec<SessionId> {
        let ended = self.registry.cleanup_inactive(self.config.session_timeout);
        for session_id in &ended {
            self.broadcast_to_session(
                session_id,
                ServerEvent::SessionEnded {
                    session_id: session_id.clone(),
                    timestamp: Utc::now(),
                },
            );
        }
        ended
    }

    // ---- edits & cursors ----

    /// Enqueue a collaborative edit. Returns the minted edit id, or
    /// `None` if the session is unknown or inactive or the queue is
    /// full. Acceptance into a document version is decided later by
    /// the dispatcher.
    pub fn apply_collaborative_edit(
        &self,
        session_id: &str,
        user_id: &str,
        kind: EditKind,
        position: Position,
        content: impl Into<String>,
        previous_version: Option<u64>,
    ) -> Option<EditId> {
        let session = self.registry.get(session_id)?;
        let document_id = {
            let session = session.lock();
            if !session.is_active {
                warn!(session_id = %session_id, "Edit rejected: session inactive");
                return None;
            }
            session.document_id.clone()
        };

        let version = self.versions.next_version_number(&document_id);
        let edit = CollaborativeEdit::new(session_id, user_id, kind, position, content)
            .with_version(version, previous_version);
        let edit_id = edit.edit_id.clone();

        self.enqueue(Operation::Edit { edit }).then_some(edit_id)
    }

    /// Forward a cursor position to the session's other participants.
    /// Cursor updates are never persisted.
    pub fn submit_cursor(&self, session_id: &str, user_id: &str, position: Position) -> bool {
        if !self.registry.is_active(session_id) {
            return false;
        }
        self.enqueue(Operation::Cursor {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            position,
        })
    }

    // ---- annotations ----

    /// Enqueue a new annotation. The id is minted here so callers can
    /// reference it immediately; the store write happens in dispatch
    /// order.
    pub fn add_annotation(
        &self,
        document_id: &str,
        user_id: &str,
        kind: AnnotationKind,
        content: impl Into<String>,
        position: Position,
    ) -> Option<AnnotationId> {
        let annotation = DocumentAnnotation::new(document_id, user_id, kind, content, position);
        let annotation_id = annotation.annotation_id.clone();
        // Reserve before enqueueing so a follow-up update or resolve
        // on the fresh id is accepted while the insert is in flight
        self.annotations.reserve_annotation_id(&annotation_id);
        if self.enqueue(Operation::Annotation {
            op: AnnotationOp::Add { annotation },
        }) {
            Some(annotation_id)
        } else {
            self.annotations.cancel_reservation(&annotation_id);
            None
        }
    }

    /// Enqueue an annotation content/position update. False if the
    /// annotation is unknown at call time or the queue is full.
    pub fn update_annotation(
        &self,
        annotation_id: &str,
        content: String,
        position: Option<Position>,
    ) -> bool {
        if !self.annotations.annotation_known(annotation_id) {
            return false;
        }
        self.enqueue(Operation::Annotation {
            op: AnnotationOp::Update {
                annotation_id: annotation_id.to_string(),
                content,
                position,
            },
        })
    }

    /// Enqueue an annotation resolve. Resolving twice is not an error.
    pub fn resolve_annotation(&self, annotation_id: &str) -> bool {
        if !self.annotations.annotation_known(annotation_id) {
            return false;
        }
        self.enqueue(Operation::Annotation {
            op: AnnotationOp::Resolve {
                annotation_id: annotation_id.to_string(),
            },
        })
    }

    pub fn get_annotation(&self, annotation_id: &str) -> Option<DocumentAnnotation> {
        self.annotations.annotation(annotation_id)
    }

    pub fn document_annotations(&self, document_id: &str) -> Vec<DocumentAnnotation> {
        self.annotations.document_annotations(document_id)
    }

    pub fn user_annotations(&self, user_id: &str, document_id: &str) -> Vec<DocumentAnnotation> {
        self.annotations.user_annotations(user_id, document_id)
    }

    // ---- versions ----

    /// Snapshot a document version, folding in every edit accepted
    /// since the previous snapshot.
    pub fn create_document_version(
        &self,
        document_id: &str,
        content_snapshot: String,
        created_by: &str,
        description: Option<String>,
    ) -> VersionId {
        let accepted = self.versions.take_pending(document_id);
        let edit_count = accepted.len();
        let version_id = self.versions.create_version(
            document_id,
            content_snapshot,
            accepted,
            created_by,
            description,
        );

        self.changes.track(
            document_id,
            created_by,
            "version_created",
            format!("Created {} from {} edits", version_id, edit_count),
            None,
            None,
        );
        version_id
    }

    pub fn document_versions(&self, document_id: &str) -> Vec<DocumentVersion> {
        self.versions.versions(document_id)
    }

    pub fn version_diff(&self, document_id: &str, from: u64, to: u64) -> Option<VersionDiff> {
        self.versions.diff(document_id, from, to)
    }

    // ---- comments ----

    pub fn add_comment(
        &self,
        document_id: &str,
        user_id: &str,
        content: String,
        parent_comment_id: Option<CommentId>,
        position: Option<Position>,
    ) -> CommentId {
        self.annotations
            .add_comment(document_id, user_id, content, parent_comment_id, position)
    }

    pub fn document_comments(&self, document_id: &str) -> Vec<Comment> {
        self.annotations.document_comments(document_id)
    }

    pub fn resolve_comment(&self, comment_id: &str) -> bool {
        self.annotations.resolve_comment(comment_id)
    }

    /// A root comment and its replies, depth-first
    pub fn comment_thread(&self, root_comment_id: &str) -> Vec<Comment> {
        self.annotations.thread(root_comment_id)
    }

    // ---- notifications ----

    /// Record a notification and push it to the user's live connection
    /// if one exists.
    pub fn send_notification(
        &self,
        user_id: &str,
        kind: &str,
        title: impl Into<String>,
        message: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) -> Notification {
        let notification = self
            .notifications
            .send(user_id, kind, title, message, metadata);
        self.clients.send_to_user(
            user_id,
            ServerEvent::Notification {
                notification: notification.clone(),
            },
        );
        notification
    }

    pub fn user_notifications(
        &self,
        user_id: &str,
        unread_only: bool,
        limit: usize,
    ) -> Vec<Notification> {
        self.notifications.user_notifications(user_id, unread_only, limit)
    }

    pub fn mark_notification_read(&self, user_id: &str, notification_id: &str) -> bool {
        self.notifications.mark_read(user_id, notification_id)
    }

    pub fn mark_all_notifications_read(&self, user_id: &str) -> usize {
        self.notifications.mark_all_read(user_id)
    }

    pub fn notification_stats(&self, user_id: &str) -> NotificationStats {
        self.notifications.stats(user_id)
    }

    // ---- change tracking ----

    pub fn track_document_change(
        &self,
        document_id: &str,
        user_id: &str,
        change_type: &str,
        description: impl Into<String>,
        before_state: Option<StateMap>,
        after_state: Option<StateMap>,
    ) -> ChangeId {
        self.changes
            .track(document_id, user_id, change_type, description, before_state, after_state)
    }

    pub fn document_change_history(&self, document_id: &str, limit: usize) -> Vec<ChangeRecord> {
        self.changes.history(document_id, limit)
    }

    pub fn change_diff(&self, change_id: &str) -> Option<ChangeDiff> {
        self.changes.diff(change_id)
    }

    pub fn user_change_summary(&self, user_id: &str, days: i64) -> UserChangeSummary {
        self.changes.user_summary(user_id, days)
    }

    // ---- introspection ----

    pub fn collaboration_stats(&self, document_id: &str) -> CollaborationStats {
        let (active_sessions, total_participants, last_activity) =
            self.registry.document_summary(document_id);
        CollaborationStats {
            document_id: document_id.to_string(),
            active_sessions,
            total_participants,
            annotation_count: self.annotations.annotation_count(document_id),
            version_count: self.versions.version_count(document_id),
            last_activity,
        }
    }

    pub fn realtime_stats(&self) -> RealtimeStats {
        RealtimeStats {
            total_sessions: self.registry.session_count(),
            active_sessions: self.registry.active_session_count(),
            total_participants: self.registry.total_participant_count(),
            connected_clients: self.clients.connected_count(),
            total_annotations: self.annotations.total_annotation_count(),
            total_versions: self.versions.total_version_count(),
            total_comments: self.annotations.total_comment_count(),
            total_notifications: self.notifications.total_count(),
            total_changes: self.changes.total_change_count(),
        }
    }

    pub fn collaboration_overview(&self, document_id: &str) -> CollaborationOverview {
        let (active_sessions, total_participants, last_activity) =
            self.registry.document_summary(document_id);
        CollaborationOverview {
            document_id: document_id.to_string(),
            active_sessions,
            total_participants,
            annotations_by_type: self.annotations.annotation_type_counts(document_id),
            comment_count: self.annotations.document_comments(document_id).len(),
            version_count: self.versions.version_count(document_id),
            recent_changes: self.changes.history(document_id, 10),
            last_activity,
        }
    }

    // ---- internals ----

    fn enqueue(&self, op: Operation) -> bool {
        match self.op_tx.try_send(op) {
            Ok(()) => true,
            Err(err) => {
                warn!("Operation rejected: {}", CollabError::from(err));
                false
            }
        }
    }

    fn broadcast_to_session(&self, session_id: &str, event: ServerEvent) {
        let targets: Vec<UserId> = self
            .registry
            .participants(session_id)
            .into_iter()
            .map(|u| u.id)
            .collect();
        self.clients.broadcast(&targets, &event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            coalesce_window: Duration::ZERO,
            cleanup_interval: Duration::from_millis(20),
            ..EngineConfig::default()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_edit_flows_into_next_version() {
        let engine = CollaborationEngine::new(fast_config());
        engine.start();

        let session_id = engine.create_session("doc1", UserRef::new("user_a", "Alice"), None);
        let edit_id = engine
            .apply_collaborative_edit(
                &session_id,
                "user_a",
                EditKind::Insert,
                Position::at_offset(0),
                "Hello",
                None,
            )
            .unwrap();
        settle().await;

        let version_id =
            engine.create_document_version("doc1", "Hello".to_string(), "user_a", None);
        assert_eq!(version_id, "version_doc1_1");

        let versions = engine.document_versions("doc1");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].changes.len(), 1);
        assert_eq!(versions[0].changes[0].edit_id, edit_id);
        assert_eq!(versions[0].changes[0].version, 1);

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_edit_rejected_for_inactive_session() {
        let engine = CollaborationEngine::new(fast_config());
        engine.start();

        let session_id = engine.create_session("doc1", UserRef::new("user_a", "Alice"), None);
        assert!(engine.end_session(&session_id));

        let rejected = engine.apply_collaborative_edit(
            &session_id,
            "user_a",
            EditKind::Insert,
            Position::at_offset(0),
            "late",
            None,
        );
        assert!(rejected.is_none());
        assert!(engine
            .apply_collaborative_edit(
                "collab_ghost_00000000",
                "user_a",
                EditKind::Insert,
                Position::at_offset(0),
                "ghost",
                None,
            )
            .is_none());

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_flushes_queued_edits() {
        let engine = CollaborationEngine::new(EngineConfig {
            coalesce_window: Duration::from_secs(60),
            ..EngineConfig::default()
        });
        engine.start();

        let session_id = engine.create_session("doc1", UserRef::new("user_a", "Alice"), None);
        engine
            .apply_collaborative_edit(
                &session_id,
                "user_a",
                EditKind::Insert,
                Position::at_offset(0),
                "buffered",
                None,
            )
            .unwrap();

        engine.stop().await.unwrap();

        let version_id =
            engine.create_document_version("doc1", "buffered".to_string(), "user_a", None);
        let versions = engine.document_versions("doc1");
        assert_eq!(versions[0].version_id, version_id);
        assert_eq!(versions[0].changes.len(), 1);
    }

    #[tokio::test]
    async fn test_annotation_lifecycle_through_queue() {
        let engine = CollaborationEngine::new(fast_config());
        engine.start();

        let annotation_id = engine
            .add_annotation(
                "doc1",
                "user_a",
                AnnotationKind::Highlight,
                "important",
                Position::on_page(2, 10),
            )
            .unwrap();
        settle().await;

        assert!(engine.update_annotation(&annotation_id, "still important".to_string(), None));
        assert!(engine.resolve_annotation(&annotation_id));
        settle().await;

        let annotation = engine.get_annotation(&annotation_id).unwrap();
        assert_eq!(annotation.content, "still important");
        assert!(annotation.is_resolved);

        // Unknown ids come back false, not an error
        assert!(!engine.update_annotation("annotation_missing", "x".to_string(), None));
        assert!(!engine.resolve_annotation("annotation_missing"));

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_right_after_add_is_applied() {
        let engine = CollaborationEngine::new(fast_config());
        engine.start();

        // No waiting between the calls: the insert is still in the
        // queue when the update and resolve are submitted
        let annotation_id = engine
            .add_annotation(
                "doc1",
                "user_a",
                AnnotationKind::Comment,
                "first draft",
                Position::at_offset(0),
            )
            .unwrap();
        assert!(engine.update_annotation(&annotation_id, "second draft".to_string(), None));
        assert!(engine.resolve_annotation(&annotation_id));
        settle().await;

        let annotation = engine.get_annotation(&annotation_id).unwrap();
        assert_eq!(annotation.content, "second draft");
        assert!(annotation.is_resolved);

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_capacity_and_reuse() {
        let engine = CollaborationEngine::new(fast_config());
        let session_id = engine.create_session("doc1", UserRef::new("user_a", "Alice"), Some(2));

        assert!(engine.join_session(&session_id, UserRef::new("user_b", "Bob")));
        assert!(!engine.join_session(&session_id, UserRef::new("user_c", "Cara")));

        assert!(engine.leave_session(&session_id, "user_a"));
        assert!(engine.join_session(&session_id, UserRef::new("user_c", "Cara")));

        assert!(engine.leave_session(&session_id, "user_b"));
        assert!(engine.leave_session(&session_id, "user_c"));
        assert!(engine.session_participants(&session_id).is_empty());
        // Emptied sessions go inactive and reject joins
        assert!(!engine.join_session(&session_id, UserRef::new("user_d", "Dan")));
    }

    #[tokio::test]
    async fn test_live_client_receives_session_events() {
        let engine = CollaborationEngine::new(fast_config());
        let session_id = engine.create_session("doc1", UserRef::new("user_a", "Alice"), None);
        let (mut rx_a, _color) = engine.register_client(UserRef::new("user_a", "Alice"));

        engine.join_session(&session_id, UserRef::new("user_b", "Bob"));
        match rx_a.recv().await.unwrap() {
            ServerEvent::ParticipantJoined { user, .. } => assert_eq!(user.id, "user_b"),
            other => panic!("Unexpected event: {:?}", other),
        }

        engine.end_session(&session_id);
        match rx_a.recv().await.unwrap() {
            ServerEvent::SessionEnded { session_id: ended, .. } => assert_eq!(ended, session_id),
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_notification_pushed_to_live_client() {
        let engine = CollaborationEngine::new(fast_config());
        let (mut rx, _) = engine.register_client(UserRef::new("user_a", "Alice"));

        let sent = engine.send_notification("user_a", "mention", "Ping", "You were mentioned", None);
        match rx.recv().await.unwrap() {
            ServerEvent::Notification { notification } => {
                assert_eq!(notification.notification_id, sent.notification_id);
            }
            other => panic!("Unexpected event: {:?}", other),
        }

        assert!(engine.mark_notification_read("user_a", &sent.notification_id));
        assert_eq!(engine.user_notifications("user_a", true, 10).len(), 0);
    }

    #[tokio::test]
    async fn test_inactive_sessions_swept_in_background() {
        let engine = CollaborationEngine::new(EngineConfig {
            session_timeout: Duration::ZERO,
            cleanup_interval: Duration::from_millis(10),
            coalesce_window: Duration::ZERO,
            ..EngineConfig::default()
        });
        engine.start();

        let session_id = engine.create_session("doc1", UserRef::new("user_a", "Alice"), None);
        settle().await;

        assert!(!engine.registry.is_active(&session_id));
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_reflect_stores() {
        let engine = CollaborationEngine::new(fast_config());
        engine.start();

        let session_id = engine.create_session("doc1", UserRef::new("user_a", "Alice"), None);
        engine.join_session(&session_id, UserRef::new("user_b", "Bob"));
        engine
            .add_annotation("doc1", "user_a", AnnotationKind::Note, "n", Position::at_offset(3))
            .unwrap();
        engine.add_comment("doc1", "user_b", "first".to_string(), None, None);
        settle().await;
        engine.create_document_version("doc1", "v1".to_string(), "user_a", None);

        let stats = engine.collaboration_stats("doc1");
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.total_participants, 2);
        assert_eq!(stats.annotation_count, 1);
        assert_eq!(stats.version_count, 1);
        assert!(stats.last_activity.is_some());

        let overview = engine.collaboration_overview("doc1");
        assert_eq!(overview.comment_count, 1);
        assert_eq!(overview.annotations_by_type.get("note"), Some(&1));
        assert!(!overview.recent_changes.is_empty());

        let global = engine.realtime_stats();
        assert_eq!(global.total_sessions, 1);
        assert_eq!(global.total_participants, 2);
        assert_eq!(global.total_comments, 1);

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_start_errors() {
        let engine = CollaborationEngine::new(fast_config());
        assert!(matches!(engine.stop().await, Err(CollabError::NotStarted)));
    }

    #[tokio::test]
    async fn test_version_numbers_stay_gapless_across_sessions() {
        let engine = CollaborationEngine::new(fast_config());
        engine.start();

        let s1 = engine.create_session("doc1", UserRef::new("user_a", "Alice"), None);
        engine
            .apply_collaborative_edit(&s1, "user_a", EditKind::Insert, Position::at_offset(0), "a", None)
            .unwrap();
        settle().await;
        engine.create_document_version("doc1", "a".to_string(), "user_a", None);

        let s2 = engine.create_session("doc1", UserRef::new("user_b", "Bob"), None);
        engine
            .apply_collaborative_edit(&s2, "user_b", EditKind::Insert, Position::at_offset(200), "b", None)
            .unwrap();
        settle().await;
        engine.create_document_version("doc1", "ab".to_string(), "user_b", None);

        let versions = engine.document_versions("doc1");
        let numbers: Vec<u64> = versions.iter().map(|v| v.version_number).collect();
        assert_eq!(numbers, vec![1, 2]);
        // The second edit targeted version 2
        assert_eq!(versions[1].changes[0].version, 2);

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_producers_keep_their_own_order() {
        let engine = Arc::new(CollaborationEngine::new(fast_config()));
        engine.start();

        let session_id =
            engine.create_session("doc1", UserRef::new("user_0", "P0"), Some(10));
        for producer in 1..3u64 {
            let user = UserRef::new(format!("user_{producer}"), format!("P{producer}"));
            assert!(engine.join_session(&session_id, user));
        }

        // Each producer submits through the shared queue from its own
        // task, at offsets that never overlap anything else
        let mut producers = Vec::new();
        for producer in 0..3u64 {
            let engine = engine.clone();
            let session_id = session_id.clone();
            producers.push(tokio::spawn(async move {
                for seq in 0..10u64 {
                    engine
                        .apply_collaborative_edit(
                            &session_id,
                            &format!("user_{producer}"),
                            EditKind::Insert,
                            Position::at_offset(producer * 100_000 + seq * 1_000),
                            format!("p{producer}-{seq}"),
                            None,
                        )
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in producers {
            handle.await.unwrap();
        }
        settle().await;

        engine.create_document_version("doc1", "all".to_string(), "user_0", None);
        let versions = engine.document_versions("doc1");
        let applied: Vec<String> =
            versions[0].changes.iter().map(|e| e.content.clone()).collect();
        assert_eq!(applied.len(), 30);
        for producer in 0..3u64 {
            let mine: Vec<&String> = applied
                .iter()
                .filter(|c| c.starts_with(&format!("p{producer}-")))
                .collect();
            let expected: Vec<String> =
                (0..10u64).map(|seq| format!("p{producer}-{seq}")).collect();
            assert_eq!(mine.len(), 10);
            for (got, want) in mine.iter().zip(expected.iter()) {
                assert_eq!(*got, want);
            }
        }

        engine.stop().await.unwrap();
    }
}
