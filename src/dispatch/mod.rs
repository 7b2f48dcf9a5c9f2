//! Operation queue and single-consumer dispatcher.
//!
//! Every edit, annotation update and cursor update flows through one
//! shared queue, and this dispatcher is the only writer of the version
//! and annotation stores. The pop order of the queue is the global
//! order of the subsystem: operations from a single producer stay in
//! their enqueue order, and version numbering follows dispatch order.
//!
//! Edits are held in a short coalescing buffer before application;
//! edits that target the same position window within that interval are
//! fed to the conflict resolver and only the accepted edit is applied.
//! A failure applying one operation is logged and never stops the loop.

pub mod resolver;

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::broadcast::{ClientRegistry, ServerEvent};
use crate::engine::{
    CollabError, CollabResult, CollaborativeEdit, DocumentId, EditId, EngineConfig, Position,
    SessionId, UserId,
};
use crate::session::{ConflictPolicy, SessionRegistry};
use crate::store::annotations::{AnnotationId, DocumentAnnotation};
use crate::store::{AnnotationStore, ChangeLog, VersionStore};

/// An annotation mutation flowing through the queue.
#[derive(Debug, Clone)]
pub enum AnnotationOp {
    Add {
        annotation: DocumentAnnotation,
    },
    Update {
        annotation_id: AnnotationId,
        content: String,
        position: Option<Position>,
    },
    Resolve {
        annotation_id: AnnotationId,
    },
}

/// The three operation kinds the queue accepts.
#[derive(Debug, Clone)]
pub enum Operation {
    /// A collaborative edit, subject to conflict coalescing
    Edit { edit: CollaborativeEdit },
    /// An annotation mutation, applied directly to the store
    Annotation { op: AnnotationOp },
    /// An ephemeral cursor update, forwarded without persistence
    Cursor {
        session_id: SessionId,
        user_id: UserId,
        position: Position,
    },
}

/// An edit waiting out its coalescing window.
struct PendingEdit {
    edit: CollaborativeEdit,
    due: Instant,
}

/// Single ordered consumer applying operations to the stores and
/// fanning accepted results out to session clients.
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    versions: Arc<VersionStore>,
    annotations: Arc<AnnotationStore>,
    changes: Arc<ChangeLog>,
    clients: Arc<ClientRegistry>,
    coalesce_window: Duration,
    position_window: u64,
    /// Edits buffered inside their coalescing window
    buffer: Mutex<Vec<PendingEdit>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        versions: Arc<VersionStore>,
        annotations: Arc<AnnotationStore>,
        changes: Arc<ChangeLog>,
        clients: Arc<ClientRegistry>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            versions,
            annotations,
            changes,
            clients,
            coalesce_window: config.coalesce_window,
            position_window: config.position_window,
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Consume the shared queue until it closes or shutdown fires.
    /// Per-operation failures are logged and the loop continues;
    /// operations are applied at most once and never retried.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Operation>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let tick = if self.coalesce_window.is_zero() {
            Duration::from_millis(10)
        } else {
            (self.coalesce_window / 2).max(Duration::from_millis(1))
        };
        let mut interval = tokio::time::interval(tick);

        info!("Dispatcher started");
        loop {
            tokio::select! {
                maybe_op = rx.recv() => {
                    match maybe_op {
                        Some(op) => {
                            if let Err(e) = self.handle(op) {
                                error!("Failed to apply operation: {}", e);
                            }
                            self.flush_due();
                        }
                        None => break,
                    }
                }
                _ = interval.tick() => {
                    self.flush_due();
                }
                _ = shutdown.recv() => {
                    // Drain what is already queued, then flush the buffer
                    while let Ok(op) = rx.try_recv() {
                        if let Err(e) = self.handle(op) {
                            error!("Failed to apply operation: {}", e);
                        }
                    }
                    self.flush_all();
                    break;
                }
            }
        }
        info!("Dispatcher stopped");
    }

    /// Route one popped operation by kind.
    pub fn handle(&self, op: Operation) -> CollabResult<()> {
        match op {
            Operation::Edit { edit } => {
                self.buffer_edit(edit);
                Ok(())
            }
            Operation::Annotation { op } => {
                self.apply_annotation(op);
                Ok(())
            }
            Operation::Cursor {
                session_id,
                user_id,
                position,
            } => {
                self.forward_cursor(session_id, user_id, position);
                Ok(())
            }
        }
    }

    fn buffer_edit(&self, edit: CollaborativeEdit) {
        let due = Instant::now() + self.coalesce_window;
        self.buffer.lock().push(PendingEdit { edit, due });
    }

    /// Apply every buffered edit whose coalescing window has elapsed
    pub fn flush_due(&self) {
        self.flush(Instant::now());
    }

    /// Apply all buffered edits regardless of their window
    pub fn flush_all(&self) {
        loop {
            let Some((accepted, superseded)) = self.take_group(None) else {
                break;
            };
            self.apply_accepted(accepted, superseded);
        }
    }

    fn flush(&self, now: Instant) {
        loop {
            let Some((accepted, superseded)) = self.take_group(Some(now)) else {
                break;
            };
            self.apply_accepted(accepted, superseded);
        }
    }

    /// Pull the next group of edits to apply: the earliest buffered
    /// edit (that is due, unless `now` is None) together with later
    /// buffered edits in the same session targeting an overlapping
    /// position. A group of two or more goes through the resolver.
    ///
    /// A later edit may only join the group if the buffer holds no
    /// earlier, still-buffered edit from the same producer: pulling it
    /// forward past one would reorder that producer's edits. Such an
    /// edit stays buffered and is applied in its own turn.
    fn take_group(&self, now: Option<Instant>) -> Option<(CollaborativeEdit, Vec<EditId>)> {
        let mut buffer = self.buffer.lock();

        // Deadlines grow with arrival order, so the first due edit is
        // the earliest one.
        let head_idx = buffer
            .iter()
            .position(|p| now.map_or(true, |t| p.due <= t))?;

        let head = buffer.remove(head_idx).edit;

        let mut group = vec![head.clone()];
        let mut held_back: Vec<UserId> = Vec::new();
        let mut i = 0;
        while i < buffer.len() {
            let candidate = &buffer[i].edit;
            let joins = candidate.session_id == head.session_id
                && candidate.position.overlaps(&head.position, self.position_window)
                && !held_back.contains(&candidate.user_id);
            if joins {
                group.push(buffer.remove(i).edit);
            } else {
                if !held_back.contains(&candidate.user_id) {
                    held_back.push(candidate.user_id.clone());
                }
                i += 1;
            }
        }
        drop(buffer);

        if group.len() == 1 {
            return Some((head, Vec::new()));
        }

        let policy = self
            .registry
            .policy(&head.session_id)
            .unwrap_or(ConflictPolicy::LastWriteWins);

        debug!(
            session_id = %head.session_id,
            edits = group.len(),
            ?policy,
            "Resolving conflicting edits"
        );

        let accepted = resolver::resolve(policy, &group)?;
        let superseded = group
            .iter()
            .map(|e| e.edit_id.clone())
            .filter(|id| *id != accepted.edit_id)
            .collect();
        Some((accepted, superseded))
    }

    /// Apply one accepted edit: record it for the next version, touch
    /// the session, write the audit entry and fan out to participants.
    fn apply_accepted(&self, edit: CollaborativeEdit, superseded: Vec<EditId>) {
        let Some(session) = self.registry.get(&edit.session_id) else {
            warn!(session_id = %edit.session_id, "Dropping edit for unknown session");
            return;
        };
        let document_id = session.lock().document_id.clone();

        self.versions.record_edit(&document_id, edit.clone());
        self.registry.touch(&edit.session_id);

        let mut after = serde_json::Map::new();
        after.insert("edit_id".into(), edit.edit_id.clone().into());
        after.insert(
            "operation".into(),
            serde_json::to_value(edit.kind).unwrap_or_default(),
        );
        after.insert("content".into(), edit.content.clone().into());
        after.insert("offset".into(), edit.position.offset.into());
        self.changes.track(
            &document_id,
            &edit.user_id,
            "collaborative_edit",
            format!("Edit applied in session {}", edit.session_id),
            None,
            Some(after),
        );

        let targets: Vec<UserId> = self
            .registry
            .participants(&edit.session_id)
            .into_iter()
            .map(|u| u.id)
            .collect();
        let session_id = edit.session_id.clone();
        self.clients.broadcast(
            &targets,
            &ServerEvent::EditAccepted {
                session_id,
                edit,
                superseded,
            },
        );
    }

    fn apply_annotation(&self, op: AnnotationOp) {
        match op {
            AnnotationOp::Add { annotation } => {
                let document_id = annotation.document_id.clone();
                self.changes.track(
                    &document_id,
                    &annotation.user_id,
                    "annotation_added",
                    format!("Added {} annotation", annotation.kind.as_str()),
                    None,
                    None,
                );
                self.annotations.insert_annotation(annotation.clone());
                self.broadcast_to_document(&document_id, ServerEvent::AnnotationAdded { annotation });
            }
            AnnotationOp::Update {
                annotation_id,
                content,
                position,
            } => {
                if !self.annotations.update_annotation(&annotation_id, content, position) {
                    warn!(annotation_id = %annotation_id, "Dropping update for unknown annotation");
                    return;
                }
                if let Some(annotation) = self.annotations.annotation(&annotation_id) {
                    let document_id = annotation.document_id.clone();
                    self.changes.track(
                        &document_id,
                        &annotation.user_id,
                        "annotation_updated",
                        format!("Updated annotation {}", annotation_id),
                        None,
                        None,
                    );
                    self.broadcast_to_document(
                        &document_id,
                        ServerEvent::AnnotationUpdated { annotation },
                    );
                }
            }
            AnnotationOp::Resolve { annotation_id } => {
                if !self.annotations.resolve_annotation(&annotation_id) {
                    warn!(annotation_id = %annotation_id, "Dropping resolve for unknown annotation");
                    return;
                }
                if let Some(annotation) = self.annotations.annotation(&annotation_id) {
                    let document_id = annotation.document_id.clone();
                    self.changes.track(
                        &document_id,
                        &annotation.user_id,
                        "annotation_resolved",
                        format!("Resolved annotation {}", annotation_id),
                        None,
                        None,
                    );
                    self.broadcast_to_document(
                        &document_id,
                        ServerEvent::AnnotationResolved { annotation },
                    );
                }
            }
        }
    }

    fn forward_cursor(&self, session_id: SessionId, user_id: UserId, position: Position) {
        let targets: Vec<UserId> = self
            .registry
            .participants(&session_id)
            .into_iter()
            .map(|u| u.id)
            .filter(|id| *id != user_id)
            .collect();

        self.clients.broadcast(
            &targets,
            &ServerEvent::CursorMoved {
                session_id,
                user_id,
                position,
                timestamp: Utc::now(),
            },
        );
    }

    /// Everyone participating in any active session on a document
    fn document_audience(&self, document_id: &str) -> Vec<UserId> {
        let mut audience = BTreeSet::new();
        for session_id in self.registry.active_sessions_for_document(document_id) {
            for user in self.registry.participants(&session_id) {
                audience.insert(user.id);
            }
        }
        audience.into_iter().collect()
    }

    fn broadcast_to_document(&self, document_id: &DocumentId, event: ServerEvent) {
        let targets = self.document_audience(document_id);
        self.clients.broadcast(&targets, &event);
    }
}

impl From<mpsc::error::TrySendError<Operation>> for CollabError {
    fn from(err: mpsc::error::TrySendError<Operation>) -> Self {
        match err {
            mpsc::error::TrySendError::Full(_) => CollabError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => CollabError::QueueClosed,
        }
    }
}
