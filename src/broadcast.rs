//! Best-effort fan-out of accepted operations to connected clients.
//!
//! Every connected client gets its own bounded channel. Delivery uses
//! `try_send`: a client whose channel is full or closed is dropped from
//! the registry on the spot, so a slow or dead connection can never
//! block the dispatch loop. Delivery to a disconnected client is a
//! no-op, not an error.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::{CollaborativeEdit, EditId, Position, SessionId, UserId, UserRef};
use crate::notify::Notification;
use crate::store::annotations::DocumentAnnotation;

/// Display colors assigned to connecting clients
const CLIENT_COLORS: [&str; 10] = [
    "#3b82f6", "#ef4444", "#22c55e", "#f59e0b", "#8b5cf6", "#ec4899", "#06b6d4", "#f97316",
    "#14b8a6", "#a855f7",
];

/// Pick a display color for a newly connected client
pub fn pick_client_color() -> String {
    use rand::Rng;
    let idx = rand::thread_rng().gen_range(0..CLIENT_COLORS.len());
    CLIENT_COLORS[idx].to_string()
}

/// Events fanned out to connected clients, JSON-encoded on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// An edit won dispatch and was applied
    EditAccepted {
        session_id: SessionId,
        edit: CollaborativeEdit,
        /// Edits superseded by conflict resolution, if any
        superseded: Vec<EditId>,
    },
    AnnotationAdded {
        annotation: DocumentAnnotation,
    },
    AnnotationUpdated {
        annotation: DocumentAnnotation,
    },
    AnnotationResolved {
        annotation: DocumentAnnotation,
    },
    /// Ephemeral cursor movement, never persisted
    CursorMoved {
        session_id: SessionId,
        user_id: UserId,
        position: Position,
        timestamp: DateTime<Utc>,
    },
    ParticipantJoined {
        session_id: SessionId,
        user: UserRef,
        color: Option<String>,
    },
    ParticipantLeft {
        session_id: SessionId,
        user_id: UserId,
    },
    SessionEnded {
        session_id: SessionId,
        timestamp: DateTime<Utc>,
    },
    Notification {
        notification: Notification,
    },
}

/// A connected client and its delivery channel.
struct ClientHandle {
    user: UserRef,
    color: String,
    tx: mpsc::Sender<ServerEvent>,
    connected_at: DateTime<Utc>,
}

/// Registry of connected client channels, keyed by user id.
pub struct ClientRegistry {
    channel_capacity: usize,
    clients: DashMap<UserId, ClientHandle>,
}

impl ClientRegistry {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            channel_capacity,
            clients: DashMap::new(),
        }
    }

    /// Register a client connection, replacing any previous connection
    /// for the same user. Returns the receiving end the transport
    /// drains, plus the assigned display color.
    pub fn register(&self, user: UserRef) -> (mpsc::Receiver<ServerEvent>, String) {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let color = pick_client_color();

        debug!(user_id = %user.id, "Client registered");
        self.clients.insert(
            user.id.clone(),
            ClientHandle {
                user,
                color: color.clone(),
                tx,
                connected_at: Utc::now(),
            },
        );
        (rx, color)
    }

    /// Remove a client connection
    pub fn unregister(&self, user_id: &str) -> bool {
        let removed = self.clients.remove(user_id).is_some();
        if removed {
            debug!(user_id = %user_id, "Client unregistered");
        }
        removed
    }

    /// Deliver one event to one user. Returns false if the user has no
    /// connection or their channel was full or closed; in the latter
    /// case the client is dropped from the registry.
    pub fn send_to_user(&self, user_id: &str, event: ServerEvent) -> bool {
        let send_failed = {
            let Some(client) = self.clients.get(user_id) else {
                return false;
            };
            client.tx.try_send(event).is_err()
        };

        if send_failed {
            // Slow or dead client; drop it rather than wait
            warn!(user_id = %user_id, "Dropping unresponsive client");
            self.clients.remove(user_id);
            return false;
        }
        true
    }

    /// Fan an event out to a set of users; returns how many were
    /// actually delivered to.
    pub fn broadcast(&self, user_ids: &[UserId], event: &ServerEvent) -> usize {
        let mut delivered = 0;
        for user_id in user_ids {
            if self.send_to_user(user_id, event.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.clients.contains_key(user_id)
    }

    pub fn connected_count(&self) -> usize {
        self.clients.len()
    }

    /// Display color assigned to a connected user
    pub fn client_color(&self, user_id: &str) -> Option<String> {
        self.clients.get(user_id).map(|c| c.color.clone())
    }

    /// Connected users with their connection timestamps
    pub fn connected_clients(&self) -> Vec<(UserRef, DateTime<Utc>)> {
        self.clients
            .iter()
            .map(|e| (e.user.clone(), e.connected_at))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor_event() -> ServerEvent {
        ServerEvent::CursorMoved {
            session_id: "s1".to_string(),
            user_id: "user_a".to_string(),
            position: Position::at_offset(3),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_register_and_deliver() {
        let registry = ClientRegistry::new(8);
        let (mut rx, color) = registry.register(UserRef::new("user_a", "Alice"));
        assert!(color.starts_with('#'));

        assert!(registry.send_to_user("user_a", cursor_event()));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ServerEvent::CursorMoved { .. }));
    }

    #[tokio::test]
    async fn test_delivery_to_disconnected_is_noop() {
        let registry = ClientRegistry::new(8);
        assert!(!registry.send_to_user("nobody", cursor_event()));
    }

    #[tokio::test]
    async fn test_full_channel_drops_client() {
        let registry = ClientRegistry::new(1);
        let (_rx, _) = registry.register(UserRef::new("user_a", "Alice"));

        // First fills the channel, second overflows and drops the client
        assert!(registry.send_to_user("user_a", cursor_event()));
        assert!(!registry.send_to_user("user_a", cursor_event()));
        assert!(!registry.is_connected("user_a"));
    }

    #[tokio::test]
    async fn test_closed_receiver_drops_client() {
        let registry = ClientRegistry::new(8);
        let (rx, _) = registry.register(UserRef::new("user_a", "Alice"));
        drop(rx);

        assert!(!registry.send_to_user("user_a", cursor_event()));
        assert!(!registry.is_connected("user_a"));
    }

    #[tokio::test]
    async fn test_broadcast_counts_deliveries() {
        let registry = ClientRegistry::new(8);
        let (_rx_a, _) = registry.register(UserRef::new("user_a", "Alice"));
        let (_rx_b, _) = registry.register(UserRef::new("user_b", "Bob"));

        let targets = vec![
            "user_a".to_string(),
            "user_b".to_string(),
            "user_c".to_string(),
        ];
        let delivered = registry.broadcast(&targets, &cursor_event());
        assert_eq!(delivered, 2);
    }

    #[test]
    fn test_event_json_shape() {
        let event = ServerEvent::SessionEnded {
            session_id: "collab_doc1_abcd1234".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "session_ended");
        assert_eq!(json["session_id"], "collab_doc1_abcd1234");
    }
}
