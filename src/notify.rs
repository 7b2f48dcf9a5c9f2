//! Per-user notification logs.
//!
//! Notifications live outside any session: a bounded log per user with
//! one-way read latches. Live delivery to connected clients happens in
//! the broadcast layer; this store is the durable-ish view a client
//! fetches on reconnect.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::info;

use crate::engine::UserId;

/// Unique identifier for a notification
pub type NotificationId = String;

/// A notification delivered to one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: NotificationId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// One-way latch
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

/// Per-user notification statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationStats {
    pub user_id: UserId,
    pub total_notifications: usize,
    pub unread_notifications: usize,
    pub notifications_by_type: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_notification: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newest_notification: Option<DateTime<Utc>>,
}

/// Store of bounded per-user notification logs.
pub struct NotificationCenter {
    max_per_user: usize,
    notifications: DashMap<UserId, VecDeque<Notification>>,
}

impl NotificationCenter {
    pub fn new(max_per_user: usize) -> Self {
        Self {
            max_per_user,
            notifications: DashMap::new(),
        }
    }

    /// Record a notification for a user, evicting the oldest past the
    /// per-user bound. Returns the notification for live delivery.
    pub fn send(
        &self,
        user_id: &str,
        kind: &str,
        title: impl Into<String>,
        message: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) -> Notification {
        let notification = Notification {
            notification_id: format!("notification_{}", uuid::Uuid::new_v4().simple()),
            user_id: user_id.to_string(),
            kind: kind.to_string(),
            title: title.into(),
            message: message.into(),
            metadata: metadata.unwrap_or(serde_json::Value::Null),
            created_at: Utc::now(),
            is_read: false,
            read_at: None,
        };

        let mut entry = self.notifications.entry(user_id.to_string()).or_default();
        entry.push_back(notification.clone());
        while entry.len() > self.max_per_user {
            entry.pop_front();
        }

        info!(user_id = %user_id, kind, "Sent notification");
        notification
    }

    /// Notifications for a user, newest first
    pub fn user_notifications(
        &self,
        user_id: &str,
        unread_only: bool,
        limit: usize,
    ) -> Vec<Notification> {
        self.notifications
            .get(user_id)
            .map(|entries| {
                entries
                    .iter()
                    .rev()
                    .filter(|n| !unread_only || !n.is_read)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Latch one notification read. Marking an already-read
    /// notification is a no-op that still returns true.
    pub fn mark_read(&self, user_id: &str, notification_id: &str) -> bool {
        let Some(mut entries) = self.notifications.get_mut(user_id) else {
            return false;
        };
        match entries
            .iter_mut()
            .find(|n| n.notification_id == notification_id)
        {
            Some(notification) => {
                if !notification.is_read {
                    notification.is_read = true;
                    notification.read_at = Some(Utc::now());
                }
                true
            }
            None => false,
        }
    }

    /// Latch all of a user's notifications read; returns how many were
    /// newly marked.
    pub fn mark_all_read(&self, user_id: &str) -> usize {
        let Some(mut entries) = self.notifications.get_mut(user_id) else {
            return 0;
        };
        let now = Utc::now();
        let mut marked = 0;
        for notification in entries.iter_mut() {
            if !notification.is_read {
                notification.is_read = true;
                notification.read_at = Some(now);
                marked += 1;
            }
        }
        marked
    }

    pub fn stats(&self, user_id: &str) -> NotificationStats {
        let entries = self.notifications.get(user_id);

        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut unread = 0;
        let mut total = 0;
        let mut oldest = None;
        let mut newest = None;

        if let Some(entries) = entries.as_ref() {
            total = entries.len();
            oldest = entries.front().map(|n| n.created_at);
            newest = entries.back().map(|n| n.created_at);
            for notification in entries.iter() {
                if !notification.is_read {
                    unread += 1;
                }
                *by_type.entry(notification.kind.clone()).or_insert(0) += 1;
            }
        }

        NotificationStats {
            user_id: user_id.to_string(),
            total_notifications: total,
            unread_notifications: unread,
            notifications_by_type: by_type,
            oldest_notification: oldest,
            newest_notification: newest,
        }
    }

    pub fn total_count(&self) -> usize {
        self.notifications.iter().map(|e| e.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_and_fetch() {
        let center = NotificationCenter::new(100);
        center.send("user_a", "mention", "Mentioned", "in doc1", None);
        center.send("user_a", "comment_reply", "Reply", "to your comment", None);

        let all = center.user_notifications("user_a", false, 50);
        assert_eq!(all.len(), 2);
        // Newest first
        assert_eq!(all[0].kind, "comment_reply");
        assert!(center.user_notifications("user_b", false, 50).is_empty());
    }

    #[test]
    fn test_bounded_per_user() {
        let center = NotificationCenter::new(5);
        for i in 0..8 {
            center.send("user_a", "mention", format!("n{}", i), "m", None);
        }

        let all = center.user_notifications("user_a", false, 100);
        assert_eq!(all.len(), 5);
        // Oldest three were evicted
        assert_eq!(all.last().unwrap().title, "n3");
    }

    #[test]
    fn test_mark_read_is_idempotent() {
        let center = NotificationCenter::new(100);
        let n = center.send("user_a", "mention", "t", "m", None);

        assert!(center.mark_read("user_a", &n.notification_id));
        let read_at = center.user_notifications("user_a", false, 1)[0].read_at;

        assert!(center.mark_read("user_a", &n.notification_id));
        // Second call did not move the read timestamp
        assert_eq!(center.user_notifications("user_a", false, 1)[0].read_at, read_at);

        assert!(!center.mark_read("user_a", "notification_missing"));
        assert!(!center.mark_read("user_b", &n.notification_id));
    }

    #[test]
    fn test_unread_filter_and_mark_all() {
        let center = NotificationCenter::new(100);
        let a = center.send("user_a", "mention", "a", "m", None);
        center.send("user_a", "mention", "b", "m", None);
        center.send("user_a", "edit", "c", "m", None);

        center.mark_read("user_a", &a.notification_id);
        assert_eq!(center.user_notifications("user_a", true, 50).len(), 2);

        assert_eq!(center.mark_all_read("user_a"), 2);
        assert_eq!(center.mark_all_read("user_a"), 0);
        assert!(center.user_notifications("user_a", true, 50).is_empty());
    }

    #[test]
    fn test_stats() {
        let center = NotificationCenter::new(100);
        center.send("user_a", "mention", "a", "m", None);
        let b = center.send("user_a", "edit", "b", "m", None);
        center.mark_read("user_a", &b.notification_id);

        let stats = center.stats("user_a");
        assert_eq!(stats.total_notifications, 2);
        assert_eq!(stats.unread_notifications, 1);
        assert_eq!(stats.notifications_by_type.get("mention"), Some(&1));
        assert!(stats.oldest_notification <= stats.newest_notification);
    }
}
