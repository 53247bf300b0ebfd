//! Notifications engine: queue of transient user-facing messages.
//!
//! Notifications are kept in arrival order until dismissed. There is no
//! de-duplication and no expiry; the view layer decides how long to show them.

use crate::id::NotificationId;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Severity of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NotificationKind::Info => "info",
            NotificationKind::Success => "success",
            NotificationKind::Warning => "warning",
            NotificationKind::Error => "error",
        })
    }
}

/// A user-facing message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub kind: NotificationKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// `notifications` slice
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationsState {
    pub items: Vec<Notification>,
}

/// Handle to the notifications slice
#[derive(Debug, Clone)]
pub struct NotificationsEngine {
    store: Store,
    /// Lives outside the store so ids are never reused across resets
    next_id: Arc<AtomicU64>,
}

impl NotificationsEngine {
    pub fn new(store: Store) -> Self {
        store.set_state("notifications/@@INIT", |state| {
            state.notifications = NotificationsState::default();
        });
        Self {
            store,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Append a notification and return its id
    pub fn notify(&self, kind: NotificationKind, message: impl Into<String>) -> NotificationId {
        let message = message.into();
        match kind {
            NotificationKind::Error => tracing::warn!("notification: {}", message),
            _ => tracing::debug!("notification ({}): {}", kind, message),
        }

        let id = NotificationId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.store.set_state("notifications/notify", |state| {
            state.notifications.items.push(Notification {
                id,
                kind,
                message,
                timestamp: Utc::now(),
            });
        });
        id
    }

    pub fn info(&self, message: impl Into<String>) -> NotificationId {
        self.notify(NotificationKind::Info, message)
    }

    pub fn success(&self, message: impl Into<String>) -> NotificationId {
        self.notify(NotificationKind::Success, message)
    }

    pub fn warning(&self, message: impl Into<String>) -> NotificationId {
        self.notify(NotificationKind::Warning, message)
    }

    pub fn error(&self, message: impl Into<String>) -> NotificationId {
        self.notify(NotificationKind::Error, message)
    }

    /// Remove a notification; unknown ids are ignored.
    /// Returns whether anything was removed.
    pub fn dismiss(&self, id: NotificationId) -> bool {
        let present = self
            .store
            .with_state(|state| state.notifications.items.iter().any(|n| n.id == id));
        if !present {
            return false;
        }
        self.store.set_state("notifications/dismiss", |state| {
            state.notifications.items.retain(|n| n.id != id);
        });
        true
    }

    pub fn clear(&self) {
        self.store.set_state("notifications/clear", |state| {
            state.notifications.items.clear();
        });
    }

    /// Current notifications in arrival order
    pub fn list(&self) -> Vec<Notification> {
        self.store
            .with_state(|state| state.notifications.items.clone())
    }

    pub fn len(&self) -> usize {
        self.store
            .with_state(|state| state.notifications.items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ExplorerState;

    fn engine() -> NotificationsEngine {
        NotificationsEngine::new(Store::new("test", ExplorerState::default()))
    }

    #[test]
    fn test_notify_preserves_order_and_unique_ids() {
        let notifications = engine();
        let a = notifications.info("first");
        let b = notifications.error("second");
        let c = notifications.info("first");

        assert!(a < b && b < c);
        let items = notifications.list();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].kind, NotificationKind::Error);
        // No de-duplication
        assert_eq!(items[0].message, items[2].message);
    }

    #[test]
    fn test_dismiss_is_idempotent() {
        let notifications = engine();
        let id = notifications.warning("careful");
        let store_version = notifications.store.version();

        assert!(notifications.dismiss(id));
        assert!(!notifications.dismiss(id));
        // The second dismiss does not touch the store
        assert_eq!(notifications.store.version(), store_version + 1);
        assert!(notifications.is_empty());
    }

    #[test]
    fn test_clear() {
        let notifications = engine();
        notifications.success("done");
        notifications.info("note");
        notifications.clear();
        assert!(notifications.is_empty());
        // Ids keep increasing after clear and reset
        notifications.store.seal_initial();
        notifications.store.reset();
        let id = notifications.info("again");
        assert_eq!(id, NotificationId(3));
    }
}
