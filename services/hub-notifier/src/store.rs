//! In-memory notification feed
//!
//! The feed is newest-first by arrival and is published as an immutable
//! snapshot through a watch channel, so observers never see a half-applied
//! change and never hold a lock.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::notification::Notification;

pub type Feed = Arc<Vec<Notification>>;

#[derive(Debug)]
pub struct NotificationStore {
    feed: watch::Sender<Feed>,
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationStore {
    pub fn new() -> Self {
        let (feed, _) = watch::channel(Arc::new(Vec::new()));
        Self { feed }
    }

    /// Prepend a notification
    ///
    /// Returns `false` without touching the feed when a notification with the
    /// same id is already present.
    pub fn ingest(&self, notification: Notification) -> bool {
        self.feed.send_if_modified(|feed| {
            if feed.iter().any(|n| n.id == notification.id) {
                debug!("Ignoring duplicate notification {}", notification.id);
                return false;
            }
            let mut next = Vec::with_capacity(feed.len() + 1);
            next.push(notification);
            next.extend(feed.iter().cloned());
            *feed = Arc::new(next);
            true
        })
    }

    /// Remove the notification at `index`; out-of-range indices are ignored
    pub fn remove_at(&self, index: usize) -> Option<Notification> {
        let mut removed = None;
        self.feed.send_if_modified(|feed| {
            if index >= feed.len() {
                return false;
            }
            let mut next = feed.as_ref().clone();
            removed = Some(next.remove(index));
            *feed = Arc::new(next);
            true
        });
        removed
    }

    pub fn remove(&self, id: &str) -> Option<Notification> {
        let index = self.feed.borrow().iter().position(|n| n.id == id)?;
        self.remove_at(index)
    }

    pub fn clear(&self) {
        self.feed.send_if_modified(|feed| {
            if feed.is_empty() {
                return false;
            }
            *feed = Arc::new(Vec::new());
            true
        });
    }

    /// Current feed, newest first
    pub fn snapshot(&self) -> Feed {
        self.feed.borrow().clone()
    }

    /// Receiver that observes every published feed
    pub fn subscribe(&self) -> watch::Receiver<Feed> {
        self.feed.subscribe()
    }

    /// Every notification in the feed counts as unread
    pub fn unread_count(&self) -> usize {
        self.len()
    }

    pub fn len(&self) -> usize {
        self.feed.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.feed.borrow().is_empty()
    }
}
