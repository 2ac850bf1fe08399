//! In-process publish/subscribe bus.
//!
//! Components that need to tell each other about state changes (a new unread
//! count, a published location, a user-visible notice) publish an [`AppEvent`]
//! here instead of reaching into each other. One bus is created per client
//! context and handed to every component that needs it.

use barberline_shared::{LocationSample, SyncError};
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 256;

/// Severity of a user-visible notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Dismissible message for the user, e.g. a toast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn error(err: &SyncError) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: err.to_string(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// Out-of-band unread count, e.g. pushed by the socket.
    UnreadCountChanged(u32),
    /// A location sample reached the backend.
    LocationPublished(LocationSample),
    Notice(Notice),
    /// A message arrived for a chat other than the open one.
    ChatActivity { chat_id: String },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish to every current subscriber. Publishing with no subscribers is not an error.
    pub fn publish(&self, event: AppEvent) {
        tracing::trace!(?event, "bus publish");
        let _ = self.tx.send(event);
    }

    pub fn notify(&self, notice: Notice) {
        self.publish(AppEvent::Notice(notice));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(AppEvent::UnreadCountChanged(4));

        assert_eq!(a.recv().await.unwrap(), AppEvent::UnreadCountChanged(4));
        assert_eq!(b.recv().await.unwrap(), AppEvent::UnreadCountChanged(4));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.notify(Notice::info("nobody listening"));
    }

    #[test]
    fn test_error_notice_uses_error_text() {
        let notice = Notice::error(&SyncError::Offline);
        assert_eq!(notice.level, NoticeLevel::Error);
        assert_eq!(notice.message, "You appear to be offline");
    }
}
