//! Chat session: the active chat, optimistic sends and real-time reconciliation.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use barberline_shared::{ChatMessage, Reaction, ServerEvent, SyncError};
use chrono::Utc;
use tokio::task::JoinHandle;

use super::store::{MessageStore, ProviderPosition, VisibleMessage};
use crate::api_client::MarketplaceApi;
use crate::bus::{AppEvent, EventBus, Notice};
use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::ws::SocketHandle;

#[derive(Default)]
struct SessionState {
    store: MessageStore,
    active_chat: Option<String>,
    last_error: Option<String>,
    closed: bool,
}

/// A send in flight. Awaiting it is optional; the store is updated either way.
pub struct PendingSend {
    pub local_id: String,
    task: JoinHandle<Result<ChatMessage, SyncError>>,
}

impl PendingSend {
    /// Wait for the backend's answer.
    pub async fn outcome(self) -> Result<ChatMessage, SyncError> {
        self.task
            .await
            .unwrap_or_else(|e| Err(SyncError::InvalidInput(format!("send task failed: {e}"))))
    }
}

#[derive(Clone)]
pub struct ChatSession {
    user_id: String,
    api: Arc<dyn MarketplaceApi>,
    bus: EventBus,
    socket: Option<SocketHandle>,
    request_timeout: Duration,
    state: Arc<Mutex<SessionState>>,
}

impl ChatSession {
    pub fn new(user_id: impl Into<String>, api: Arc<dyn MarketplaceApi>, bus: EventBus) -> Self {
        Self {
            user_id: user_id.into(),
            api,
            bus,
            socket: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    /// Route join/leave and typing commands through `socket`.
    pub fn with_socket(mut self, socket: SocketHandle) -> Self {
        self.socket = Some(socket);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn active_chat(&self) -> Option<String> {
        self.lock().active_chat.clone()
    }

    /// Last send or fetch failure, for display.
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Make `chat_id` the active chat, leaving the previous one.
    pub fn open_chat(&self, chat_id: &str) {
        let previous = self.lock().active_chat.replace(chat_id.to_string());
        if previous.as_deref() == Some(chat_id) {
            return;
        }
        if let Some(socket) = &self.socket {
            if let Some(prev) = &previous {
                let _ = socket.leave_chat(prev);
            }
            if let Err(e) = socket.join_chat(chat_id) {
                tracing::debug!(chat_id, error = %e, "Join deferred until socket is up");
            }
        }
        tracing::debug!(chat_id, "Chat opened");
    }

    /// Join the active chat again after the socket reconnects.
    pub fn rejoin(&self) {
        if let (Some(socket), Some(chat_id)) = (&self.socket, self.active_chat()) {
            let _ = socket.join_chat(&chat_id);
        }
    }

    /// Leave the active chat.
    pub fn close_chat(&self) {
        let previous = self.lock().active_chat.take();
        if let (Some(socket), Some(prev)) = (&self.socket, previous) {
            let _ = socket.leave_chat(&prev);
        }
    }

    /// Fetch the newest page of the active chat.
    pub async fn load_history(&self) -> Result<(), SyncError> {
        let chat_id = self.require_chat()?;
        let page = self.call(self.api.get_chat_messages(&chat_id, None)).await;
        let mut st = self.lock();
        if st.closed {
            return Ok(());
        }
        match page {
            Ok(page) => {
                tracing::debug!(chat_id, count = page.messages.len(), "History loaded");
                st.store.history_mut(&chat_id).set_history(page);
                Ok(())
            }
            Err(e) => {
                st.last_error = Some(e.to_string());
                drop(st);
                self.bus.notify(Notice::error(&e));
                Err(e)
            }
        }
    }

    /// Fetch the next older page. Returns false when there is none.
    pub async fn load_older(&self) -> Result<bool, SyncError> {
        let chat_id = self.require_chat()?;
        let next = {
            let st = self.lock();
            match st.store.history(&chat_id) {
                Some(h) if h.is_loaded && h.has_more() => h.pagination.page + 1,
                Some(h) if h.is_loaded => return Ok(false),
                _ => 1,
            }
        };
        if next == 1 {
            self.load_history().await?;
            return Ok(true);
        }

        let page = self
            .call(self.api.get_chat_messages(&chat_id, Some(next)))
            .await;
        let mut st = self.lock();
        if st.closed {
            return Ok(false);
        }
        match page {
            Ok(page) => {
                let added = st.store.history_mut(&chat_id).prepend_page(page);
                tracing::debug!(chat_id, page = next, added, "Older messages loaded");
                Ok(true)
            }
            Err(e) => {
                st.last_error = Some(e.to_string());
                drop(st);
                self.bus.notify(Notice::error(&e));
                Err(e)
            }
        }
    }

    /// Show `content` immediately and send it in the background.
    ///
    /// On success the optimistic entry is swapped for the stored message; on
    /// failure it is removed and an error notice is published. Never retried.
    pub fn send(&self, content: &str) -> Result<PendingSend, SyncError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::InvalidInput("message is empty".into()));
        }
        let chat_id = self.require_chat()?;

        let local_id = format!("local-{}", uuid::Uuid::new_v4());
        let optimistic = ChatMessage {
            id: local_id.clone(),
            chat_id: chat_id.clone(),
            sender: self.user_id.clone(),
            content: content.to_string(),
            created_at: Utc::now(),
            is_read: false,
            reactions: Vec::new(),
        };
        self.lock().store.insert_optimistic(optimistic);

        let session = self.clone();
        let content = content.to_string();
        let id = local_id.clone();
        let task = tokio::spawn(async move {
            let result = session
                .call(session.api.send_message(&chat_id, &content))
                .await;
            session.settle_send(&id, result)
        });

        Ok(PendingSend { local_id, task })
    }

    fn settle_send(
        &self,
        local_id: &str,
        result: Result<ChatMessage, SyncError>,
    ) -> Result<ChatMessage, SyncError> {
        let mut st = self.lock();
        if st.closed {
            return result;
        }
        match &result {
            Ok(stored) => {
                tracing::debug!(local_id, server_id = %stored.id, "Message confirmed");
                st.store.confirm(local_id, stored.clone());
            }
            Err(e) => {
                tracing::warn!(local_id, error = %e, "Message send failed");
                st.store.rollback(local_id);
                st.last_error = Some(e.to_string());
                drop(st);
                self.bus.notify(Notice::error(e));
            }
        }
        result
    }

    /// Apply a real-time event. Returns true if local state changed.
    pub fn handle_event(&self, event: &ServerEvent) -> bool {
        let mut st = self.lock();
        if st.closed {
            return false;
        }
        if let Some(event_id) = event.event_id() {
            if !st.store.remember_event(event_id) {
                tracing::trace!(event_id, "Duplicate socket event");
                return false;
            }
        }
        match event {
            ServerEvent::NewMessage { chat_id, message } => {
                if message.sender == self.user_id {
                    return false;
                }
                if st.active_chat.as_deref() != Some(chat_id.as_str()) {
                    drop(st);
                    self.bus.publish(AppEvent::ChatActivity {
                        chat_id: chat_id.clone(),
                    });
                    return false;
                }
                st.store.set_typing(chat_id, &message.sender, false);
                st.store.history_mut(chat_id).add_message(message.clone())
            }
            ServerEvent::UserTyping {
                chat_id,
                user_id,
                is_typing,
            } => {
                if *user_id == self.user_id {
                    return false;
                }
                st.store.set_typing(chat_id, user_id, *is_typing);
                true
            }
            ServerEvent::MessageRead {
                chat_id,
                message_ids,
                ..
            } => st.store.mark_read(chat_id, message_ids) > 0,
            ServerEvent::UserStatusChange { user_id, is_online } => {
                st.store.set_presence(user_id, *is_online);
                true
            }
            ServerEvent::LocationUpdate {
                provider_id,
                coordinates,
                updated_at,
            } => {
                st.store.set_provider_position(
                    provider_id,
                    ProviderPosition {
                        coordinates: *coordinates,
                        updated_at: *updated_at,
                    },
                );
                true
            }
            ServerEvent::ReactionAdded {
                chat_id,
                message_id,
                user_id,
                emoji,
                ..
            }
            | ServerEvent::ReactionRemoved {
                chat_id,
                message_id,
                user_id,
                emoji,
                ..
            } => {
                let added = matches!(event, ServerEvent::ReactionAdded { .. });
                let reaction = Reaction {
                    user_id: user_id.clone(),
                    emoji: emoji.clone(),
                };
                st.store.apply_reaction(chat_id, message_id, reaction, added)
            }
            ServerEvent::UnreadCount { .. } => false,
        }
    }

    /// Confirmed messages of the active chat followed by pending sends.
    pub fn visible_messages(&self) -> Vec<VisibleMessage> {
        let st = self.lock();
        match &st.active_chat {
            Some(chat_id) => st.store.visible(chat_id),
            None => Vec::new(),
        }
    }

    pub fn has_more(&self) -> bool {
        let st = self.lock();
        st.active_chat
            .as_deref()
            .and_then(|c| st.store.history(c))
            .is_some_and(|h| h.has_more())
    }

    pub fn typing_users(&self) -> Vec<String> {
        let st = self.lock();
        match &st.active_chat {
            Some(chat_id) => st.store.typing_users(chat_id),
            None => Vec::new(),
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.lock().store.is_online(user_id)
    }

    pub fn provider_position(&self, provider_id: &str) -> Option<ProviderPosition> {
        self.lock().store.provider_position(provider_id)
    }

    /// Tell the active chat whether the local user is typing.
    pub fn set_typing(&self, is_typing: bool) -> Result<(), SyncError> {
        let chat_id = self.require_chat()?;
        let socket = self.socket.as_ref().ok_or(SyncError::Offline)?;
        socket.typing(&chat_id, is_typing).map_err(|e| {
            tracing::debug!(error = %e, "Typing indicator not sent");
            SyncError::Offline
        })
    }

    /// Ignore every completion from here on.
    pub fn shutdown(&self) {
        let chat = {
            let mut st = self.lock();
            st.closed = true;
            st.active_chat.take()
        };
        if let (Some(socket), Some(chat)) = (&self.socket, chat) {
            let _ = socket.leave_chat(&chat);
        }
    }

    fn require_chat(&self) -> Result<String, SyncError> {
        self.active_chat()
            .ok_or_else(|| SyncError::InvalidInput("no chat is open".into()))
    }

    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, barberline_shared::ApiError>>,
    ) -> Result<T, SyncError> {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .unwrap_or(Err(barberline_shared::ApiError::Timeout))
            .map_err(SyncError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::NoticeLevel;
    use crate::test_support::{message, Call, MockApi};
    use barberline_shared::{ApiError, Coordinates};

    fn session() -> (ChatSession, Arc<MockApi>, EventBus) {
        let api = Arc::new(MockApi::new());
        let bus = EventBus::new();
        let session = ChatSession::new("me", api.clone(), bus.clone());
        (session, api, bus)
    }

    fn contents(session: &ChatSession) -> Vec<String> {
        session
            .visible_messages()
            .into_iter()
            .map(|m| m.message.content)
            .collect()
    }

    #[tokio::test]
    async fn test_send_success_shows_exactly_one_entry() {
        let (session, api, _bus) = session();
        session.open_chat("c1");
        api.hold_sends();

        let pending = session.send("hello").unwrap();
        let before = session.visible_messages();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].message.content, "hello");
        assert!(before[0].is_optimistic);

        tokio::task::yield_now().await;
        assert_eq!(contents(&session), ["hello"]);

        api.release_sends();
        let stored = pending.outcome().await.unwrap();

        let after = session.visible_messages();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].message.id, stored.id);
        assert!(!after[0].is_optimistic);

        // The socket echo of our own message is not rendered twice.
        let echo = ServerEvent::NewMessage {
            chat_id: "c1".into(),
            message: stored,
        };
        assert!(!session.handle_event(&echo));
        assert_eq!(contents(&session), ["hello"]);
    }

    #[tokio::test]
    async fn test_send_failure_rolls_back_and_notifies() {
        let (session, api, bus) = session();
        api.seed_history("c1", vec![message("m1", "c1", "u2", "hi there", 1)]);
        session.open_chat("c1");
        session.load_history().await.unwrap();
        let before = session.visible_messages();

        let mut events = bus.subscribe();
        api.fail_sends(Some(ApiError::Http {
            status: 500,
            body: r#"{"message":"Chat unavailable"}"#.into(),
        }));

        let pending = session.send("hello").unwrap();
        assert_eq!(session.visible_messages().len(), 2);
        let err = pending.outcome().await.unwrap_err();

        assert!(matches!(err, SyncError::RemoteRejected { status: 500, .. }));
        assert_eq!(session.visible_messages(), before);
        assert!(session.last_error().unwrap().contains("Chat unavailable"));
        match events.recv().await.unwrap() {
            AppEvent::Notice(notice) => assert_eq!(notice.level, NoticeLevel::Error),
            other => panic!("unexpected event: {other:?}"),
        }
        // One attempt only.
        let sends = api
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::SendMessage(..)))
            .count();
        assert_eq!(sends, 1);
    }

    #[tokio::test]
    async fn test_send_requires_chat_and_content() {
        let (session, api, _bus) = session();
        assert!(matches!(session.send("hello"), Err(SyncError::InvalidInput(_))));

        session.open_chat("c1");
        assert!(matches!(session.send("   "), Err(SyncError::InvalidInput(_))));
        assert!(session.visible_messages().is_empty());
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sends_keep_insertion_order() {
        let (session, api, _bus) = session();
        session.open_chat("c1");
        api.hold_sends();

        let first = session.send("one").unwrap();
        let second = session.send("two").unwrap();
        assert_eq!(contents(&session), ["one", "two"]);

        api.release_sends();
        first.outcome().await.unwrap();
        second.outcome().await.unwrap();
        assert_eq!(session.visible_messages().len(), 2);
        assert!(session.visible_messages().iter().all(|m| !m.is_optimistic));
    }

    #[tokio::test]
    async fn test_inbound_message_for_active_chat() {
        let (session, _api, bus) = session();
        session.open_chat("c1");
        let mut events = bus.subscribe();

        let incoming = ServerEvent::NewMessage {
            chat_id: "c1".into(),
            message: message("m5", "c1", "u2", "on my way", 5),
        };
        assert!(session.handle_event(&incoming));
        assert!(!session.handle_event(&incoming));
        assert_eq!(contents(&session), ["on my way"]);

        let elsewhere = ServerEvent::NewMessage {
            chat_id: "c2".into(),
            message: message("m6", "c2", "u3", "ping", 6),
        };
        assert!(!session.handle_event(&elsewhere));
        assert_eq!(
            events.recv().await.unwrap(),
            AppEvent::ChatActivity {
                chat_id: "c2".into()
            }
        );
    }

    #[tokio::test]
    async fn test_redelivered_message_for_other_chat_is_ignored() {
        let (session, _api, bus) = session();
        session.open_chat("c1");
        let mut events = bus.subscribe();

        let elsewhere = ServerEvent::NewMessage {
            chat_id: "c2".into(),
            message: message("m8", "c2", "u3", "still there?", 8),
        };
        session.handle_event(&elsewhere);
        session.handle_event(&elsewhere);

        assert_eq!(
            events.recv().await.unwrap(),
            AppEvent::ChatActivity {
                chat_id: "c2".into()
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pending_entry_stays_after_inbound_messages() {
        let (session, api, _bus) = session();
        session.open_chat("c1");
        api.hold_sends();

        let _pending = session.send("mine").unwrap();
        session.handle_event(&ServerEvent::NewMessage {
            chat_id: "c1".into(),
            message: message("m7", "c1", "u2", "theirs", 7),
        });

        assert_eq!(contents(&session), ["theirs", "mine"]);
        api.release_sends();
    }

    #[tokio::test]
    async fn test_read_receipts_and_reactions() {
        let (session, api, _bus) = session();
        api.seed_history("c1", vec![message("m1", "c1", "u2", "hi", 1)]);
        session.open_chat("c1");
        session.load_history().await.unwrap();

        assert!(session.handle_event(&ServerEvent::MessageRead {
            chat_id: "c1".into(),
            message_ids: vec!["m1".into()],
            reader_id: "u2".into(),
        }));
        assert!(session.visible_messages()[0].message.is_read);

        let reaction = ServerEvent::ReactionAdded {
            event_id: "r1".into(),
            chat_id: "c1".into(),
            message_id: "m1".into(),
            user_id: "u2".into(),
            emoji: "✂️".into(),
        };
        assert!(session.handle_event(&reaction));
        assert!(!session.handle_event(&reaction));
        assert_eq!(session.visible_messages()[0].message.reactions.len(), 1);

        assert!(session.handle_event(&ServerEvent::ReactionRemoved {
            event_id: "r2".into(),
            chat_id: "c1".into(),
            message_id: "m1".into(),
            user_id: "u2".into(),
            emoji: "✂️".into(),
        }));
        assert!(session.visible_messages()[0].message.reactions.is_empty());
    }

    #[tokio::test]
    async fn test_typing_presence_and_positions() {
        let (session, _api, _bus) = session();
        session.open_chat("c1");

        session.handle_event(&ServerEvent::UserTyping {
            chat_id: "c1".into(),
            user_id: "u2".into(),
            is_typing: true,
        });
        session.handle_event(&ServerEvent::UserTyping {
            chat_id: "c1".into(),
            user_id: "me".into(),
            is_typing: true,
        });
        assert_eq!(session.typing_users(), ["u2"]);

        session.handle_event(&ServerEvent::UserStatusChange {
            user_id: "u2".into(),
            is_online: true,
        });
        assert!(session.is_online("u2"));

        let now = Utc::now();
        session.handle_event(&ServerEvent::LocationUpdate {
            provider_id: "b1".into(),
            coordinates: Coordinates::new(-0.1, 51.5),
            updated_at: now,
        });
        assert_eq!(
            session.provider_position("b1").unwrap().coordinates,
            Coordinates::new(-0.1, 51.5)
        );
    }

    #[tokio::test]
    async fn test_paging_through_history() {
        let (session, api, _bus) = session();
        api.seed_history(
            "c1",
            (1..=5)
                .map(|i| message(&format!("m{i}"), "c1", "u2", &format!("msg {i}"), i))
                .collect(),
        );
        session.open_chat("c1");

        assert!(session.load_older().await.unwrap());
        assert_eq!(contents(&session), ["msg 4", "msg 5"]);
        assert!(session.has_more());

        assert!(session.load_older().await.unwrap());
        assert!(session.load_older().await.unwrap());
        assert_eq!(
            contents(&session),
            ["msg 1", "msg 2", "msg 3", "msg 4", "msg 5"]
        );
        assert!(!session.has_more());
        assert!(!session.load_older().await.unwrap());
    }

    #[tokio::test]
    async fn test_completion_after_shutdown_is_ignored() {
        let (session, api, bus) = session();
        session.open_chat("c1");
        api.hold_sends();
        api.fail_sends(Some(ApiError::Network("down".into())));
        let mut events = bus.subscribe();

        let pending = session.send("late").unwrap();
        session.shutdown();
        api.release_sends();

        assert_eq!(pending.outcome().await.unwrap_err(), SyncError::Offline);
        assert!(session.last_error().is_none());
        assert!(events.try_recv().is_err());
        assert!(!session.handle_event(&ServerEvent::UserStatusChange {
            user_id: "u2".into(),
            is_online: true,
        }));
    }

    #[test]
    fn test_typing_without_socket_is_offline() {
        let (session, _api, _bus) = session();
        session.open_chat("c1");
        assert_eq!(session.set_typing(true), Err(SyncError::Offline));
    }
}
