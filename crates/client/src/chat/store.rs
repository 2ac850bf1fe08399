//! Message store for every chat the client has seen.
//!
//! Server-sourced messages are kept per chat in fetch/arrival order. Optimistic
//! entries live beside them and are appended positionally when the visible list
//! is built, so they never mix with confirmed history and are never persisted.

use std::collections::{HashMap, HashSet, VecDeque};

use barberline_shared::{ChatMessage, Coordinates, MessagesPage, Pagination, Reaction};
use chrono::{DateTime, Utc};

/// Remembered interaction event ids, oldest evicted first.
const SEEN_EVENTS_CAPACITY: usize = 512;

/// A message as rendered: confirmed, or still waiting for the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleMessage {
    pub message: ChatMessage,
    pub is_optimistic: bool,
}

/// Confirmed messages of a single chat.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChatHistory {
    /// In fetch/arrival order; older pages are prepended.
    pub messages: Vec<ChatMessage>,
    /// Whether the first page has been fetched.
    pub is_loaded: bool,
    /// Pagination of the oldest page fetched so far.
    pub pagination: Pagination,
}

impl ChatHistory {
    /// Append a message. Returns false if a message with the same id is already held.
    pub fn add_message(&mut self, msg: ChatMessage) -> bool {
        if self.contains(&msg.id) {
            return false;
        }
        self.messages.push(msg);
        true
    }

    /// Replace the history with the newest page.
    pub fn set_history(&mut self, page: MessagesPage) {
        // Messages that arrived over the socket while the fetch was in flight survive.
        let mut live: Vec<ChatMessage> = std::mem::take(&mut self.messages);
        live.retain(|m| !page.messages.iter().any(|p| p.id == m.id));

        self.messages = page.messages;
        self.messages.extend(live);
        self.pagination = page.pagination;
        self.is_loaded = true;
    }

    /// Insert an older page in front of what is held. Returns how many were new.
    pub fn prepend_page(&mut self, page: MessagesPage) -> usize {
        let older: Vec<ChatMessage> = page
            .messages
            .into_iter()
            .filter(|m| !self.contains(&m.id))
            .collect();
        let added = older.len();
        self.messages.splice(0..0, older);
        self.pagination = page.pagination;
        added
    }

    pub fn has_more(&self) -> bool {
        self.pagination.has_more
    }

    fn contains(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| m.id == id)
    }
}

/// Last broadcast position of a provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProviderPosition {
    pub coordinates: Coordinates,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MessageStore {
    chats: HashMap<String, ChatHistory>,
    /// Unconfirmed sends across all chats, in send order.
    optimistic: Vec<ChatMessage>,
    seen_events: VecDeque<String>,
    seen_index: HashSet<String>,
    typing: HashMap<String, HashSet<String>>,
    online: HashSet<String>,
    providers: HashMap<String, ProviderPosition>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self, chat_id: &str) -> Option<&ChatHistory> {
        self.chats.get(chat_id)
    }

    pub fn history_mut(&mut self, chat_id: &str) -> &mut ChatHistory {
        self.chats.entry(chat_id.to_string()).or_default()
    }

    /// Confirmed messages followed by this chat's optimistic entries.
    pub fn visible(&self, chat_id: &str) -> Vec<VisibleMessage> {
        let confirmed = self
            .chats
            .get(chat_id)
            .map(|h| h.messages.as_slice())
            .unwrap_or_default()
            .iter()
            .map(|m| VisibleMessage {
                message: m.clone(),
                is_optimistic: false,
            });
        let pending = self
            .optimistic
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .map(|m| VisibleMessage {
                message: m.clone(),
                is_optimistic: true,
            });
        confirmed.chain(pending).collect()
    }

    pub fn insert_optimistic(&mut self, msg: ChatMessage) {
        self.optimistic.push(msg);
    }

    pub fn pending_count(&self) -> usize {
        self.optimistic.len()
    }

    /// Swap the optimistic entry `local_id` for the stored copy.
    pub fn confirm(&mut self, local_id: &str, stored: ChatMessage) {
        self.optimistic.retain(|m| m.id != local_id);
        let chat_id = stored.chat_id.clone();
        if !self.history_mut(&chat_id).add_message(stored) {
            tracing::trace!(local_id, "Stored copy already delivered");
        }
    }

    /// Drop the optimistic entry `local_id`. Returns false if it was already gone.
    pub fn rollback(&mut self, local_id: &str) -> bool {
        let before = self.optimistic.len();
        self.optimistic.retain(|m| m.id != local_id);
        self.optimistic.len() != before
    }

    /// Flag the given messages as read. Returns how many changed.
    pub fn mark_read(&mut self, chat_id: &str, message_ids: &[String]) -> usize {
        let Some(history) = self.chats.get_mut(chat_id) else {
            return 0;
        };
        let mut changed = 0;
        for msg in history.messages.iter_mut() {
            if !msg.is_read && message_ids.contains(&msg.id) {
                msg.is_read = true;
                changed += 1;
            }
        }
        changed
    }

    /// Record `event_id`. Returns false if it was seen before.
    pub fn remember_event(&mut self, event_id: &str) -> bool {
        if !self.seen_index.insert(event_id.to_string()) {
            return false;
        }
        self.seen_events.push_back(event_id.to_string());
        if self.seen_events.len() > SEEN_EVENTS_CAPACITY {
            if let Some(evicted) = self.seen_events.pop_front() {
                self.seen_index.remove(&evicted);
            }
        }
        true
    }

    /// Add or remove one user's reaction on a message.
    pub fn apply_reaction(
        &mut self,
        chat_id: &str,
        message_id: &str,
        reaction: Reaction,
        added: bool,
    ) -> bool {
        let Some(msg) = self
            .chats
            .get_mut(chat_id)
            .and_then(|h| h.find_mut(message_id))
        else {
            return false;
        };
        if added {
            if msg.reactions.contains(&reaction) {
                return false;
            }
            msg.reactions.push(reaction);
        } else {
            let before = msg.reactions.len();
            msg.reactions.retain(|r| *r != reaction);
            if msg.reactions.len() == before {
                return false;
            }
        }
        true
    }

    pub fn set_typing(&mut self, chat_id: &str, user_id: &str, is_typing: bool) {
        let users = self.typing.entry(chat_id.to_string()).or_default();
        if is_typing {
            users.insert(user_id.to_string());
        } else {
            users.remove(user_id);
        }
    }

    /// Users currently typing in `chat_id`, sorted.
    pub fn typing_users(&self, chat_id: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .typing
            .get(chat_id)
            .map(|u| u.iter().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    pub fn set_presence(&mut self, user_id: &str, is_online: bool) {
        if is_online {
            self.online.insert(user_id.to_string());
        } else {
            self.online.remove(user_id);
            for users in self.typing.values_mut() {
                users.remove(user_id);
            }
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains(user_id)
    }

    /// Keep the newest broadcast position per provider.
    pub fn set_provider_position(&mut self, provider_id: &str, position: ProviderPosition) {
        let entry = self.providers.entry(provider_id.to_string());
        match entry {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                if e.get().updated_at <= position.updated_at {
                    e.insert(position);
                }
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(position);
            }
        }
    }

    pub fn provider_position(&self, provider_id: &str) -> Option<ProviderPosition> {
        self.providers.get(provider_id).copied()
    }
}
