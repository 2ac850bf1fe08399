//! In-memory backend used by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use barberline_shared::{
    ApiError, ChatMessage, Coordinates, MapsConfig, MessagesPage, Notification,
    NotificationsPage, Pagination, Role, SubjectProfile,
};
use chrono::{TimeZone, Utc};
use tokio::sync::watch;

use crate::api_client::MarketplaceApi;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    UpdateLocation(Coordinates, Option<String>),
    SendMessage(String, String),
    GetMessages(String, Option<u32>),
    UnreadCount,
    Notifications(Option<u32>),
    MarkAsRead(String),
    MarkAllAsRead,
    DeleteNotification(String),
    MapsConfig,
}

pub struct MockApi {
    pub user_id: String,
    calls: Mutex<Vec<Call>>,
    location_error: Mutex<Option<ApiError>>,
    send_error: Mutex<Option<ApiError>>,
    notification_error: Mutex<Option<ApiError>>,
    maps_error: Mutex<Option<ApiError>>,
    sends_open: watch::Sender<bool>,
    history: Mutex<HashMap<String, Vec<ChatMessage>>>,
    page_size: usize,
    unread: Mutex<u32>,
    notifications: Mutex<Vec<Notification>>,
    next_id: AtomicU32,
}

impl MockApi {
    pub fn new() -> Self {
        let (sends_open, _) = watch::channel(true);
        Self {
            user_id: "me".to_string(),
            calls: Mutex::new(Vec::new()),
            location_error: Mutex::new(None),
            send_error: Mutex::new(None),
            notification_error: Mutex::new(None),
            maps_error: Mutex::new(None),
            sends_open,
            history: Mutex::new(HashMap::new()),
            page_size: 2,
            unread: Mutex::new(0),
            notifications: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn location_updates(&self) -> Vec<Coordinates> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::UpdateLocation(coords, _) => Some(coords),
                _ => None,
            })
            .collect()
    }

    pub fn maps_config_calls(&self) -> usize {
        self.calls().iter().filter(|c| **c == Call::MapsConfig).count()
    }

    pub fn fail_location_updates(&self, err: Option<ApiError>) {
        *self.location_error.lock().unwrap() = err;
    }

    pub fn fail_sends(&self, err: Option<ApiError>) {
        *self.send_error.lock().unwrap() = err;
    }

    pub fn fail_notification_ops(&self, err: Option<ApiError>) {
        *self.notification_error.lock().unwrap() = err;
    }

    pub fn fail_maps_config(&self, err: Option<ApiError>) {
        *self.maps_error.lock().unwrap() = err;
    }

    /// Hold every send until [`MockApi::release_sends`].
    pub fn hold_sends(&self) {
        self.sends_open.send_replace(false);
    }

    pub fn release_sends(&self) {
        self.sends_open.send_replace(true);
    }

    pub fn set_unread(&self, count: u32) {
        *self.unread.lock().unwrap() = count;
    }

    pub fn set_notifications(&self, notifications: Vec<Notification>) {
        *self.notifications.lock().unwrap() = notifications;
    }

    /// Seed a chat's full history, oldest first.
    pub fn seed_history(&self, chat_id: &str, messages: Vec<ChatMessage>) {
        self.history
            .lock()
            .unwrap()
            .insert(chat_id.to_string(), messages);
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

/// Message fixture with a deterministic timestamp.
pub fn message(id: &str, chat_id: &str, sender: &str, content: &str, minute: u32) -> ChatMessage {
    ChatMessage {
        id: id.to_string(),
        chat_id: chat_id.to_string(),
        sender: sender.to_string(),
        content: content.to_string(),
        created_at: Utc.with_ymd_and_hms(2026, 5, 1, 12, minute, 0).unwrap(),
        is_read: false,
        reactions: Vec::new(),
    }
}

pub fn notification(id: &str, is_read: bool) -> Notification {
    Notification {
        id: id.to_string(),
        title: format!("Booking update {id}"),
        body: String::new(),
        is_read,
        created_at: Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
    }
}

#[async_trait]
impl MarketplaceApi for MockApi {
    async fn update_location(
        &self,
        coordinates: Coordinates,
        address: Option<String>,
    ) -> Result<SubjectProfile, ApiError> {
        self.record(Call::UpdateLocation(coordinates, address));
        if let Some(err) = self.location_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(SubjectProfile {
            id: self.user_id.clone(),
            name: "Test Barber".to_string(),
            role: Role::Barber,
            is_online: true,
            location: None,
        })
    }

    async fn send_message(&self, chat_id: &str, content: &str) -> Result<ChatMessage, ApiError> {
        self.record(Call::SendMessage(chat_id.to_string(), content.to_string()));

        let mut open = self.sends_open.subscribe();
        let _ = open.wait_for(|open| *open).await;

        if let Some(err) = self.send_error.lock().unwrap().clone() {
            return Err(err);
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut stored = message(&format!("srv-{n}"), chat_id, &self.user_id, content, 30);
        stored.created_at = Utc::now();
        self.history
            .lock()
            .unwrap()
            .entry(chat_id.to_string())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn get_chat_messages(
        &self,
        chat_id: &str,
        page: Option<u32>,
    ) -> Result<MessagesPage, ApiError> {
        self.record(Call::GetMessages(chat_id.to_string(), page));
        let all = self
            .history
            .lock()
            .unwrap()
            .get(chat_id)
            .cloned()
            .unwrap_or_default();

        // Page 1 is the newest slice; each page is ordered oldest to newest.
        let page = page.unwrap_or(1).max(1);
        let total_pages = all.len().div_ceil(self.page_size).max(1) as u32;
        let end = all.len().saturating_sub((page as usize - 1) * self.page_size);
        let start = end.saturating_sub(self.page_size);
        Ok(MessagesPage {
            messages: all[start..end].to_vec(),
            pagination: Pagination {
                page,
                total_pages,
                has_more: page < total_pages,
            },
        })
    }

    async fn get_unread_count(&self) -> Result<u32, ApiError> {
        self.record(Call::UnreadCount);
        Ok(*self.unread.lock().unwrap())
    }

    async fn get_notifications(&self, page: Option<u32>) -> Result<NotificationsPage, ApiError> {
        self.record(Call::Notifications(page));
        Ok(NotificationsPage {
            notifications: self.notifications.lock().unwrap().clone(),
            pagination: Pagination {
                page: page.unwrap_or(1),
                total_pages: 1,
                has_more: false,
            },
        })
    }

    async fn mark_as_read(&self, notification_id: &str) -> Result<(), ApiError> {
        self.record(Call::MarkAsRead(notification_id.to_string()));
        match self.notification_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn mark_all_as_read(&self) -> Result<(), ApiError> {
        self.record(Call::MarkAllAsRead);
        match self.notification_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn delete_notification(&self, notification_id: &str) -> Result<(), ApiError> {
        self.record(Call::DeleteNotification(notification_id.to_string()));
        match self.notification_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn get_maps_config(&self) -> Result<MapsConfig, ApiError> {
        self.record(Call::MapsConfig);
        if let Some(err) = self.maps_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(MapsConfig {
            geocode_url: "https://geo.example/reverse".to_string(),
            api_key: None,
        })
    }
}
