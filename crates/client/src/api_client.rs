//! HTTP client for the marketplace REST API.

use std::time::Duration;

use async_trait::async_trait;
use barberline_shared::{
    ApiError, ChatMessage, Coordinates, MapsConfig, MessagesPage, NotificationsPage,
    SendMessageRequest, SubjectProfile, UnreadCountResponse, UpdateLocationRequest,
};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::DEFAULT_REQUEST_TIMEOUT;

/// Remote operations consumed by the synchronization layer.
///
/// [`ApiClient`] is the HTTP implementation; tests substitute their own.
#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    /// Persist a position sample for the signed-in provider.
    async fn update_location(
        &self,
        coordinates: Coordinates,
        address: Option<String>,
    ) -> Result<SubjectProfile, ApiError>;

    async fn send_message(&self, chat_id: &str, content: &str) -> Result<ChatMessage, ApiError>;

    /// Fetch one page of a chat's history, oldest to newest within the page.
    async fn get_chat_messages(
        &self,
        chat_id: &str,
        page: Option<u32>,
    ) -> Result<MessagesPage, ApiError>;

    async fn get_unread_count(&self) -> Result<u32, ApiError>;

    async fn get_notifications(&self, page: Option<u32>) -> Result<NotificationsPage, ApiError>;

    async fn mark_as_read(&self, notification_id: &str) -> Result<(), ApiError>;

    async fn mark_all_as_read(&self) -> Result<(), ApiError>;

    async fn delete_notification(&self, notification_id: &str) -> Result<(), ApiError>;

    /// Bootstrap document for the map/geocoding provider.
    async fn get_maps_config(&self) -> Result<MapsConfig, ApiError>;
}

/// HTTP client with bearer authentication.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    /// Client whose requests fail with [`ApiError::Timeout`] after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                Client::new()
            });
        Self {
            client,
            base_url: String::new(),
            token: None,
        }
    }

    /// Set the base URL for API requests
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the bearer token sent with every request
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let rb = self.client.request(method, self.url(path));
        match &self.token {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }

    async fn execute(&self, rb: RequestBuilder) -> Result<String, ApiError> {
        let resp = rb.send().await.map_err(map_transport_error)?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let text = resp.text().await.map_err(map_transport_error)?;

        if !is_success {
            tracing::debug!(status, body = %text, "API request rejected");
            return Err(ApiError::Http { status, body: text });
        }
        Ok(text)
    }

    fn decode<TRes: DeserializeOwned>(text: &str) -> Result<TRes, ApiError> {
        let text = if text.is_empty() { "null" } else { text };
        serde_json::from_str(text).map_err(|e| ApiError::Deserialize(e.to_string()))
    }

    pub async fn get_json<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ApiError> {
        let text = self.execute(self.request(Method::GET, path)).await?;
        Self::decode(&text)
    }

    pub async fn post_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let text = self
            .execute(self.request(Method::POST, path).json(body))
            .await?;
        Self::decode(&text)
    }

    pub async fn put_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let text = self
            .execute(self.request(Method::PUT, path).json(body))
            .await?;
        Self::decode(&text)
    }

    /// PATCH without a body; the response is discarded.
    pub async fn patch_empty(&self, path: &str) -> Result<(), ApiError> {
        self.execute(self.request(Method::PATCH, path)).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.execute(self.request(Method::DELETE, path)).await?;
        Ok(())
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

fn map_transport_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Network(e.to_string())
    }
}

fn page_query(page: Option<u32>) -> String {
    page.map(|p| format!("?page={p}")).unwrap_or_default()
}

#[async_trait]
impl MarketplaceApi for ApiClient {
    async fn update_location(
        &self,
        coordinates: Coordinates,
        address: Option<String>,
    ) -> Result<SubjectProfile, ApiError> {
        let body = UpdateLocationRequest {
            coordinates,
            address,
        };
        self.put_json("/api/users/location", &body).await
    }

    async fn send_message(&self, chat_id: &str, content: &str) -> Result<ChatMessage, ApiError> {
        let body = SendMessageRequest {
            content: content.to_string(),
        };
        let path = format!("/api/chats/{}/messages", urlencoding::encode(chat_id));
        self.post_json(&path, &body).await
    }

    async fn get_chat_messages(
        &self,
        chat_id: &str,
        page: Option<u32>,
    ) -> Result<MessagesPage, ApiError> {
        let path = format!(
            "/api/chats/{}/messages{}",
            urlencoding::encode(chat_id),
            page_query(page)
        );
        self.get_json(&path).await
    }

    async fn get_unread_count(&self) -> Result<u32, ApiError> {
        let resp: UnreadCountResponse = self.get_json("/api/notifications/unread-count").await?;
        Ok(resp.count)
    }

    async fn get_notifications(&self, page: Option<u32>) -> Result<NotificationsPage, ApiError> {
        self.get_json(&format!("/api/notifications{}", page_query(page)))
            .await
    }

    async fn mark_as_read(&self, notification_id: &str) -> Result<(), ApiError> {
        let path = format!(
            "/api/notifications/{}/read",
            urlencoding::encode(notification_id)
        );
        self.patch_empty(&path).await
    }

    async fn mark_all_as_read(&self) -> Result<(), ApiError> {
        self.patch_empty("/api/notifications/read-all").await
    }

    async fn delete_notification(&self, notification_id: &str) -> Result<(), ApiError> {
        let path = format!("/api/notifications/{}", urlencoding::encode(notification_id));
        self.delete(&path).await
    }

    async fn get_maps_config(&self) -> Result<MapsConfig, ApiError> {
        self.get_json("/api/config/maps").await
    }
}
