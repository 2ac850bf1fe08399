//! Error types shared by every client component.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body returned by the backend on 4xx/5xx responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Attempt to parse an error body into a user-facing message.
/// Prefers `message`, falls back to `error`.
pub fn error_message_from_body(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok()?;
    [parsed.message, parsed.error]
        .into_iter()
        .flatten()
        .find(|m| !m.trim().is_empty())
}

/// Transport-level failure of a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out")]
    Timeout,
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

/// Failure of a synchronization operation.
///
/// Nothing here is fatal to the application: every variant degrades to a
/// visible notice plus a rollback of whatever optimistic state depended on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Positioning is absent or the subject may not publish. Terminal for the session.
    #[error("Location services are unavailable: {0}")]
    CapabilityUnavailable(String),
    /// The user refused access to positioning.
    #[error("Location permission denied")]
    PermissionDenied,
    /// A positioning request or remote call exceeded its bound.
    #[error("Operation timed out")]
    Timeout,
    /// The backend answered with an error status.
    #[error("Request rejected ({status}): {message}")]
    RemoteRejected { status: u16, message: String },
    /// The backend could not be reached.
    #[error("You appear to be offline")]
    Offline,
    #[error("{0}")]
    InvalidInput(String),
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Network(_) => SyncError::Offline,
            ApiError::Timeout => SyncError::Timeout,
            ApiError::Http { status, body } => SyncError::RemoteRejected {
                status,
                message: error_message_from_body(&body).unwrap_or(body),
            },
            ApiError::Deserialize(msg) => SyncError::RemoteRejected {
                status: 200,
                message: format!("unexpected response: {msg}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_prefers_message_field() {
        let body = r#"{"message":"Chat not found","error":"NotFound"}"#;
        assert_eq!(error_message_from_body(body).as_deref(), Some("Chat not found"));
    }

    #[test]
    fn test_error_message_falls_back_to_error_field() {
        let body = r#"{"message":"  ","error":"Forbidden"}"#;
        assert_eq!(error_message_from_body(body).as_deref(), Some("Forbidden"));
        assert_eq!(error_message_from_body("<html>"), None);
    }

    #[test]
    fn test_api_error_maps_to_taxonomy() {
        assert_eq!(
            SyncError::from(ApiError::Network("dns".into())),
            SyncError::Offline
        );
        assert_eq!(SyncError::from(ApiError::Timeout), SyncError::Timeout);
        let rejected = SyncError::from(ApiError::Http {
            status: 422,
            body: r#"{"message":"Invalid coordinates"}"#.into(),
        });
        assert_eq!(
            rejected,
            SyncError::RemoteRejected {
                status: 422,
                message: "Invalid coordinates".into()
            }
        );
    }
}
