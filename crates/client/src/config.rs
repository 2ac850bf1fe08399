//! Client configuration from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use barberline_shared::Role;

/// Minimum time between two throttled location publishes.
pub const DEFAULT_LOCATION_INTERVAL: Duration = Duration::from_secs(60);
/// Bound on a single positioning request.
pub const DEFAULT_POSITION_TIMEOUT: Duration = Duration::from_secs(10);
/// Readings younger than this are reused by the positioning API instead of re-acquired.
pub const POSITION_MAX_AGE: Duration = Duration::from_secs(30);
/// A cached location older than this is not restored.
pub const CACHE_FRESHNESS: Duration = Duration::from_secs(5 * 60);
/// Bound on a single remote call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// Unread count poll period.
pub const DEFAULT_UNREAD_POLL: Duration = Duration::from_secs(30);

/// Runtime settings for a client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the REST API, e.g. `https://api.barberline.app`.
    /// Env: `BARBERLINE_API_URL` (default: `http://localhost:5000`)
    pub api_url: String,
    /// Socket URL. Derived from `api_url` when unset.
    /// Env: `BARBERLINE_SOCKET_URL`
    pub socket_url: String,
    /// Bearer token issued by the auth flow.
    /// Env: `BARBERLINE_TOKEN`
    pub token: Option<String>,
    /// Id of the signed-in subject.
    /// Env: `BARBERLINE_USER_ID`
    pub user_id: String,
    /// Env: `BARBERLINE_ROLE` (customer | barber | admin, default: customer)
    pub role: Role,
    /// Directory for durable client state. Platform config dir when unset.
    /// Env: `BARBERLINE_DATA_DIR`
    pub data_dir: Option<PathBuf>,
    /// Env: `BARBERLINE_LOCATION_INTERVAL_SECS` (default: 60)
    pub location_interval: Duration,
    pub position_timeout: Duration,
    pub request_timeout: Duration,
    /// Env: `BARBERLINE_UNREAD_POLL_SECS` (default: 30)
    pub unread_poll: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let api_url = "http://localhost:5000".to_string();
        Self {
            socket_url: socket_url_for(&api_url),
            api_url,
            token: None,
            user_id: String::new(),
            role: Role::Customer,
            data_dir: None,
            location_interval: DEFAULT_LOCATION_INTERVAL,
            position_timeout: DEFAULT_POSITION_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            unread_poll: DEFAULT_UNREAD_POLL,
        }
    }
}

impl ClientConfig {
    /// Build a config from the environment, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let api_url = std::env::var("BARBERLINE_API_URL")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_url);

        let socket_url =
            std::env::var("BARBERLINE_SOCKET_URL").unwrap_or_else(|_| socket_url_for(&api_url));

        let role = match std::env::var("BARBERLINE_ROLE") {
            Ok(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Ignoring BARBERLINE_ROLE");
                Role::Customer
            }),
            Err(_) => defaults.role,
        };

        Self {
            api_url,
            socket_url,
            token: std::env::var("BARBERLINE_TOKEN").ok().filter(|t| !t.is_empty()),
            user_id: std::env::var("BARBERLINE_USER_ID").unwrap_or_default(),
            role,
            data_dir: std::env::var("BARBERLINE_DATA_DIR").ok().map(PathBuf::from),
            location_interval: env_secs("BARBERLINE_LOCATION_INTERVAL_SECS")
                .unwrap_or(defaults.location_interval),
            unread_poll: env_secs("BARBERLINE_UNREAD_POLL_SECS").unwrap_or(defaults.unread_poll),
            ..defaults
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()?
        .parse::<u64>()
        .ok()
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
}

/// Convert an HTTP(S) API URL into the matching WS(S) socket URL.
pub fn socket_url_for(api_url: &str) -> String {
    let Ok(mut url) = url::Url::parse(api_url) else {
        return api_url.to_string();
    };
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    if url.set_scheme(scheme).is_err() {
        return api_url.to_string();
    }
    url.set_path("/socket");
    url.to_string()
}
