//! Reverse geocoding of provider positions into street addresses.
//!
//! The map provider is configured by the backend, so the geocoder is
//! bootstrapped lazily (once, shared by every caller) through [`SingleFlight`].
//! A failed bootstrap is attempted again on the next lookup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use barberline_shared::{Coordinates, MapsConfig, SyncError};

use crate::api_client::MarketplaceApi;
use crate::loader::{LoadState, SingleFlight};

#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    /// Human-readable address for a point, `None` when the provider has no match.
    async fn reverse(&self, coordinates: Coordinates) -> Result<Option<String>, SyncError>;
}

/// Geocoder speaking a Nominatim-style HTTP API.
#[derive(Debug, Clone)]
pub struct HttpGeocoder {
    client: reqwest::Client,
    config: MapsConfig,
}

impl HttpGeocoder {
    pub fn new(config: MapsConfig, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    fn request_url(&self, coordinates: Coordinates) -> Result<url::Url, SyncError> {
        let lat = coordinates.latitude.to_string();
        let lon = coordinates.longitude.to_string();
        let mut params = vec![("lat", lat), ("lon", lon), ("format", "json".to_string())];
        if let Some(key) = &self.config.api_key {
            params.push(("key", key.clone()));
        }
        url::Url::parse_with_params(&self.config.geocode_url, &params)
            .map_err(|e| SyncError::CapabilityUnavailable(format!("bad geocode url: {e}")))
    }
}

/// Pull an address out of either a Nominatim (`display_name`) or a
/// Google-style (`results[0].formatted_address`) response.
pub fn parse_address(body: &serde_json::Value) -> Option<String> {
    body.get("display_name")
        .and_then(|v| v.as_str())
        .or_else(|| {
            body.get("results")?
                .get(0)?
                .get("formatted_address")?
                .as_str()
        })
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

#[async_trait]
impl ReverseGeocoder for HttpGeocoder {
    async fn reverse(&self, coordinates: Coordinates) -> Result<Option<String>, SyncError> {
        let url = self.request_url(coordinates)?;
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::Timeout
            } else {
                SyncError::Offline
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::RemoteRejected {
                status: status.as_u16(),
                message: "geocoding failed".into(),
            });
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| SyncError::RemoteRejected {
            status: status.as_u16(),
            message: e.to_string(),
        })?;
        Ok(parse_address(&body))
    }
}

/// Lazily bootstrapped map service.
#[derive(Clone)]
pub struct MapsService {
    flight: SingleFlight<HttpGeocoder>,
}

impl MapsService {
    pub fn new(api: Arc<dyn MarketplaceApi>, timeout: Duration) -> Self {
        let flight = SingleFlight::new(move || {
            let api = api.clone();
            async move {
                let config = api.get_maps_config().await?;
                tracing::debug!(geocode_url = %config.geocode_url, "Map service configured");
                Ok(HttpGeocoder::new(config, timeout))
            }
        });
        Self { flight }
    }

    pub fn state(&self) -> LoadState {
        self.flight.state()
    }

    /// Bootstrap the service. A previous failure is attempted again.
    pub async fn ensure_ready(&self) -> Result<(), SyncError> {
        self.geocoder().await.map(|_| ())
    }

    async fn geocoder(&self) -> Result<Arc<HttpGeocoder>, SyncError> {
        self.flight.retry().await
    }
}

#[async_trait]
impl ReverseGeocoder for MapsService {
    async fn reverse(&self, coordinates: Coordinates) -> Result<Option<String>, SyncError> {
        let geocoder = self.geocoder().await?;
        geocoder.reverse(coordinates).await
    }
}
