//! Headless Barberline client.
//!
//! Connects with the configuration from the environment, keeps the session in
//! sync and logs every bus event until Ctrl-C.

use anyhow::Result;
use barberline_client::{logging, AppEvent, ClientConfig, MarketplaceClient};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(logging::DEFAULT_FILTER);

    let config = ClientConfig::from_env();
    if config.token.is_none() {
        tracing::warn!("BARBERLINE_TOKEN is not set; the socket stays disconnected");
    }
    tracing::info!(api = %config.api_url, socket = %config.socket_url, "Starting client");

    let client = MarketplaceClient::connect(config)?;
    let mut events = client.bus().subscribe();

    match client.unread().refresh().await {
        Ok(count) => tracing::info!(count, "Unread notifications"),
        Err(e) => tracing::warn!(error = %e, "Could not fetch unread count"),
    }
    if let Some(sample) = client.publisher().last_known_location() {
        tracing::info!(?sample, "Restored last known location");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(AppEvent::Notice(notice)) => {
                    tracing::info!(level = ?notice.level, "{}", notice.message);
                }
                Ok(event) => tracing::debug!(?event, "Bus event"),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "Bus lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    tracing::info!("Shutting down");
    client.shutdown().await;
    Ok(())
}
