//! Barberline client sync layer.
//!
//! Keeps a marketplace client in step with the backend: a provider's live
//! location, optimistic chat messages reconciled against the socket, and the
//! unread notification count. [`MarketplaceClient`] wires every piece together.

pub mod api_client;
pub mod bus;
pub mod chat;
pub mod client;
pub mod config;
pub mod geocode;
pub mod loader;
pub mod location;
pub mod logging;
pub mod notifications;
pub mod storage;
pub mod ws;

#[cfg(test)]
mod test_support;

pub use api_client::{ApiClient, MarketplaceApi};
pub use bus::{AppEvent, EventBus, Notice, NoticeLevel};
pub use client::MarketplaceClient;
pub use config::ClientConfig;
pub use storage::Storage;
