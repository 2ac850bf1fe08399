//! Client context.
//!
//! [`MarketplaceClient`] owns one instance of every service, wired to a single
//! [`EventBus`], and runs the event pump that routes socket traffic:
//!
//! ```text
//!   socket events ──► chat session ─┐
//!        │                          ├──► bus ──► unread counter
//!        └─ unread_count ───────────┘
//!   connection state ──► location publisher (reconnect republish)
//!   own status change ──► location publisher (online coupling)
//! ```

use std::sync::Arc;

use anyhow::Context;
use barberline_shared::{Role, ServerEvent};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::api_client::{ApiClient, MarketplaceApi};
use crate::bus::{AppEvent, EventBus};
use crate::chat::ChatSession;
use crate::config::ClientConfig;
use crate::geocode::MapsService;
use crate::location::{LocationCache, LocationPublisher, PositionFeed, PublisherConfig};
use crate::notifications::{NotificationCenter, UnreadCounter};
use crate::storage::Storage;
use crate::ws::{ConnectionState, ReconnectConfig, SocketConnection, SocketHandle};

/// Routes socket traffic to the services that care about it.
#[derive(Clone)]
struct Router {
    user_id: String,
    chat: ChatSession,
    publisher: LocationPublisher,
    bus: EventBus,
}

impl Router {
    async fn route_event(&self, event: ServerEvent) {
        match &event {
            ServerEvent::UnreadCount { count } => {
                self.bus.publish(AppEvent::UnreadCountChanged(*count));
            }
            ServerEvent::UserStatusChange { user_id, is_online } if *user_id == self.user_id => {
                self.chat.handle_event(&event);
                if let Err(e) = self.publisher.set_online(*is_online).await {
                    tracing::info!(error = %e, "Location tracking not started");
                }
            }
            _ => {
                self.chat.handle_event(&event);
            }
        }
    }

    async fn route_state(&self, state: &ConnectionState) {
        if state.is_connected() {
            self.chat.rejoin();
            self.publisher.set_connectivity(true).await;
        } else {
            self.publisher.set_connectivity(false).await;
        }
    }
}

async fn run_pump(
    router: Router,
    mut events: broadcast::Receiver<ServerEvent>,
    mut state: watch::Receiver<ConnectionState>,
) {
    let mut last = state.borrow_and_update().clone();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => router.route_event(event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event pump lagged behind the socket");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    return;
                }
                let current = state.borrow_and_update().clone();
                tracing::debug!(state = ?current, "Socket state changed");
                // The socket only reports Connected after leaving it, so
                // Connected following Connected means the drop was coalesced.
                if current.is_connected() && last.is_connected() {
                    router.route_state(&ConnectionState::Disconnected).await;
                }
                router.route_state(&current).await;
                last = current;
            }
        }
    }
}

/// Everything a signed-in session needs.
pub struct MarketplaceClient {
    config: ClientConfig,
    bus: EventBus,
    positions: PositionFeed,
    maps: MapsService,
    publisher: LocationPublisher,
    chat: ChatSession,
    counter: UnreadCounter,
    notifications: NotificationCenter,
    router: Router,
    socket: Option<SocketConnection>,
    pump: Option<JoinHandle<()>>,
}

impl MarketplaceClient {
    /// Build a client talking to the configured backend and open the socket.
    pub fn connect(config: ClientConfig) -> anyhow::Result<Self> {
        let storage = match &config.data_dir {
            Some(dir) => Storage::at(dir),
            None => Storage::platform_default().context("no platform data directory")?,
        };
        let api = ApiClient::with_timeout(config.request_timeout)
            .with_base_url(config.api_url.clone())
            .with_token(config.token.clone());

        let socket_url = url::Url::parse(&config.socket_url)
            .with_context(|| format!("invalid socket url {}", config.socket_url))?;
        let token = config.token.clone();
        let socket = SocketConnection::connect(
            move || {
                let token = token.as_deref()?;
                let mut url = socket_url.clone();
                url.query_pairs_mut().append_pair("token", token);
                Some(url.to_string())
            },
            ReconnectConfig::default(),
        );

        Ok(Self::from_parts(
            config,
            Arc::new(api),
            storage,
            PositionFeed::new(),
            Some(socket),
        ))
    }

    /// Wire a client from prebuilt parts. Without a socket the pump is not started.
    pub fn from_parts(
        config: ClientConfig,
        api: Arc<dyn MarketplaceApi>,
        storage: Storage,
        positions: PositionFeed,
        socket: Option<SocketConnection>,
    ) -> Self {
        let bus = EventBus::new();
        let handle = socket.as_ref().map(SocketConnection::handle);

        let maps = MapsService::new(api.clone(), config.request_timeout);
        let publisher = LocationPublisher::new(
            config.role,
            PublisherConfig::from(&config),
            api.clone(),
            Arc::new(positions.clone()),
            LocationCache::new(storage.clone()),
            bus.clone(),
        )
        .with_geocoder(Arc::new(maps.clone()));

        let mut chat = ChatSession::new(config.user_id.clone(), api.clone(), bus.clone())
            .with_request_timeout(config.request_timeout);
        if let Some(handle) = &handle {
            chat = chat.with_socket(handle.clone());
        }

        let counter = UnreadCounter::new(api.clone(), storage);
        counter.start(&bus, config.unread_poll);
        let notifications = NotificationCenter::new(api, counter.clone(), bus.clone());

        let router = Router {
            user_id: config.user_id.clone(),
            chat: chat.clone(),
            publisher: publisher.clone(),
            bus: bus.clone(),
        };
        let pump = handle.map(|h: SocketHandle| {
            tokio::spawn(run_pump(router.clone(), h.subscribe(), h.watch_state()))
        });

        tracing::info!(user_id = %config.user_id, role = ?config.role, "Client ready");
        Self {
            config,
            bus,
            positions,
            maps,
            publisher,
            chat,
            counter,
            notifications,
            router,
            socket,
            pump,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Feed the host platform pushes position readings into.
    pub fn positions(&self) -> &PositionFeed {
        &self.positions
    }

    pub fn maps(&self) -> &MapsService {
        &self.maps
    }

    pub fn publisher(&self) -> &LocationPublisher {
        &self.publisher
    }

    pub fn chat(&self) -> &ChatSession {
        &self.chat
    }

    pub fn unread(&self) -> &UnreadCounter {
        &self.counter
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }

    pub fn socket(&self) -> Option<SocketHandle> {
        self.socket.as_ref().map(SocketConnection::handle)
    }

    /// Route one server event as if it came from the socket.
    pub async fn dispatch(&self, event: ServerEvent) {
        self.router.route_event(event).await;
    }

    /// React to a connection state change as if the socket reported it.
    pub async fn connection_changed(&self, state: ConnectionState) {
        self.router.route_state(&state).await;
    }

    /// Stop every background task. Later completions leave state untouched.
    pub async fn shutdown(mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        self.publisher.shutdown().await;
        self.chat.shutdown();
        self.counter.shutdown();
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        tracing::info!("Client shut down");
    }
}

impl Drop for MarketplaceClient {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.counter.stop();
    }
}
