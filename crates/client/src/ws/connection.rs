//! Socket connection with state tracking and auto-reconnect.

use std::sync::Arc;
use std::time::Duration;

use barberline_shared::{ClientCommand, ServerEvent};
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const EVENT_CAPACITY: usize = 512;

/// Connection state for the socket
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }
}

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u32,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u32,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 1.5,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f32 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis((delay as u32).min(self.max_delay_ms) as u64)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Cloneable handle for emitting commands and observing the connection.
#[derive(Clone)]
pub struct SocketHandle {
    sender: UnboundedSender<ClientCommand>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ServerEvent>,
}

impl SocketHandle {
    /// Queue a command. Commands queued while disconnected go out after the next connect.
    pub fn send(&self, cmd: ClientCommand) -> Result<(), String> {
        tracing::debug!(?cmd, "Queueing socket command");
        self.sender
            .unbounded_send(cmd)
            .map_err(|e| format!("Failed to send: {}", e))
    }

    pub fn join_chat(&self, chat_id: &str) -> Result<(), String> {
        self.send(ClientCommand::JoinChat {
            chat_id: chat_id.to_string(),
        })
    }

    pub fn leave_chat(&self, chat_id: &str) -> Result<(), String> {
        self.send(ClientCommand::LeaveChat {
            chat_id: chat_id.to_string(),
        })
    }

    pub fn typing(&self, chat_id: &str, is_typing: bool) -> Result<(), String> {
        self.send(ClientCommand::Typing {
            chat_id: chat_id.to_string(),
            is_typing,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// Receiver that yields every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Receiver for every inbound event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

/// A managed socket connection. Dropping it stops the connection loop.
pub struct SocketConnection {
    handle: SocketHandle,
    task: JoinHandle<()>,
}

impl SocketConnection {
    /// Start connecting in a background task.
    ///
    /// `url_builder` is called before every attempt; returning `None` (e.g. no
    /// session yet) leaves the connection disconnected and retries shortly.
    pub fn connect(
        url_builder: impl Fn() -> Option<String> + Send + Sync + 'static,
        reconnect_config: ReconnectConfig,
    ) -> Self {
        let (sender, receiver) = unbounded();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let task = tokio::spawn(connection_loop(
            Arc::new(url_builder),
            receiver,
            state_tx,
            events.clone(),
            reconnect_config,
        ));

        Self {
            handle: SocketHandle {
                sender,
                state: state_rx,
                events,
            },
            task,
        }
    }

    pub fn handle(&self) -> SocketHandle {
        self.handle.clone()
    }

    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for SocketConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn connection_loop(
    url_builder: Arc<dyn Fn() -> Option<String> + Send + Sync>,
    mut commands: UnboundedReceiver<ClientCommand>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ServerEvent>,
    reconnect_config: ReconnectConfig,
) {
    let mut attempt = 0u32;

    loop {
        let Some(url) = url_builder() else {
            state.send_replace(ConnectionState::Disconnected);
            tokio::time::sleep(Duration::from_millis(1000)).await;
            continue;
        };

        if attempt == 0 {
            state.send_replace(ConnectionState::Connecting);
        } else {
            state.send_replace(ConnectionState::Reconnecting { attempt });
        }

        match connect_async(url.as_str()).await {
            Ok((ws_stream, _response)) => {
                state.send_replace(ConnectionState::Connected);
                attempt = 0;
                tracing::info!("Socket connected");

                let (mut write, mut read) = ws_stream.split();

                loop {
                    tokio::select! {
                        inbound = read.next() => match inbound {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ServerEvent>(text.as_str()) {
                                    Ok(event) => {
                                        let _ = events.send(event);
                                    }
                                    Err(e) => {
                                        tracing::warn!(error = %e, "Ignoring unparsable socket frame")
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::info!("Socket received close");
                                break;
                            }
                            Some(Ok(_)) => {
                                // Ping/pong are handled by tungstenite; binary is unused.
                            }
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "Socket read error");
                                break;
                            }
                        },
                        outbound = commands.next() => match outbound {
                            Some(cmd) => match serde_json::to_string(&cmd) {
                                Ok(json) => {
                                    if let Err(e) = write.send(Message::Text(json.into())).await {
                                        tracing::warn!(error = %e, "Socket send failed");
                                        break;
                                    }
                                }
                                Err(e) => tracing::error!(error = %e, "Serialize failed"),
                            },
                            None => {
                                tracing::debug!("All socket handles dropped, stopping");
                                state.send_replace(ConnectionState::Disconnected);
                                return;
                            }
                        },
                    }
                }

                state.send_replace(ConnectionState::Disconnected);
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "Socket connect failed");

                if reconnect_config.exhausted(attempt) {
                    state.send_replace(ConnectionState::Failed {
                        reason: format!(
                            "Max reconnect attempts ({}) exceeded",
                            reconnect_config.max_attempts
                        ),
                    });
                    return;
                }

                let delay = reconnect_config.delay_for_attempt(attempt);
                tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnecting");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
