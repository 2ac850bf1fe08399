//! Real-time channel to the backend.
//!
//! ```text
//!   SocketConnection ──(broadcast)──▶ subscribers (chat, counter, client pump)
//!         ▲    │
//!         │    └──(watch)──▶ ConnectionState (connected / disconnected ...)
//!         │
//!   SocketHandle::send (join_chat, typing, ...)
//! ```

mod connection;

pub use connection::{ConnectionState, ReconnectConfig, SocketConnection, SocketHandle};
