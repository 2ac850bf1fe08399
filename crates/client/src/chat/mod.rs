//! Chat state: per-chat history, optimistic sends and real-time updates.

mod session;
mod store;

pub use session::{ChatSession, PendingSend};
pub use store::{ChatHistory, MessageStore, ProviderPosition, VisibleMessage};
