//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to the embedding binary.

use tracing_subscriber::{fmt, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "barberline_client=debug,warn";

/// Install a global fmt subscriber. `RUST_LOG` overrides `default_filter`.
///
/// Calling this twice is harmless: the second install is ignored.
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .try_init();
}
