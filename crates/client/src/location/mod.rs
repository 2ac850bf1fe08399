//! Provider location: device positioning, the on-disk cache and the publisher
//! that keeps the backend position fresh while a provider is online.

mod cache;
mod positioning;
mod publisher;

pub use cache::{CachedLocation, LocationCache};
pub use positioning::{PositionFeed, PositionFix, PositionOptions, PositionSource, PositionWatch};
pub use publisher::{LocationPublisher, PublisherConfig, TrackingSnapshot};
