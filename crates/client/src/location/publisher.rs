//! Live location publishing for service providers.
//!
//! While a provider is online the publisher keeps their backend position
//! fresh: one reading when tracking starts, then a continuous watch plus a
//! periodic fallback timer. Watch and timer updates go through a throttle
//! (`update_interval`, default 60s); the initial reading, manual refreshes and
//! reconnect republishes bypass it.
//!
//! Every publish attempt, successful or not, overwrites the cached location so
//! the last known position survives restarts. Attempts that fail because the
//! backend is unreachable are kept as pending and delivered on reconnect.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use barberline_shared::{LocationSample, Role, SyncError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::cache::LocationCache;
use super::positioning::{PositionFix, PositionOptions, PositionSource, PositionWatch};
use crate::api_client::MarketplaceApi;
use crate::bus::{AppEvent, EventBus};
use crate::config::{
    ClientConfig, CACHE_FRESHNESS, DEFAULT_LOCATION_INTERVAL, DEFAULT_POSITION_TIMEOUT,
    DEFAULT_REQUEST_TIMEOUT, POSITION_MAX_AGE,
};
use crate::geocode::ReverseGeocoder;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Throttle window for watch and timer publishes.
    pub update_interval: Duration,
    /// Period of the fallback timer that re-reads the position.
    pub fallback_interval: Duration,
    pub position_timeout: Duration,
    pub request_timeout: Duration,
    /// Oldest cached sample that may be restored or republished.
    pub cache_freshness: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            update_interval: DEFAULT_LOCATION_INTERVAL,
            fallback_interval: DEFAULT_LOCATION_INTERVAL,
            position_timeout: DEFAULT_POSITION_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            cache_freshness: CACHE_FRESHNESS,
        }
    }
}

impl From<&ClientConfig> for PublisherConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            update_interval: config.location_interval,
            fallback_interval: config.location_interval,
            position_timeout: config.position_timeout,
            request_timeout: config.request_timeout,
            cache_freshness: CACHE_FRESHNESS,
        }
    }
}

/// Point-in-time view of the publisher, for rendering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackingSnapshot {
    pub is_tracking: bool,
    pub has_watch: bool,
    pub has_timer: bool,
    pub last_sample: Option<LocationSample>,
    /// Whether the last publish attempt reached the backend.
    pub synced: bool,
    /// Sample waiting for connectivity.
    pub pending: Option<LocationSample>,
    /// Visible error string; cleared by the next successful start.
    pub error: Option<String>,
    /// Publish attempts made so far (throttled updates excluded).
    pub publish_attempts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublishMode {
    Throttled,
    Immediate,
}

/// Result of one publish request. Sent samples carry the address that went out.
#[derive(Debug, Clone, PartialEq)]
enum PublishOutcome {
    Published(LocationSample),
    Throttled,
    Failed(LocationSample, SyncError),
}

impl PublishOutcome {
    fn into_sample(self) -> Option<LocationSample> {
        match self {
            PublishOutcome::Published(sample) | PublishOutcome::Failed(sample, _) => Some(sample),
            PublishOutcome::Throttled => None,
        }
    }
}

/// One watch and one timer. Dropping the session aborts both.
struct TrackingSession {
    id: u64,
    watch_task: JoinHandle<()>,
    timer_task: JoinHandle<()>,
}

impl TrackingSession {
    /// Abort both tasks and wait until they are gone.
    async fn shutdown(mut self) {
        self.watch_task.abort();
        self.timer_task.abort();
        let _ = (&mut self.watch_task).await;
        let _ = (&mut self.timer_task).await;
        tracing::debug!(session = self.id, "Tracking session stopped");
    }
}

impl Drop for TrackingSession {
    fn drop(&mut self) {
        self.watch_task.abort();
        self.timer_task.abort();
    }
}

#[derive(Default)]
struct State {
    session: Option<TrackingSession>,
    next_session_id: u64,
    last_publish_at: Option<Instant>,
    last_sample: Option<LocationSample>,
    synced: bool,
    pending: Option<LocationSample>,
    error: Option<String>,
    network_online: bool,
    publish_attempts: u64,
    closed: bool,
}

struct Shared {
    role: Role,
    config: PublisherConfig,
    api: Arc<dyn MarketplaceApi>,
    source: Arc<dyn PositionSource>,
    cache: LocationCache,
    geocoder: Option<Arc<dyn ReverseGeocoder>>,
    bus: EventBus,
    state: Mutex<State>,
    /// Serializes start/stop so a transition settles before the next begins.
    transition: tokio::sync::Mutex<()>,
}

/// Cloneable handle; all clones drive the same tracking session.
#[derive(Clone)]
pub struct LocationPublisher {
    shared: Arc<Shared>,
}

impl LocationPublisher {
    pub fn new(
        role: Role,
        config: PublisherConfig,
        api: Arc<dyn MarketplaceApi>,
        source: Arc<dyn PositionSource>,
        cache: LocationCache,
        bus: EventBus,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                role,
                config,
                api,
                source,
                cache,
                geocoder: None,
                bus,
                state: Mutex::new(State {
                    network_online: true,
                    ..Default::default()
                }),
                transition: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Fill missing addresses through `geocoder` before publishing.
    /// Must be called before the publisher is cloned.
    pub fn with_geocoder(mut self, geocoder: Arc<dyn ReverseGeocoder>) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.geocoder = Some(geocoder),
            None => tracing::warn!("Publisher already shared, geocoder ignored"),
        }
        self
    }

    pub fn snapshot(&self) -> TrackingSnapshot {
        let st = self.shared.lock();
        TrackingSnapshot {
            is_tracking: st.session.is_some(),
            has_watch: st.session.as_ref().is_some_and(|s| !s.watch_task.is_finished()),
            has_timer: st.session.as_ref().is_some_and(|s| !s.timer_task.is_finished()),
            last_sample: st.last_sample.clone(),
            synced: st.synced,
            pending: st.pending.clone(),
            error: st.error.clone(),
            publish_attempts: st.publish_attempts,
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.shared.lock().session.is_some()
    }

    /// Start a tracking session, replacing any running one.
    ///
    /// Failures are also recorded in [`TrackingSnapshot::error`]; nothing is
    /// retried automatically.
    pub async fn start_tracking(&self) -> Result<(), SyncError> {
        let _transition = self.shared.transition.lock().await;
        self.start_locked().await
    }

    /// Stop the running session, if any. Idempotent.
    pub async fn stop_tracking(&self) {
        let _transition = self.shared.transition.lock().await;
        self.stop_locked().await;
    }

    /// Follow the subject's online flag: online starts tracking, offline stops it.
    /// A repeated online flag keeps the running session.
    pub async fn set_online(&self, online: bool) -> Result<(), SyncError> {
        let _transition = self.shared.transition.lock().await;
        if online {
            if self.shared.lock().session.is_some() {
                return Ok(());
            }
            self.start_locked().await
        } else {
            self.stop_locked().await;
            Ok(())
        }
    }

    /// One-shot manual reading, published immediately.
    ///
    /// A failed reading sets a transient error but leaves the tracking session alone.
    pub async fn refresh_location(&self) -> Result<LocationSample, SyncError> {
        let fix = match self.shared.acquire().await {
            Ok(fix) => fix,
            Err(e) => {
                tracing::warn!(error = %e, "Manual location refresh failed");
                self.shared.lock().error = Some(e.to_string());
                return Err(e);
            }
        };

        let sample = fix.into_sample();
        let outcome = self
            .shared
            .publish(sample.clone(), PublishMode::Immediate)
            .await;
        Ok(outcome.into_sample().unwrap_or(sample))
    }

    /// React to network connectivity. Coming back online republishes the last
    /// known reading once, ignoring the throttle.
    pub async fn set_connectivity(&self, online: bool) {
        let sample = {
            let mut st = self.shared.lock();
            let was_online = std::mem::replace(&mut st.network_online, online);
            if !online || was_online || st.closed || !self.shared.role.is_provider() {
                return;
            }
            st.pending.take().or_else(|| st.last_sample.clone())
        };

        let sample = sample.or_else(|| {
            self.shared
                .cache
                .load_fresh(self.shared.config.cache_freshness)
                .map(|c| c.sample)
        });

        if let Some(sample) = sample {
            tracing::info!("Back online, republishing last known location");
            self.shared.publish(sample, PublishMode::Immediate).await;
        }
    }

    /// Last reading from this session, else a cached one younger than the freshness bound.
    pub fn last_known_location(&self) -> Option<LocationSample> {
        if let Some(sample) = self.shared.lock().last_sample.clone() {
            return Some(sample);
        }
        self.shared
            .cache
            .load_fresh(self.shared.config.cache_freshness)
            .map(|c| c.sample)
    }

    /// Forget every known position, in memory and on disk.
    pub fn clear_cached_location(&self) {
        self.shared.cache.clear();
        let mut st = self.shared.lock();
        st.last_sample = None;
        st.pending = None;
        st.synced = false;
    }

    /// Stop tracking and ignore any remote call that completes afterwards.
    pub async fn shutdown(&self) {
        let _transition = self.shared.transition.lock().await;
        self.shared.lock().closed = true;
        self.stop_locked().await;
    }

    async fn start_locked(&self) -> Result<(), SyncError> {
        self.stop_locked().await;

        let shared = &self.shared;
        if shared.lock().closed {
            return Ok(());
        }

        if !shared.role.is_provider() {
            return Err(shared.record_failure(SyncError::CapabilityUnavailable(
                "only service providers share their location".into(),
            )));
        }
        if !shared.source.is_available() {
            return Err(shared.record_failure(SyncError::CapabilityUnavailable(
                "positioning is not supported on this device".into(),
            )));
        }

        let fix = shared.acquire().await.map_err(|e| shared.record_failure(e))?;
        let watch = shared
            .source
            .watch_position(shared.position_options())
            .map_err(|e| shared.record_failure(e))?;

        shared
            .publish(fix.into_sample(), PublishMode::Immediate)
            .await;

        let mut st = shared.lock();
        st.next_session_id += 1;
        let id = st.next_session_id;
        let weak = Arc::downgrade(shared);
        st.session = Some(TrackingSession {
            id,
            watch_task: tokio::spawn(watch_loop(weak.clone(), id, watch)),
            timer_task: tokio::spawn(timer_loop(weak, id, shared.config.fallback_interval)),
        });
        st.error = None;
        tracing::info!(session = id, "Location tracking started");
        Ok(())
    }

    async fn stop_locked(&self) {
        let session = self.shared.lock().session.take();
        if let Some(session) = session {
            session.shutdown().await;
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn position_options(&self) -> PositionOptions {
        PositionOptions {
            timeout: self.config.position_timeout,
            max_age: POSITION_MAX_AGE,
            high_accuracy: true,
        }
    }

    fn record_failure(&self, err: SyncError) -> SyncError {
        tracing::warn!(error = %err, "Location tracking unavailable");
        self.lock().error = Some(err.to_string());
        err
    }

    /// One reading, bounded by the position timeout even if the source misbehaves.
    async fn acquire(&self) -> Result<PositionFix, SyncError> {
        if !self.source.is_available() {
            return Err(SyncError::CapabilityUnavailable(
                "positioning is not supported on this device".into(),
            ));
        }
        let options = self.position_options();
        let fix = tokio::time::timeout(options.timeout, self.source.current_position(options))
            .await
            .unwrap_or(Err(SyncError::Timeout))?;
        if !fix.coordinates.is_valid() {
            return Err(SyncError::InvalidInput("device reported invalid coordinates".into()));
        }
        Ok(fix)
    }

    fn session_is(&self, id: u64) -> bool {
        let st = self.lock();
        !st.closed && st.session.as_ref().is_some_and(|s| s.id == id)
    }

    /// Publish `sample` unless throttled.
    async fn publish(&self, mut sample: LocationSample, mode: PublishMode) -> PublishOutcome {
        // Check-then-reserve under one lock so a concurrent watch/timer publish sees it.
        {
            let mut st = self.lock();
            st.last_sample = Some(sample.clone());
            if mode == PublishMode::Throttled {
                if let Some(last) = st.last_publish_at {
                    if last.elapsed() < self.config.update_interval {
                        return PublishOutcome::Throttled;
                    }
                }
            }
            st.last_publish_at = Some(Instant::now());
            st.publish_attempts += 1;
        }

        if sample.address.is_none() {
            sample.address = self.resolve_address(&sample).await;
        }

        let result = tokio::time::timeout(
            self.config.request_timeout,
            self.api
                .update_location(sample.coordinates, sample.address.clone()),
        )
        .await
        .unwrap_or(Err(barberline_shared::ApiError::Timeout))
        .map_err(SyncError::from);

        match result {
            Ok(_) => {
                self.cache.store(&sample, true);
                let mut st = self.lock();
                if !st.closed {
                    st.synced = true;
                    if st
                        .pending
                        .as_ref()
                        .is_some_and(|p| p.captured_at <= sample.captured_at)
                    {
                        st.pending = None;
                    }
                }
                drop(st);
                self.bus.publish(AppEvent::LocationPublished(sample.clone()));
                PublishOutcome::Published(sample)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Location publish failed");
                self.cache.store(&sample, false);
                let mut st = self.lock();
                if !st.closed {
                    st.synced = false;
                    if matches!(e, SyncError::Offline | SyncError::Timeout) {
                        st.pending = Some(sample.clone());
                        st.network_online = false;
                    }
                }
                PublishOutcome::Failed(sample, e)
            }
        }
    }

    async fn resolve_address(&self, sample: &LocationSample) -> Option<String> {
        let geocoder = self.geocoder.as_ref()?;
        match tokio::time::timeout(
            self.config.request_timeout,
            geocoder.reverse(sample.coordinates),
        )
        .await
        {
            Ok(Ok(address)) => address,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Reverse geocoding failed");
                None
            }
            Err(_) => None,
        }
    }
}

async fn watch_loop(shared: Weak<Shared>, id: u64, mut watch: PositionWatch) {
    while let Some(reading) = watch.next().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if !shared.session_is(id) {
            return;
        }
        match reading {
            Ok(fix) if fix.coordinates.is_valid() => {
                let outcome = shared
                    .publish(fix.into_sample(), PublishMode::Throttled)
                    .await;
                tracing::trace!(?outcome, "Watch update");
            }
            Ok(_) => tracing::debug!("Ignoring invalid watch reading"),
            Err(e) => {
                tracing::warn!(error = %e, "Position watch error");
                shared.lock().error = Some(e.to_string());
            }
        }
    }
    tracing::debug!(session = id, "Position watch ended");
}

async fn timer_loop(shared: Weak<Shared>, id: u64, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if !shared.session_is(id) {
            return;
        }

        let sample = match shared.acquire().await {
            Ok(fix) => Some(fix.into_sample()),
            Err(e) => {
                tracing::debug!(error = %e, "Fallback reading failed, reusing last sample");
                shared.lock().last_sample.clone()
            }
        };
        if let Some(sample) = sample {
            shared.publish(sample, PublishMode::Throttled).await;
        }
    }
}
