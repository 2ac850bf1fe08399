//! Device positioning.
//!
//! [`PositionSource`] is what the publisher needs from the platform: an
//! availability check, a one-shot reading and a continuous watch.
//! [`PositionFeed`] is the implementation the host shell (mobile wrapper, GPS
//! daemon bridge, ...) pushes readings into.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use barberline_shared::{Coordinates, LocationSample, SyncError};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

const WATCH_CAPACITY: usize = 16;

/// One reading from the positioning hardware.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionFix {
    pub coordinates: Coordinates,
    /// Radius of uncertainty in meters, when known.
    pub accuracy_m: Option<f64>,
    /// Some platforms resolve an address alongside the fix.
    pub address: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl PositionFix {
    pub fn new(coordinates: Coordinates) -> Self {
        Self {
            coordinates,
            accuracy_m: None,
            address: None,
            captured_at: Utc::now(),
        }
    }

    pub fn into_sample(self) -> LocationSample {
        LocationSample {
            coordinates: self.coordinates,
            address: self.address,
            captured_at: self.captured_at,
        }
    }

    fn is_fresh(&self, max_age: Duration) -> bool {
        let age = (Utc::now() - self.captured_at).to_std().unwrap_or_default();
        age <= max_age
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionOptions {
    /// Give up after this long.
    pub timeout: Duration,
    /// A cached reading at most this old may be returned instead of a new one.
    pub max_age: Duration,
    pub high_accuracy: bool,
}

/// Stream of readings. Dropping it clears the watch.
pub struct PositionWatch {
    rx: mpsc::Receiver<Result<PositionFix, SyncError>>,
}

impl PositionWatch {
    pub fn new(rx: mpsc::Receiver<Result<PositionFix, SyncError>>) -> Self {
        Self { rx }
    }

    /// Next reading or error; `None` once the source shuts the watch down.
    pub async fn next(&mut self) -> Option<Result<PositionFix, SyncError>> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Whether positioning exists on this device at all.
    fn is_available(&self) -> bool;

    async fn current_position(&self, options: PositionOptions) -> Result<PositionFix, SyncError>;

    fn watch_position(&self, options: PositionOptions) -> Result<PositionWatch, SyncError>;
}

type Reading = Option<Result<PositionFix, SyncError>>;
type WatchSender = mpsc::Sender<Result<PositionFix, SyncError>>;

struct FeedInner {
    available: AtomicBool,
    permission_denied: AtomicBool,
    latest: watch::Sender<Reading>,
    watchers: Mutex<Vec<WatchSender>>,
}

/// Position source fed by the host platform.
#[derive(Clone)]
pub struct PositionFeed {
    inner: Arc<FeedInner>,
}

impl PositionFeed {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            inner: Arc::new(FeedInner {
                available: AtomicBool::new(true),
                permission_denied: AtomicBool::new(false),
                latest,
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Mark positioning hardware as present or absent.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Record the user's answer to the location permission prompt.
    pub fn set_permission(&self, granted: bool) {
        self.inner.permission_denied.store(!granted, Ordering::SeqCst);
    }

    /// Deliver a new reading to pending one-shot requests and every watch.
    pub fn push(&self, fix: PositionFix) {
        self.deliver(Ok(fix));
    }

    /// Deliver a positioning error (e.g. signal lost) to pending requests and watches.
    pub fn fail(&self, err: SyncError) {
        self.deliver(Err(err));
    }

    /// Watches whose consumer is still alive.
    pub fn active_watches(&self) -> usize {
        let mut watchers = self.lock_watchers();
        watchers.retain(|tx| !tx.is_closed());
        watchers.len()
    }

    fn deliver(&self, reading: Result<PositionFix, SyncError>) {
        self.inner.latest.send_replace(Some(reading.clone()));

        let mut watchers = self.lock_watchers();
        watchers.retain(|tx| !tx.is_closed());
        for tx in watchers.iter() {
            if tx.try_send(reading.clone()).is_err() {
                tracing::debug!("Position watch lagging, dropping reading");
            }
        }
    }

    fn lock_watchers(&self) -> std::sync::MutexGuard<'_, Vec<WatchSender>> {
        self.inner.watchers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_access(&self) -> Result<(), SyncError> {
        if !self.is_available() {
            return Err(SyncError::CapabilityUnavailable(
                "positioning is not supported on this device".into(),
            ));
        }
        if self.inner.permission_denied.load(Ordering::SeqCst) {
            return Err(SyncError::PermissionDenied);
        }
        Ok(())
    }
}

impl Default for PositionFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PositionSource for PositionFeed {
    fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    async fn current_position(&self, options: PositionOptions) -> Result<PositionFix, SyncError> {
        self.check_access()?;

        let mut rx = self.inner.latest.subscribe();
        let cached = rx.borrow_and_update().clone();
        if let Some(Ok(fix)) = cached {
            if fix.is_fresh(options.max_age) {
                return Ok(fix);
            }
        }

        let wait = async {
            loop {
                if rx.changed().await.is_err() {
                    return Err(SyncError::CapabilityUnavailable("position feed closed".into()));
                }
                let reading = rx.borrow_and_update().clone();
                if let Some(reading) = reading {
                    return reading;
                }
            }
        };

        tokio::time::timeout(options.timeout, wait)
            .await
            .unwrap_or(Err(SyncError::Timeout))
    }

    fn watch_position(&self, _options: PositionOptions) -> Result<PositionWatch, SyncError> {
        self.check_access()?;
        let (tx, rx) = mpsc::channel(WATCH_CAPACITY);
        self.lock_watchers().push(tx);
        Ok(PositionWatch::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> PositionOptions {
        PositionOptions {
            timeout: Duration::from_secs(10),
            max_age: Duration::from_secs(30),
            high_accuracy: true,
        }
    }

    #[tokio::test]
    async fn test_fresh_reading_is_reused() {
        let feed = PositionFeed::new();
        let fix = PositionFix::new(Coordinates::new(-73.99, 40.73));
        feed.push(fix.clone());

        let got = feed.current_position(options()).await.unwrap();
        assert_eq!(got, fix);
    }

    #[tokio::test]
    async fn test_stale_reading_waits_for_new_one() {
        let feed = PositionFeed::new();
        let mut stale = PositionFix::new(Coordinates::new(1.0, 1.0));
        stale.captured_at = Utc::now() - chrono::Duration::seconds(120);
        feed.push(stale);

        let pusher = feed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            pusher.push(PositionFix::new(Coordinates::new(2.0, 2.0)));
        });

        let got = feed.current_position(options()).await.unwrap();
        assert_eq!(got.coordinates, Coordinates::new(2.0, 2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reading_times_out() {
        let feed = PositionFeed::new();
        let err = feed.current_position(options()).await.unwrap_err();
        assert_eq!(err, SyncError::Timeout);
    }

    #[tokio::test]
    async fn test_denied_and_unavailable() {
        let feed = PositionFeed::new();
        feed.set_permission(false);
        assert_eq!(
            feed.current_position(options()).await.unwrap_err(),
            SyncError::PermissionDenied
        );

        feed.set_available(false);
        assert!(matches!(
            feed.watch_position(options()),
            Err(SyncError::CapabilityUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_receives_readings_and_releases_on_drop() {
        let feed = PositionFeed::new();
        let mut watch = feed.watch_position(options()).unwrap();
        assert_eq!(feed.active_watches(), 1);

        feed.push(PositionFix::new(Coordinates::new(3.0, 4.0)));
        let got = watch.next().await.unwrap().unwrap();
        assert_eq!(got.coordinates, Coordinates::new(3.0, 4.0));

        drop(watch);
        assert_eq!(feed.active_watches(), 0);
    }
}
