//! Unread notification count.
//!
//! Two sources feed the count: a baseline fetched from the backend and an
//! override delivered on the [`EventBus`] (mirrored to storage so it survives a
//! restart). The displayed value is the override when it is positive, else the
//! baseline. An override of zero therefore lets the baseline show through.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use barberline_shared::SyncError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::api_client::MarketplaceApi;
use crate::bus::{AppEvent, EventBus};
use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::storage::{Storage, UNREAD_COUNT_KEY};

#[derive(Debug, Default)]
struct CounterState {
    baseline: u32,
    override_count: Option<u32>,
    last_error: Option<String>,
    closed: bool,
}

impl CounterState {
    fn displayed(&self) -> u32 {
        match self.override_count {
            Some(count) if count > 0 => count,
            _ => self.baseline,
        }
    }
}

struct Shared {
    api: Arc<dyn MarketplaceApi>,
    storage: Storage,
    request_timeout: Duration,
    state: Mutex<CounterState>,
    displayed: watch::Sender<u32>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CounterState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Apply `f` and republish the displayed value if it moved.
    fn update(&self, f: impl FnOnce(&mut CounterState)) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        f(&mut st);
        let shown = st.displayed();
        drop(st);
        self.displayed.send_if_modified(|current| {
            let changed = *current != shown;
            *current = shown;
            changed
        });
    }

    fn set_override(&self, count: u32) {
        if self.lock().closed {
            return;
        }
        if !self.storage.save(UNREAD_COUNT_KEY, &count) {
            tracing::warn!("Could not persist unread count");
        }
        self.update(|st| st.override_count = Some(count));
    }

    async fn refresh(&self) -> Result<u32, SyncError> {
        let result = tokio::time::timeout(self.request_timeout, self.api.get_unread_count())
            .await
            .unwrap_or(Err(barberline_shared::ApiError::Timeout))
            .map_err(SyncError::from);
        match result {
            Ok(count) => {
                self.update(|st| {
                    st.baseline = count;
                    st.last_error = None;
                });
                Ok(count)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Unread count refresh failed");
                self.update(|st| st.last_error = Some(e.to_string()));
                Err(e)
            }
        }
    }
}

/// Background task slot; aborts the task when the last counter clone goes away.
#[derive(Default)]
struct TaskSlot(Mutex<Option<JoinHandle<()>>>);

impl Drop for TaskSlot {
    fn drop(&mut self) {
        let slot = self.0.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(task) = slot.take() {
            task.abort();
        }
    }
}

#[derive(Clone)]
pub struct UnreadCounter {
    shared: Arc<Shared>,
    task: Arc<TaskSlot>,
}

impl UnreadCounter {
    /// Create a counter, restoring the last override from `storage`.
    pub fn new(api: Arc<dyn MarketplaceApi>, storage: Storage) -> Self {
        let override_count: Option<u32> = storage.load(UNREAD_COUNT_KEY);
        let state = CounterState {
            override_count,
            ..Default::default()
        };
        let (displayed, _) = watch::channel(state.displayed());
        Self {
            shared: Arc::new(Shared {
                api,
                storage,
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
                state: Mutex::new(state),
                displayed,
            }),
            task: Arc::new(TaskSlot::default()),
        }
    }

    pub fn displayed(&self) -> u32 {
        self.shared.lock().displayed()
    }

    pub fn baseline(&self) -> u32 {
        self.shared.lock().baseline
    }

    pub fn override_count(&self) -> Option<u32> {
        self.shared.lock().override_count
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    /// Displayed value, updated whenever it changes.
    pub fn watch(&self) -> watch::Receiver<u32> {
        self.shared.displayed.subscribe()
    }

    /// Fetch the baseline once.
    pub async fn refresh(&self) -> Result<u32, SyncError> {
        self.shared.refresh().await
    }

    pub fn set_baseline(&self, count: u32) {
        self.shared.update(|st| st.baseline = count);
    }

    /// Take `by` off the baseline after notifications were read or removed.
    pub fn lower_baseline(&self, by: u32) {
        self.shared.update(|st| st.baseline = st.baseline.saturating_sub(by));
    }

    /// Record an out-of-band count. Usually arrives through the bus.
    pub fn set_override(&self, count: u32) {
        self.shared.set_override(count);
    }

    /// Follow override events on `bus` and re-fetch the baseline every `poll`.
    /// Replaces a previous background task.
    pub fn start(&self, bus: &EventBus, poll: Duration) {
        let events = bus.subscribe();
        let handle = tokio::spawn(run(Arc::downgrade(&self.shared), events, poll));
        if let Some(old) = self.lock_task().replace(handle) {
            old.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.lock_task().take() {
            task.abort();
        }
    }

    /// Stop background work and ignore late completions.
    pub fn shutdown(&self) {
        self.stop();
        self.shared.lock().closed = true;
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}

async fn run(shared: Weak<Shared>, mut events: broadcast::Receiver<AppEvent>, poll: Duration) {
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else { return };
                let _ = shared.refresh().await;
            }
            event = events.recv() => match event {
                Ok(AppEvent::UnreadCountChanged(count)) => {
                    let Some(shared) = shared.upgrade() else { return };
                    tracing::debug!(count, "Unread count override");
                    shared.set_override(count);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Unread counter lagged behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Call, MockApi};

    fn counter() -> (UnreadCounter, Arc<MockApi>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::new());
        let counter = UnreadCounter::new(api.clone(), Storage::at(dir.path()));
        (counter, api, dir)
    }

    #[tokio::test]
    async fn test_zero_override_shows_baseline() {
        let (counter, api, _dir) = counter();
        api.set_unread(3);

        counter.set_override(0);
        counter.refresh().await.unwrap();

        assert_eq!(counter.override_count(), Some(0));
        assert_eq!(counter.displayed(), 3);
    }

    #[tokio::test]
    async fn test_positive_override_wins() {
        let (counter, api, _dir) = counter();
        api.set_unread(3);
        counter.refresh().await.unwrap();

        counter.set_override(7);
        assert_eq!(counter.displayed(), 7);
        assert_eq!(*counter.watch().borrow(), 7);
    }

    #[tokio::test]
    async fn test_override_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::new());

        UnreadCounter::new(api.clone(), Storage::at(dir.path())).set_override(4);
        let restored = UnreadCounter::new(api, Storage::at(dir.path()));

        assert_eq!(restored.override_count(), Some(4));
        assert_eq!(restored.displayed(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_polls_and_follows_bus() {
        let (counter, api, _dir) = counter();
        let bus = EventBus::new();
        api.set_unread(2);

        counter.start(&bus, Duration::from_secs(30));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.baseline(), 2);

        bus.publish(AppEvent::UnreadCountChanged(9));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.displayed(), 9);

        api.set_unread(5);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(counter.baseline(), 5);

        counter.stop();
        api.set_unread(1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.baseline(), 5);
        let polls = api.calls().iter().filter(|c| **c == Call::UnreadCount).count();
        assert_eq!(polls, 2);
    }

    #[tokio::test]
    async fn test_lower_baseline_saturates() {
        let (counter, api, _dir) = counter();
        api.set_unread(2);
        counter.refresh().await.unwrap();

        counter.lower_baseline(1);
        assert_eq!(counter.displayed(), 1);
        counter.lower_baseline(5);
        assert_eq!(counter.baseline(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_ignores_updates() {
        let (counter, api, _dir) = counter();
        api.set_unread(6);
        counter.shutdown();

        let _ = counter.refresh().await;
        assert_eq!(counter.displayed(), 0);
    }
}
