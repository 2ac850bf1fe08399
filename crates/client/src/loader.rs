//! Single-flight lazy initialization.
//!
//! A [`SingleFlight`] owns one expensive resource that is loaded on first use.
//! All callers that arrive while a load is running subscribe to that same
//! attempt instead of starting their own. A failed load stays failed until
//! [`SingleFlight::retry`] is called.

use std::future::Future;
use std::sync::{Arc, Mutex};

use barberline_shared::SyncError;
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;

/// Observable lifecycle of the resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
    Failed(String),
}

enum Slot<T> {
    Unloaded,
    Loading,
    Loaded(Arc<T>),
    Failed(SyncError),
}

type Waiter<T> = oneshot::Sender<Result<Arc<T>, SyncError>>;
type LoadFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, SyncError>> + Send + Sync>;

struct Inner<T> {
    slot: Slot<T>,
    waiters: Vec<Waiter<T>>,
    attempts: u32,
}

pub struct SingleFlight<T> {
    inner: Arc<Mutex<Inner<T>>>,
    load: LoadFn<T>,
}

impl<T> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            load: self.load.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> SingleFlight<T> {
    pub fn new<F, Fut>(load: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                slot: Slot::Unloaded,
                waiters: Vec::new(),
                attempts: 0,
            })),
            load: Arc::new(move || Box::pin(load())),
        }
    }

    pub fn state(&self) -> LoadState {
        match &self.lock().slot {
            Slot::Unloaded => LoadState::Unloaded,
            Slot::Loading => LoadState::Loading,
            Slot::Loaded(_) => LoadState::Loaded,
            Slot::Failed(e) => LoadState::Failed(e.to_string()),
        }
    }

    /// Number of load attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    /// Return the resource, loading it if nobody has yet.
    pub async fn ensure_loaded(&self) -> Result<Arc<T>, SyncError> {
        let rx = {
            let mut inner = self.lock();
            match &inner.slot {
                Slot::Loaded(value) => return Ok(value.clone()),
                Slot::Failed(e) => return Err(e.clone()),
                Slot::Loading | Slot::Unloaded => {}
            }
            let idle = matches!(inner.slot, Slot::Unloaded);
            let rx = Self::subscribe(&mut inner);
            if idle {
                self.start(&mut inner);
            }
            rx
        };

        rx.await
            .unwrap_or_else(|_| Err(SyncError::CapabilityUnavailable("loader dropped".into())))
    }

    /// Reset a failed load and try again. A loaded or loading resource is
    /// returned as-is.
    pub async fn retry(&self) -> Result<Arc<T>, SyncError> {
        {
            let mut inner = self.lock();
            if matches!(inner.slot, Slot::Failed(_)) {
                tracing::debug!("Retrying failed load");
                inner.slot = Slot::Unloaded;
            }
        }
        self.ensure_loaded().await
    }

    fn subscribe(inner: &mut Inner<T>) -> oneshot::Receiver<Result<Arc<T>, SyncError>> {
        let (tx, rx) = oneshot::channel();
        inner.waiters.push(tx);
        rx
    }

    // Runs detached so the attempt completes even if the first caller is cancelled.
    fn start(&self, inner: &mut Inner<T>) {
        inner.slot = Slot::Loading;
        inner.attempts += 1;

        let fut = (self.load)();
        let shared = self.inner.clone();
        tokio::spawn(async move {
            let result = fut.await.map(Arc::new);
            let waiters = {
                let mut inner = shared.lock().unwrap_or_else(|p| p.into_inner());
                inner.slot = match &result {
                    Ok(value) => Slot::Loaded(value.clone()),
                    Err(e) => {
                        tracing::warn!(error = %e, "Load failed");
                        Slot::Failed(e.clone())
                    }
                };
                std::mem::take(&mut inner.waiters)
            };
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flight = SingleFlight::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, SyncError>("maps-ready".to_string())
            }
        });

        let (a, b, c) = tokio::join!(
            flight.ensure_loaded(),
            flight.ensure_loaded(),
            flight.ensure_loaded()
        );

        assert_eq!(*a.unwrap(), "maps-ready");
        assert_eq!(*b.unwrap(), "maps-ready");
        assert_eq!(*c.unwrap(), "maps-ready");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flight.state(), LoadState::Loaded);

        flight.ensure_loaded().await.unwrap();
        assert_eq!(flight.attempts(), 1);
    }

    #[tokio::test]
    async fn test_failure_sticks_until_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flight = SingleFlight::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(SyncError::Offline)
                } else {
                    Ok(42u32)
                }
            }
        });

        assert_eq!(flight.ensure_loaded().await.unwrap_err(), SyncError::Offline);
        assert!(matches!(flight.state(), LoadState::Failed(_)));

        // No implicit retry.
        assert_eq!(flight.ensure_loaded().await.unwrap_err(), SyncError::Offline);
        assert_eq!(flight.attempts(), 1);

        assert_eq!(*flight.retry().await.unwrap(), 42);
        assert_eq!(flight.state(), LoadState::Loaded);
        assert_eq!(flight.attempts(), 2);
    }

    #[tokio::test]
    async fn test_unloaded_until_first_use() {
        let flight = SingleFlight::new(|| async { Ok::<_, SyncError>(()) });
        assert_eq!(flight.state(), LoadState::Unloaded);
        assert_eq!(flight.attempts(), 0);
    }
}
