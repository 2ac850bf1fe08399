//! Notification list with read/delete actions.
//!
//! Mutations go to the backend first; the local list only changes after the
//! backend accepts them. The unread baseline is lowered by the number of
//! loaded unread items an action clears; items on unloaded pages are left to
//! the next poll.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use barberline_shared::{ApiError, Notification, Pagination, SyncError};

use super::counter::UnreadCounter;
use crate::api_client::MarketplaceApi;
use crate::bus::{EventBus, Notice};
use crate::config::DEFAULT_REQUEST_TIMEOUT;

#[derive(Default)]
struct CenterState {
    items: Vec<Notification>,
    pagination: Pagination,
}

#[derive(Clone)]
pub struct NotificationCenter {
    api: Arc<dyn MarketplaceApi>,
    counter: UnreadCounter,
    bus: EventBus,
    request_timeout: Duration,
    state: Arc<Mutex<CenterState>>,
}

impl NotificationCenter {
    pub fn new(api: Arc<dyn MarketplaceApi>, counter: UnreadCounter, bus: EventBus) -> Self {
        Self {
            api,
            counter,
            bus,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            state: Arc::new(Mutex::new(CenterState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CenterState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn items(&self) -> Vec<Notification> {
        self.lock().items.clone()
    }

    pub fn unread(&self) -> u32 {
        count_unread(&self.lock().items)
    }

    pub fn has_more(&self) -> bool {
        self.lock().pagination.has_more
    }

    /// Fetch `page` (1 replaces the list, later pages append).
    pub async fn load(&self, page: u32) -> Result<usize, SyncError> {
        let page = page.max(1);
        let result = self.call(self.api.get_notifications(Some(page))).await?;
        let mut st = self.lock();
        if page == 1 {
            st.items = result.notifications;
        } else {
            for n in result.notifications {
                if !st.items.iter().any(|i| i.id == n.id) {
                    st.items.push(n);
                }
            }
        }
        st.pagination = result.pagination;
        Ok(st.items.len())
    }

    pub async fn mark_as_read(&self, id: &str) -> Result<(), SyncError> {
        self.call(self.api.mark_as_read(id)).await?;
        self.mirror(|items| {
            if let Some(n) = items.iter_mut().find(|n| n.id == id) {
                n.is_read = true;
            }
        });
        Ok(())
    }

    pub async fn mark_all_as_read(&self) -> Result<(), SyncError> {
        self.call(self.api.mark_all_as_read()).await?;
        self.lock().items.iter_mut().for_each(|n| n.is_read = true);
        self.counter.set_baseline(0);
        Ok(())
    }

    pub async fn delete_notification(&self, id: &str) -> Result<(), SyncError> {
        self.call(self.api.delete_notification(id)).await?;
        self.mirror(|items| items.retain(|n| n.id != id));
        Ok(())
    }

    /// Apply `f` to the list and lower the baseline by the unread items it cleared.
    fn mirror(&self, f: impl FnOnce(&mut Vec<Notification>)) {
        let cleared = {
            let mut st = self.lock();
            let before = count_unread(&st.items);
            f(&mut st.items);
            before.saturating_sub(count_unread(&st.items))
        };
        if cleared > 0 {
            self.counter.lower_baseline(cleared);
        }
    }

    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, ApiError>>,
    ) -> Result<T, SyncError> {
        let result = tokio::time::timeout(self.request_timeout, fut)
            .await
            .unwrap_or(Err(ApiError::Timeout))
            .map_err(SyncError::from);
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Notification request failed");
            self.bus.notify(Notice::error(e));
        }
        result
    }
}

fn count_unread(items: &[Notification]) -> u32 {
    items.iter().filter(|n| !n.is_read).count() as u32
}
