//! Last known location, persisted across restarts.

use std::time::Duration;

use barberline_shared::LocationSample;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::storage::{Storage, LOCATION_KEY};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedLocation {
    #[serde(flatten)]
    pub sample: LocationSample,
    /// Whether the backend acknowledged this sample.
    pub synced: bool,
}

/// The publisher is the only writer of this entry.
#[derive(Debug, Clone)]
pub struct LocationCache {
    storage: Storage,
}

impl LocationCache {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn store(&self, sample: &LocationSample, synced: bool) {
        let entry = CachedLocation {
            sample: sample.clone(),
            synced,
        };
        if !self.storage.save(LOCATION_KEY, &entry) {
            tracing::warn!("Could not cache location");
        }
    }

    pub fn load(&self) -> Option<CachedLocation> {
        self.storage.load(LOCATION_KEY)
    }

    /// The cached entry, if it was captured no longer than `max_age` ago.
    pub fn load_fresh(&self, max_age: Duration) -> Option<CachedLocation> {
        let entry = self.load()?;
        let age = entry.sample.age_at(Utc::now()).to_std().unwrap_or_default();
        if age <= max_age {
            Some(entry)
        } else {
            tracing::debug!(age_secs = age.as_secs(), "Cached location too old");
            None
        }
    }

    pub fn clear(&self) {
        self.storage.remove(LOCATION_KEY);
    }
}
