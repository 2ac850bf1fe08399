//! Durable key/value storage.
//!
//! Each key is one JSON file in a directory:
//! - default: the platform config directory (`~/.config/barberline/` on Linux,
//!   `~/Library/Application Support/barberline/` on macOS, `%APPDATA%\barberline\` on Windows)
//! - or any directory passed to [`Storage::at`].
//!
//! Writers do not coordinate: the last write wins. Every value has a single
//! logical owner, so that is enough.

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

/// Last known provider location (owned by the location publisher).
pub const LOCATION_KEY: &str = "barberline_last_location";
/// Event-delivered unread count (owned by the notification counter).
pub const UNREAD_COUNT_KEY: &str = "barberline_unread_count";

#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    /// Storage rooted at `dir`. The directory is created lazily on first write.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Storage in the platform config directory.
    pub fn platform_default() -> Option<Self> {
        let dir = dirs::config_dir()?.join("barberline");
        Some(Self::at(dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save a value. Returns `true` if the operation succeeded.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.save_raw(key, &json),
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to serialize stored value");
                false
            }
        }
    }

    /// Load a value.
    ///
    /// Returns `None` if the key doesn't exist or deserialization fails.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let json = self.load_raw(key)?;
        match serde_json::from_str(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "Discarding unreadable stored value");
                None
            }
        }
    }

    pub fn remove(&self, key: &str) {
        if let Some(path) = self.file_path(key) {
            let _ = std::fs::remove_file(path);
        }
    }

    fn file_path(&self, key: &str) -> Option<PathBuf> {
        if key.is_empty() {
            return None;
        }
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        Some(self.dir.join(format!("{safe_key}.json")))
    }

    fn save_raw(&self, key: &str, value: &str) -> bool {
        let Some(path) = self.file_path(key) else {
            return false;
        };
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "Cannot create storage dir");
            return false;
        }
        // Never leave a half-written document behind.
        let tmp = path.with_extension("json.tmp");
        match std::fs::write(&tmp, value).and_then(|_| std::fs::rename(&tmp, &path)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to persist value");
                false
            }
        }
    }

    fn load_raw(&self, key: &str) -> Option<String> {
        let path = self.file_path(key)?;
        std::fs::read_to_string(path).ok()
    }
}
