//! Hot-reloadable settings holder
//!
//! ```text
//! Flow operation -> SettingsStore::load() -> ArcSwap::load_full() -> Arc<DpiSettings>
//!
//! Reload -> SettingsStore::reload() -> ArcSwap::store() + watch::send
//! ```
//!
//! Readers take an `Arc` of the current snapshot and keep it for the whole
//! operation, so a concurrent reload is never observed halfway.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::info;

use super::settings::DpiSettings;
use crate::error::ConfigError;

/// Shared, atomically swappable [`DpiSettings`] snapshot.
pub struct SettingsStore {
    current: ArcSwap<DpiSettings>,
    notify: watch::Sender<Arc<DpiSettings>>,
    version: AtomicU64,
}

impl SettingsStore {
    /// Create a store holding `initial`.
    pub fn new(initial: DpiSettings) -> Self {
        let initial = Arc::new(initial);
        let (notify, _) = watch::channel(Arc::clone(&initial));
        Self {
            current: ArcSwap::new(initial),
            notify,
            version: AtomicU64::new(1),
        }
    }

    /// Current snapshot. Hold the returned `Arc` for the duration of one
    /// operation.
    pub fn load(&self) -> Arc<DpiSettings> {
        self.current.load_full()
    }

    /// Install a new snapshot.
    ///
    /// Sessions that already captured a snapshot keep it; new operations see
    /// the new one.
    pub fn reload(&self, settings: DpiSettings) {
        let settings = Arc::new(settings);
        self.current.store(Arc::clone(&settings));
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            version,
            method = %settings.method,
            "DPI settings reloaded"
        );
        self.notify.send_replace(settings);
    }

    /// Validate and install a new snapshot.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` and leaves the current snapshot
    /// in place if `settings` is invalid.
    pub fn try_reload(&self, settings: DpiSettings) -> Result<(), ConfigError> {
        settings.validate()?;
        self.reload(settings);
        Ok(())
    }

    /// Subscribe to snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<DpiSettings>> {
        self.notify.subscribe()
    }

    /// Number of snapshots installed so far, starting at 1.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(DpiSettings::default())
    }
}

impl std::fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsStore")
            .field("version", &self.version())
            .field("method", &self.load().method)
            .finish()
    }
}
