//! Configuration module for desync-tunnel
//!
//! Two layers live here:
//!
//! - [`EngineConfig`]: the file configuration, loaded once at startup
//! - [`DpiSettings`]: the desync snapshot, swapped at runtime through
//!   [`SettingsStore`]
//!
//! # Example
//!
//! ```no_run
//! use desync_tunnel::config::{load_config, SettingsStore};
//!
//! let config = load_config("/etc/desync-tunnel/config.json").unwrap();
//! let store = SettingsStore::new(config.dpi.clone());
//! println!("Desync method: {}", store.load().method);
//! ```

mod loader;
mod settings;
mod store;
mod types;

pub use loader::{
    apply_env_overrides, create_default_config, load_config, load_config_str,
    load_config_with_env,
};
pub use settings::{DesyncMethod, DpiSettings, MAX_BUFFER_SIZE, MAX_FAKE_COUNT, MIN_BUFFER_SIZE};
pub use store::SettingsStore;
pub use types::{EngineConfig, LimitsConfig, LogConfig, ProtectConfig, TunConfig};
