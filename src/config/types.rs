//! Configuration types for desync-tunnel
//!
//! The file configuration covers the interface, limits, socket protection
//! and logging. The DPI settings snapshot is embedded under `dpi` and can be
//! swapped at runtime without touching the rest.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::settings::DpiSettings;
use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Virtual interface parameters
    #[serde(default)]
    pub tun: TunConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Session limits and timeouts
    #[serde(default)]
    pub limits: LimitsConfig,

    /// How real sockets are kept out of the tunnel
    #[serde(default)]
    pub protect: ProtectConfig,

    /// Initial DPI settings snapshot
    #[serde(default)]
    pub dpi: DpiSettings,
}

impl EngineConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tun.validate()?;
        self.limits.validate(self.tun.mtu)?;
        self.protect.validate()?;
        self.dpi.validate()?;
        Ok(())
    }
}

/// Virtual interface configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunConfig {
    /// Largest frame read from the interface
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Address assigned to the interface by the host
    #[serde(default = "default_tun_address")]
    pub address: String,

    /// Prefix length of `address`
    #[serde(default = "default_tun_prefix")]
    pub prefix: u8,
}

fn default_mtu() -> usize {
    1500
}

fn default_tun_address() -> String {
    "10.8.0.2".into()
}

fn default_tun_prefix() -> u8 {
    32
}

impl TunConfig {
    /// Validate interface parameters
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the MTU or address is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(576..=65535).contains(&self.mtu) {
            return Err(ConfigError::validation(format!(
                "tun.mtu must be between 576 and 65535, got {}",
                self.mtu
            )));
        }
        if self.address.parse::<std::net::Ipv4Addr>().is_err() {
            return Err(ConfigError::validation(format!(
                "tun.address must be an IPv4 address, got '{}'",
                self.address
            )));
        }
        if self.prefix > 32 {
            return Err(ConfigError::validation(format!(
                "tun.prefix must be at most 32, got {}",
                self.prefix
            )));
        }
        Ok(())
    }
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            address: default_tun_address(),
            prefix: default_tun_prefix(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default)]
    pub target: bool,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: false,
        }
    }
}

/// Session limits and timeouts
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Maximum concurrent TCP sessions
    #[serde(default = "default_max_tcp_sessions")]
    pub max_tcp_sessions: usize,

    /// Real TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// TCP idle timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub tcp_idle_timeout_secs: u64,

    /// UDP idle timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub udp_idle_timeout_secs: u64,

    /// Payload chunks buffered per session while connecting
    #[serde(default = "default_pending_chunks")]
    pub pending_chunks: usize,

    /// Largest payload per segment sent to the client
    #[serde(default = "default_mss")]
    pub mss: usize,

    /// Advertised receive window
    #[serde(default = "default_window")]
    pub window: u16,

    /// Inbound frames between statistics refreshes
    #[serde(default = "default_stats_interval_frames")]
    pub stats_interval_frames: u64,
}

fn default_max_tcp_sessions() -> usize {
    512
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_pending_chunks() -> usize {
    100
}

fn default_mss() -> usize {
    1400
}

fn default_window() -> u16 {
    65535
}

fn default_stats_interval_frames() -> u64 {
    100
}

impl LimitsConfig {
    /// Validate limits against the interface MTU
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if a limit is zero or the MSS
    /// does not fit the MTU.
    pub fn validate(&self, mtu: usize) -> Result<(), ConfigError> {
        if self.max_tcp_sessions == 0 {
            return Err(ConfigError::validation("limits.max_tcp_sessions cannot be 0"));
        }
        if self.pending_chunks == 0 {
            return Err(ConfigError::validation("limits.pending_chunks cannot be 0"));
        }
        if self.connect_timeout_secs == 0
            || self.tcp_idle_timeout_secs == 0
            || self.udp_idle_timeout_secs == 0
        {
            return Err(ConfigError::validation("limits timeouts must be greater than 0"));
        }
        if self.stats_interval_frames == 0 {
            return Err(ConfigError::validation(
                "limits.stats_interval_frames cannot be 0",
            ));
        }
        let max_mss = mtu.saturating_sub(40);
        if self.mss < 536 || self.mss > max_mss {
            return Err(ConfigError::validation(format!(
                "limits.mss must be between 536 and {max_mss}, got {}",
                self.mss
            )));
        }
        Ok(())
    }

    /// Get connect timeout as Duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get TCP idle timeout as Duration
    #[must_use]
    pub const fn tcp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_idle_timeout_secs)
    }

    /// Get UDP idle timeout as Duration
    #[must_use]
    pub const fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_tcp_sessions: default_max_tcp_sessions(),
            connect_timeout_secs: default_connect_timeout_secs(),
            tcp_idle_timeout_secs: default_idle_timeout_secs(),
            udp_idle_timeout_secs: default_idle_timeout_secs(),
            pending_chunks: default_pending_chunks(),
            mss: default_mss(),
            window: default_window(),
            stats_interval_frames: default_stats_interval_frames(),
        }
    }
}

/// Socket protection configuration
///
/// Real sockets must bypass the tunnel's own routes. On Linux this is done
/// with a firewall mark or by binding to the physical interface.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProtectConfig {
    /// SO_MARK value for real sockets
    #[serde(default)]
    pub routing_mark: Option<u32>,

    /// SO_BINDTODEVICE interface for real sockets
    #[serde(default)]
    pub bind_interface: Option<String>,
}

impl ProtectConfig {
    /// Validate protection settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the interface name is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref iface) = self.bind_interface {
            if iface.is_empty() || iface.len() > 15 {
                return Err(ConfigError::validation(format!(
                    "protect.bind_interface must be 1-15 bytes, got '{iface}'"
                )));
            }
        }
        Ok(())
    }
}
