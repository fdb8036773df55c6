//! DPI settings snapshot
//!
//! `DpiSettings` is the value the engine reads on every desync decision and
//! every new real socket. It is never mutated in place: a reload installs a
//! whole new snapshot through [`SettingsStore`](super::SettingsStore).

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Smallest socket buffer we will configure
pub const MIN_BUFFER_SIZE: usize = 4096;

/// Largest socket buffer we will configure
pub const MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Upper bound for repeated fake records
pub const MAX_FAKE_COUNT: u32 = 10;

/// Resolver port used when `custom_dns` carries no port
const RESOLVER_PORT: u16 = 53;

/// First-segment desynchronization strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DesyncMethod {
    /// Head then tail, split at `first_packet_size`
    #[default]
    Split,
    /// Tail then head
    SplitReverse,
    /// `split_count` pieces in order
    Disorder,
    /// `split_count` pieces in reverse order
    DisorderReverse,
    /// Decoy record, then a regular split
    Fake,
}

impl DesyncMethod {
    /// All methods, in wire order
    pub const ALL: [Self; 5] = [
        Self::Split,
        Self::SplitReverse,
        Self::Disorder,
        Self::DisorderReverse,
        Self::Fake,
    ];

    /// Wire name used by config files and the daemon channel
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Split => "SPLIT",
            Self::SplitReverse => "SPLIT_REVERSE",
            Self::Disorder => "DISORDER",
            Self::DisorderReverse => "DISORDER_REVERSE",
            Self::Fake => "FAKE",
        }
    }
}

impl fmt::Display for DesyncMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DesyncMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::validation(format!("Unknown desync method: {s}")))
    }
}

/// Immutable DPI circumvention settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DpiSettings {
    /// Desync strategy for eligible first chunks
    #[serde(default)]
    pub method: DesyncMethod,

    /// Split offset for SPLIT, SPLIT_REVERSE and FAKE
    #[serde(default = "default_first_packet_size")]
    pub first_packet_size: usize,

    /// Delay between fragment writes in milliseconds (0 disables)
    #[serde(default = "default_split_delay")]
    pub split_delay: u64,

    /// Fragment count for DISORDER and DISORDER_REVERSE
    #[serde(default = "default_split_count")]
    pub split_count: usize,

    /// Decoy payload for FAKE, hex encoded
    #[serde(default = "default_fake_hex")]
    pub fake_hex: String,

    /// How many decoy records FAKE writes
    #[serde(default = "default_fake_count")]
    pub fake_count: u32,

    /// Alternate the case of the HTTP Host header value
    #[serde(default = "default_true")]
    pub mix_host_case: bool,

    /// Apply desync to plain HTTP flows
    #[serde(default = "default_true")]
    pub desync_http: bool,

    /// Apply desync to TLS flows
    #[serde(default = "default_true")]
    pub desync_https: bool,

    /// Hostname fragments that are never desynchronized
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Drop UDP/443 so clients fall back to TCP
    #[serde(default = "default_true")]
    pub block_quic: bool,

    /// Redirect port 53 datagrams to `custom_dns`
    #[serde(default)]
    pub custom_dns_enabled: bool,

    /// Primary resolver for DNS redirection, `a.b.c.d` or `a.b.c.d:port`
    #[serde(default = "default_custom_dns")]
    pub custom_dns: String,

    /// Secondary resolver, advertised to the interface setup layer
    #[serde(default = "default_custom_dns2")]
    pub custom_dns2: String,

    /// SO_SNDBUF / SO_RCVBUF for real sockets
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// TCP_NODELAY on real TCP sockets
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
}

fn default_first_packet_size() -> usize {
    2
}

fn default_split_delay() -> u64 {
    50
}

fn default_split_count() -> usize {
    4
}

fn default_fake_hex() -> String {
    // "GET / HTTP/1.0\r\n\r\n"
    "474554202f20485454502f312e300d0a0d0a".into()
}

fn default_fake_count() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_custom_dns() -> String {
    "94.140.14.14".into()
}

fn default_custom_dns2() -> String {
    "94.140.15.15".into()
}

fn default_buffer_size() -> usize {
    32 * 1024
}

impl Default for DpiSettings {
    fn default() -> Self {
        Self {
            method: DesyncMethod::default(),
            first_packet_size: default_first_packet_size(),
            split_delay: default_split_delay(),
            split_count: default_split_count(),
            fake_hex: default_fake_hex(),
            fake_count: default_fake_count(),
            mix_host_case: true,
            desync_http: true,
            desync_https: true,
            whitelist: Vec::new(),
            block_quic: true,
            custom_dns_enabled: false,
            custom_dns: default_custom_dns(),
            custom_dns2: default_custom_dns2(),
            buffer_size: default_buffer_size(),
            tcp_nodelay: true,
        }
    }
}

impl DpiSettings {
    /// Validate the settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if a field is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if hex::decode(&self.fake_hex).is_err() {
            return Err(ConfigError::validation(format!(
                "fake_hex is not valid hex: {}",
                self.fake_hex
            )));
        }

        if self.custom_dns_enabled {
            for (name, value) in [("custom_dns", &self.custom_dns), ("custom_dns2", &self.custom_dns2)] {
                if parse_resolver(value).is_none() {
                    return Err(ConfigError::validation(format!(
                        "{name} must be an IPv4 address with optional port, got '{value}'"
                    )));
                }
            }
        }

        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(ConfigError::validation(format!(
                "buffer_size must be between {MIN_BUFFER_SIZE} and {MAX_BUFFER_SIZE}, got {}",
                self.buffer_size
            )));
        }

        Ok(())
    }

    /// Inter-fragment delay
    #[must_use]
    pub const fn delay(&self) -> Duration {
        Duration::from_millis(self.split_delay)
    }

    /// Decoded decoy payload; empty if the hex is invalid
    #[must_use]
    pub fn fake_payload(&self) -> Vec<u8> {
        hex::decode(&self.fake_hex).unwrap_or_default()
    }

    /// Clamped decoy repetition count
    #[must_use]
    pub fn fake_repeats(&self) -> u32 {
        self.fake_count.clamp(1, MAX_FAKE_COUNT)
    }

    /// Case-insensitive substring match against the whitelist.
    ///
    /// Empty entries are ignored so a stray blank line in the list does not
    /// exempt every host.
    #[must_use]
    pub fn is_whitelisted(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.whitelist
            .iter()
            .map(|entry| entry.trim())
            .filter(|entry| !entry.is_empty())
            .any(|entry| host.contains(&entry.to_ascii_lowercase()))
    }

    /// Resolver address for DNS redirection, if enabled and valid
    #[must_use]
    pub fn dns_redirect(&self) -> Option<SocketAddrV4> {
        if !self.custom_dns_enabled {
            return None;
        }
        parse_resolver(&self.custom_dns)
    }
}

fn parse_resolver(value: &str) -> Option<SocketAddrV4> {
    let value = value.trim();
    value.parse::<SocketAddrV4>().ok().or_else(|| {
        value
            .parse::<Ipv4Addr>()
            .ok()
            .map(|ip| SocketAddrV4::new(ip, RESOLVER_PORT))
    })
}
