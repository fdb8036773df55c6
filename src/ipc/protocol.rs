//! Daemon channel messages
//!
//! One JSON object per line in each direction:
//!
//! ```text
//! {"cmd":"ping"}                              -> {"status":"ok","pong":true}
//! {"cmd":"status"}                            -> {"status":"ok","running":true,"packets":10,"bypassed":2}
//! {"cmd":"start","settings":{...}}            -> {"status":"ok"}
//! {"cmd":"stop"}                              -> {"status":"ok","running":false}
//! {"cmd":"settings","method":"SPLIT",...}     -> {"status":"ok"}
//! {"cmd":"exit"}                              -> (no reply required)
//! ```

use serde::{Deserialize, Serialize};

use crate::config::{DesyncMethod, DpiSettings};

/// Request sent to the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DaemonCommand {
    /// Liveness check
    Ping,
    /// Running flag and counters
    Status,
    /// Start intercepting with the given settings
    Start {
        /// Initial settings
        settings: DaemonSettings,
    },
    /// Stop intercepting
    Stop,
    /// Replace settings; fields sit next to `cmd`
    Settings(DaemonSettings),
    /// Terminate the daemon
    Exit,
}

impl DaemonCommand {
    /// Whether the daemon answers this command
    #[must_use]
    pub const fn expects_reply(&self) -> bool {
        !matches!(self, Self::Exit)
    }
}

/// Settings subset understood by the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Desync method
    pub method: DesyncMethod,
    /// Split offset
    pub first_packet_size: usize,
    /// Inter-fragment delay in milliseconds
    pub split_delay: u64,
    /// DISORDER fragment count
    pub split_count: usize,
    /// Desync TLS flows
    pub desync_https: bool,
    /// Desync HTTP flows
    pub desync_http: bool,
    /// Drop QUIC
    pub block_quic: bool,
}

impl From<&DpiSettings> for DaemonSettings {
    fn from(settings: &DpiSettings) -> Self {
        Self {
            method: settings.method,
            first_packet_size: settings.first_packet_size,
            split_delay: settings.split_delay,
            split_count: settings.split_count,
            desync_https: settings.desync_https,
            desync_http: settings.desync_http,
            block_quic: settings.block_quic,
        }
    }
}

impl DaemonSettings {
    /// `base` with the daemon-controlled fields replaced
    #[must_use]
    pub fn apply_to(&self, base: &DpiSettings) -> DpiSettings {
        DpiSettings {
            method: self.method,
            first_packet_size: self.first_packet_size,
            split_delay: self.split_delay,
            split_count: self.split_count,
            desync_https: self.desync_https,
            desync_http: self.desync_http,
            block_quic: self.block_quic,
            ..base.clone()
        }
    }
}

/// Reply from the daemon; which fields are present depends on the command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonReply {
    /// "ok" or "error"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Ping answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pong: Option<bool>,
    /// Interception active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    /// Packets seen
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packets: Option<u64>,
    /// Packets desynchronized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypassed: Option<u64>,
}

impl DaemonReply {
    /// Whether the daemon reported success
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status.as_deref() != Some("error")
    }

    /// Status fields, defaulting missing ones
    #[must_use]
    pub fn to_status(&self) -> DaemonStatus {
        DaemonStatus {
            running: self.running.unwrap_or(false),
            packets: self.packets.unwrap_or(0),
            bypassed: self.bypassed.unwrap_or(0),
        }
    }
}

/// Answer to [`DaemonCommand::Status`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Interception active
    pub running: bool,
    /// Packets seen
    pub packets: u64,
    /// Packets desynchronized
    pub bypassed: u64,
}
