//! Error types for desync-tunnel
//!
//! Errors are grouped by subsystem. Malformed packets and application
//! payloads never surface here: parsers return `Option` and the engine
//! skips what it cannot understand.

use std::io;
use std::net::SocketAddrV4;

use thiserror::Error;

/// Top-level error type for desync-tunnel
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Packet parsing errors
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// TCP/UDP session errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Virtual interface errors
    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),

    /// Daemon channel errors
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Packet(e) => e.is_recoverable(),
            Self::Session(e) => e.is_recoverable(),
            Self::Interface(e) => e.is_recoverable(),
            Self::Ipc(e) => e.is_recoverable(),
            Self::Io(e) => is_transient_io(e),
        }
    }
}

fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
    )
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Errors describing why a frame could not be interpreted.
///
/// The dispatch loop only uses these for counters and debug logs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer shorter than the headers it claims to carry
    #[error("Truncated packet: {len} bytes")]
    Truncated { len: usize },

    /// Not an IPv4 datagram
    #[error("Unsupported IP version {0}")]
    UnsupportedVersion(u8),

    /// IP fragment; reassembly is not supported
    #[error("Fragmented datagram")]
    Fragmented,

    /// Transport protocol we do not relay
    #[error("Unsupported protocol {0}")]
    UnsupportedProtocol(u8),
}

impl PacketError {
    /// A bad frame never poisons the loop; the next one is independent
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }
}

/// Per-session failures (TCP or UDP)
#[derive(Debug, Error)]
pub enum SessionError {
    /// Session limit reached, new SYN rejected
    #[error("Session pool exhausted ({limit} active)")]
    PoolExhausted { limit: usize },

    /// Real socket could not be connected
    #[error("Connect to {addr} failed: {reason}")]
    ConnectFailed { addr: SocketAddrV4, reason: String },

    /// Real socket did not connect in time
    #[error("Connect to {addr} timed out after {timeout_secs}s")]
    ConnectTimeout { addr: SocketAddrV4, timeout_secs: u64 },

    /// Socket protection callback refused the socket
    #[error("Failed to protect socket: {0}")]
    Protect(String),

    /// Operation on a session that has already been torn down
    #[error("Session closed")]
    Closed,

    /// I/O error on the real socket
    #[error("Session I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::PoolExhausted { .. } | Self::ConnectTimeout { .. } => true,
            Self::ConnectFailed { .. } | Self::Protect(_) | Self::Closed => false,
            Self::Io(e) => is_transient_io(e),
        }
    }

    /// Create a connect failure error
    pub fn connect_failed(addr: SocketAddrV4, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            addr,
            reason: reason.into(),
        }
    }
}

/// Virtual interface errors
#[derive(Debug, Error)]
pub enum InterfaceError {
    /// Reading a frame failed
    #[error("Interface read failed: {0}")]
    Read(io::Error),

    /// Writing a frame failed
    #[error("Interface write failed: {0}")]
    Write(io::Error),

    /// Interface has been closed
    #[error("Interface closed")]
    Closed,
}

impl InterfaceError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Read(e) | Self::Write(e) => is_transient_io(e),
            Self::Closed => false,
        }
    }
}

/// Daemon channel errors
#[derive(Debug, Error)]
pub enum IpcError {
    /// Could not reach the daemon socket
    #[error("Connection error: {0}")]
    Connection(String),

    /// Request could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Reply was malformed or missing
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No reply within the request timeout
    #[error("Request timed out")]
    Timeout,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl IpcError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout | Self::Io(_))
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

/// Result type alias for desync-tunnel operations
pub type Result<T> = std::result::Result<T, EngineError>;
