//! Sniff result types

use serde::{Deserialize, Serialize};

/// Result of inspecting the first chunk of a flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SniffResult {
    /// Detected protocol
    pub protocol: Protocol,
    /// SNI (TLS) or Host header (HTTP)
    pub hostname: Option<String>,
    /// ALPN list offered in the `ClientHello`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    /// Encrypted Client Hello offered
    #[serde(default)]
    pub has_ech: bool,
}

impl SniffResult {
    /// TLS `ClientHello`, with or without SNI
    pub fn tls(hostname: Option<String>) -> Self {
        Self {
            protocol: Protocol::Tls,
            hostname,
            alpn: Vec::new(),
            has_ech: false,
        }
    }

    /// HTTP request, with or without Host header
    pub fn http(hostname: Option<String>) -> Self {
        Self {
            protocol: Protocol::Http,
            hostname,
            alpn: Vec::new(),
            has_ech: false,
        }
    }

    /// Nothing recognized
    pub fn unknown() -> Self {
        Self {
            protocol: Protocol::Unknown,
            hostname: None,
            alpn: Vec::new(),
            has_ech: false,
        }
    }

    /// Hostname, if one was found
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Whether the chunk is a TLS `ClientHello`
    #[must_use]
    pub fn is_client_hello(&self) -> bool {
        self.protocol == Protocol::Tls
    }
}

/// Detected protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TLS `ClientHello`
    Tls,
    /// Plain HTTP
    Http,
    /// Unknown protocol
    Unknown,
}

impl Protocol {
    /// Get the protocol name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tls => "tls",
            Self::Http => "http",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
