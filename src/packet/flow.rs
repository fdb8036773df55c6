//! Flow identity shared by both flow tables

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use super::{IPPROTO_TCP, IPPROTO_UDP};

/// 5-tuple key for session tracking
///
/// Always oriented client → destination, the direction of packets read from
/// the virtual interface. Replies are built from the same key with the
/// endpoints swapped, so a stored key and a freshly parsed one compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Client address
    pub src_ip: Ipv4Addr,
    /// Client port
    pub src_port: u16,
    /// Destination address
    pub dst_ip: Ipv4Addr,
    /// Destination port
    pub dst_port: u16,
    /// IP protocol number (6=TCP, 17=UDP)
    pub protocol: u8,
}

impl FlowKey {
    /// Create a new flow key
    #[must_use]
    pub const fn new(
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        protocol: u8,
    ) -> Self {
        Self {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            protocol,
        }
    }

    /// TCP key from two socket addresses
    #[must_use]
    pub const fn tcp(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self::new(*src.ip(), src.port(), *dst.ip(), dst.port(), IPPROTO_TCP)
    }

    /// UDP key from two socket addresses
    #[must_use]
    pub const fn udp(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self::new(*src.ip(), src.port(), *dst.ip(), dst.port(), IPPROTO_UDP)
    }

    /// Client endpoint
    #[must_use]
    pub const fn src(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.src_ip, self.src_port)
    }

    /// Destination endpoint
    #[must_use]
    pub const fn dst(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.dst_ip, self.dst_port)
    }

    /// Swap endpoints, keeping the protocol
    #[must_use]
    pub const fn reverse(&self) -> Self {
        Self::new(
            self.dst_ip,
            self.dst_port,
            self.src_ip,
            self.src_port,
            self.protocol,
        )
    }

    /// Check if this is a TCP flow
    #[must_use]
    pub const fn is_tcp(&self) -> bool {
        self.protocol == IPPROTO_TCP
    }

    /// Check if this is a UDP flow
    #[must_use]
    pub const fn is_udp(&self) -> bool {
        self.protocol == IPPROTO_UDP
    }

    /// Get the protocol name for logging
    #[must_use]
    pub const fn protocol_name(&self) -> &'static str {
        match self.protocol {
            IPPROTO_TCP => "TCP",
            IPPROTO_UDP => "UDP",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}/{}",
            self.src_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port,
            self.protocol_name()
        )
    }
}
