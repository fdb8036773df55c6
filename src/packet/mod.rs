//! Raw IPv4 packet handling
//!
//! [`PacketView`] reads datagrams coming from the virtual interface and
//! [`PacketBuilder`] produces the ones written back to it.

mod builder;
pub mod checksum;
mod flow;
mod view;

pub use builder::{PacketBuilder, TcpSegment, DEFAULT_TTL, MAX_TCP_PAYLOAD, MAX_UDP_PAYLOAD};
pub use flow::FlowKey;
pub use view::{
    ip_version, PacketView, TcpHeader, Transport, UdpHeader, IPV4_HEADER_LEN, TCP_HEADER_LEN,
    UDP_HEADER_LEN,
};

/// IP protocol number for TCP
pub const IPPROTO_TCP: u8 = 6;
/// IP protocol number for UDP
pub const IPPROTO_UDP: u8 = 17;

/// TCP flag bits
pub mod tcp_flags {
    /// FIN flag - connection close request
    pub const FIN: u8 = 0x01;
    /// SYN flag - connection open request
    pub const SYN: u8 = 0x02;
    /// RST flag - connection reset
    pub const RST: u8 = 0x04;
    /// PSH flag - push data immediately
    pub const PSH: u8 = 0x08;
    /// ACK flag - acknowledgment
    pub const ACK: u8 = 0x10;
    /// URG flag - urgent pointer valid
    pub const URG: u8 = 0x20;

    /// Human-readable description of a flag byte
    #[must_use]
    pub fn describe(flags: u8) -> String {
        let names: Vec<&str> = [
            (SYN, "SYN"),
            (ACK, "ACK"),
            (FIN, "FIN"),
            (RST, "RST"),
            (PSH, "PSH"),
            (URG, "URG"),
        ]
        .into_iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| name)
        .collect();

        if names.is_empty() {
            "none".to_string()
        } else {
            names.join(",")
        }
    }

}
