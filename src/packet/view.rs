//! Read-only view over a raw IPv4 datagram
//!
//! Every offset is checked against the buffer before it is read; anything
//! short, fragmented or inconsistent is rejected instead of indexed.

use std::net::Ipv4Addr;

use super::flow::FlowKey;
use super::{tcp_flags, IPPROTO_TCP, IPPROTO_UDP};
use crate::error::PacketError;

/// Minimum IPv4 header length
pub const IPV4_HEADER_LEN: usize = 20;
/// Minimum TCP header length
pub const TCP_HEADER_LEN: usize = 20;
/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;

/// IP version nibble of a frame, if it has at least one byte
#[must_use]
pub fn ip_version(frame: &[u8]) -> Option<u8> {
    frame.first().map(|b| b >> 4)
}

/// Parsed TCP header details
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Sequence number
    pub seq: u32,
    /// Acknowledgment number
    pub ack: u32,
    /// Header length in bytes, options included
    pub header_len: usize,
    /// Flag byte
    pub flags: u8,
    /// Advertised window
    pub window: u16,
}

impl TcpHeader {
    /// Connection initiation: SYN without ACK
    #[must_use]
    pub const fn is_syn(&self) -> bool {
        self.flags & tcp_flags::SYN != 0 && self.flags & tcp_flags::ACK == 0
    }

    /// Check if ACK flag is set
    #[must_use]
    pub const fn is_ack(&self) -> bool {
        self.flags & tcp_flags::ACK != 0
    }

    /// Check if FIN flag is set
    #[must_use]
    pub const fn is_fin(&self) -> bool {
        self.flags & tcp_flags::FIN != 0
    }

    /// Check if RST flag is set
    #[must_use]
    pub const fn is_rst(&self) -> bool {
        self.flags & tcp_flags::RST != 0
    }

    /// Check if PSH flag is set
    #[must_use]
    pub const fn is_psh(&self) -> bool {
        self.flags & tcp_flags::PSH != 0
    }

    /// Human-readable flag list, e.g. "SYN,ACK"
    #[must_use]
    pub fn flags_string(&self) -> String {
        tcp_flags::describe(self.flags)
    }
}

/// Parsed UDP header details
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
}

/// Transport layer of a parsed datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// TCP segment
    Tcp(TcpHeader),
    /// UDP datagram
    Udp(UdpHeader),
    /// Any other protocol; payload is everything after the IP header
    Other(u8),
}

/// Zero-copy view over an IPv4 datagram.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    /// Datagram bytes, trimmed to the IP total length
    data: &'a [u8],
    header_len: usize,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    transport: Transport,
    payload_offset: usize,
}

impl<'a> PacketView<'a> {
    /// Parse `data`, returning `None` for anything malformed.
    #[must_use]
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        Self::try_parse(data).ok()
    }

    /// Parse `data`, reporting why it was rejected.
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if the buffer is not a complete, unfragmented
    /// IPv4 datagram with a complete TCP or UDP header.
    pub fn try_parse(data: &'a [u8]) -> Result<Self, PacketError> {
        let truncated = || PacketError::Truncated { len: data.len() };

        let version = ip_version(data).ok_or_else(truncated)?;
        if version != 4 {
            return Err(PacketError::UnsupportedVersion(version));
        }
        if data.len() < IPV4_HEADER_LEN {
            return Err(truncated());
        }

        let header_len = usize::from(data[0] & 0x0F) * 4;
        let total_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
        if header_len < IPV4_HEADER_LEN || total_len < header_len || total_len > data.len() {
            return Err(truncated());
        }
        // Trailing link padding is not part of the datagram
        let data = &data[..total_len];

        // Only unfragmented datagrams carry a usable transport header
        let frag = u16::from_be_bytes([data[6], data[7]]);
        if frag & 0x3FFF != 0 {
            return Err(PacketError::Fragmented);
        }

        let protocol = data[9];
        let src_ip = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let dst_ip = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

        let (transport, payload_offset) = match protocol {
            IPPROTO_TCP => {
                let tcp = parse_tcp(data, header_len).ok_or_else(truncated)?;
                (Transport::Tcp(tcp), header_len + tcp.header_len)
            }
            IPPROTO_UDP => {
                let udp = parse_udp(data, header_len).ok_or_else(truncated)?;
                (Transport::Udp(udp), header_len + UDP_HEADER_LEN)
            }
            other => (Transport::Other(other), header_len),
        };

        Ok(Self {
            data,
            header_len,
            src_ip,
            dst_ip,
            transport,
            payload_offset,
        })
    }

    /// IP version (always 4 for a parsed view)
    #[must_use]
    pub fn version(&self) -> u8 {
        self.data[0] >> 4
    }

    /// IP header length in bytes
    #[must_use]
    pub const fn header_len(&self) -> usize {
        self.header_len
    }

    /// IP protocol number
    #[must_use]
    pub fn protocol(&self) -> u8 {
        self.data[9]
    }

    /// Source address
    #[must_use]
    pub const fn src_ip(&self) -> Ipv4Addr {
        self.src_ip
    }

    /// Destination address
    #[must_use]
    pub const fn dst_ip(&self) -> Ipv4Addr {
        self.dst_ip
    }

    /// Transport header
    #[must_use]
    pub const fn transport(&self) -> Transport {
        self.transport
    }

    /// TCP header, if this is a TCP segment
    #[must_use]
    pub const fn tcp(&self) -> Option<TcpHeader> {
        match self.transport {
            Transport::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    /// UDP header, if this is a UDP datagram
    #[must_use]
    pub const fn udp(&self) -> Option<UdpHeader> {
        match self.transport {
            Transport::Udp(udp) => Some(udp),
            _ => None,
        }
    }

    /// Application payload after all headers
    #[must_use]
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.payload_offset..]
    }

    /// Whole datagram
    #[must_use]
    pub const fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Client → destination flow key for TCP and UDP
    #[must_use]
    pub fn flow_key(&self) -> Option<FlowKey> {
        let (src_port, dst_port) = match self.transport {
            Transport::Tcp(tcp) => (tcp.src_port, tcp.dst_port),
            Transport::Udp(udp) => (udp.src_port, udp.dst_port),
            Transport::Other(_) => return None,
        };
        Some(FlowKey::new(
            self.src_ip,
            src_port,
            self.dst_ip,
            dst_port,
            self.protocol(),
        ))
    }
}

fn parse_tcp(packet: &[u8], ip_header_len: usize) -> Option<TcpHeader> {
    let tcp = packet.get(ip_header_len..)?;
    if tcp.len() < TCP_HEADER_LEN {
        return None;
    }

    // Data offset is in the high 4 bits of byte 12, in 32-bit words
    let header_len = usize::from(tcp[12] >> 4) * 4;
    if header_len < TCP_HEADER_LEN || header_len > tcp.len() {
        return None;
    }

    Some(TcpHeader {
        src_port: u16::from_be_bytes([tcp[0], tcp[1]]),
        dst_port: u16::from_be_bytes([tcp[2], tcp[3]]),
        seq: u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]),
        ack: u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]),
        header_len,
        flags: tcp[13],
        window: u16::from_be_bytes([tcp[14], tcp[15]]),
    })
}

fn parse_udp(packet: &[u8], ip_header_len: usize) -> Option<UdpHeader> {
    let udp = packet.get(ip_header_len..ip_header_len + UDP_HEADER_LEN)?;
    Some(UdpHeader {
        src_port: u16::from_be_bytes([udp[0], udp[1]]),
        dst_port: u16::from_be_bytes([udp[2], udp[3]]),
    })
}
