//! Datagram construction for frames written back to the virtual interface
//!
//! Every frame the engine emits goes through [`PacketBuilder`], so header
//! lengths and checksums are computed in exactly one place.

use std::net::SocketAddrV4;

use super::checksum::{ipv4_header_checksum, transport_checksum};
use super::view::{PacketView, IPV4_HEADER_LEN, TCP_HEADER_LEN, UDP_HEADER_LEN};
use super::{IPPROTO_TCP, IPPROTO_UDP};

/// TTL of emitted datagrams
pub const DEFAULT_TTL: u8 = 64;

/// Largest payload that still fits the 16-bit IPv4 total length
pub const MAX_TCP_PAYLOAD: usize = u16::MAX as usize - IPV4_HEADER_LEN - TCP_HEADER_LEN - 4;

/// Largest UDP payload we will wrap
pub const MAX_UDP_PAYLOAD: usize = u16::MAX as usize - IPV4_HEADER_LEN - UDP_HEADER_LEN;

/// Semantic description of one TCP segment.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    /// Sender endpoint
    pub src: SocketAddrV4,
    /// Receiver endpoint
    pub dst: SocketAddrV4,
    /// Sequence number
    pub seq: u32,
    /// Acknowledgment number
    pub ack: u32,
    /// Flag byte, see [`tcp_flags`](super::tcp_flags)
    pub flags: u8,
    /// Advertised window
    pub window: u16,
    /// MSS option value; only emitted on SYN segments
    pub mss: Option<u16>,
    /// Segment payload, possibly empty
    pub payload: &'a [u8],
}

/// Builder for IPv4 TCP and UDP datagrams.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketBuilder;

impl PacketBuilder {
    /// Build an IPv4+TCP datagram.
    ///
    /// Payloads larger than [`MAX_TCP_PAYLOAD`] are truncated to fit; callers
    /// chunk by MSS long before that.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn tcp(segment: &TcpSegment<'_>) -> Vec<u8> {
        let payload = &segment.payload[..segment.payload.len().min(MAX_TCP_PAYLOAD)];
        let mss = segment
            .mss
            .filter(|_| segment.flags & super::tcp_flags::SYN != 0);

        let tcp_header_len = if mss.is_some() { TCP_HEADER_LEN + 4 } else { TCP_HEADER_LEN };
        let tcp_len = tcp_header_len + payload.len();
        let total_len = IPV4_HEADER_LEN + tcp_len;

        let mut packet = vec![0u8; total_len];
        write_ipv4_header(&mut packet, IPPROTO_TCP, segment.src, segment.dst, total_len);

        let tcp = &mut packet[IPV4_HEADER_LEN..];
        tcp[0..2].copy_from_slice(&segment.src.port().to_be_bytes());
        tcp[2..4].copy_from_slice(&segment.dst.port().to_be_bytes());
        tcp[4..8].copy_from_slice(&segment.seq.to_be_bytes());
        tcp[8..12].copy_from_slice(&segment.ack.to_be_bytes());
        tcp[12] = ((tcp_header_len / 4) as u8) << 4;
        tcp[13] = segment.flags;
        tcp[14..16].copy_from_slice(&segment.window.to_be_bytes());

        if let Some(mss) = mss {
            tcp[20] = 0x02; // kind
            tcp[21] = 0x04; // length
            tcp[22..24].copy_from_slice(&mss.to_be_bytes());
        }
        tcp[tcp_header_len..].copy_from_slice(payload);

        let checksum = transport_checksum(IPPROTO_TCP, *segment.src.ip(), *segment.dst.ip(), tcp);
        tcp[16..18].copy_from_slice(&checksum.to_be_bytes());

        packet
    }

    /// Build an IPv4+UDP datagram.
    ///
    /// Payloads larger than [`MAX_UDP_PAYLOAD`] are truncated to fit.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn udp(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
        let payload = &payload[..payload.len().min(MAX_UDP_PAYLOAD)];
        let udp_len = UDP_HEADER_LEN + payload.len();
        let total_len = IPV4_HEADER_LEN + udp_len;

        let mut packet = vec![0u8; total_len];
        write_ipv4_header(&mut packet, IPPROTO_UDP, src, dst, total_len);

        let udp = &mut packet[IPV4_HEADER_LEN..];
        udp[0..2].copy_from_slice(&src.port().to_be_bytes());
        udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
        udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
        udp[UDP_HEADER_LEN..].copy_from_slice(payload);

        // Zero means "no checksum" in UDP, so a computed zero is sent as all ones
        let checksum = match transport_checksum(IPPROTO_UDP, *src.ip(), *dst.ip(), udp) {
            0 => 0xFFFF,
            c => c,
        };
        udp[6..8].copy_from_slice(&checksum.to_be_bytes());

        packet
    }

    /// Rebuild a captured TCP datagram around a slice of its payload.
    ///
    /// IP and TCP headers, options included, are copied from `original`;
    /// the sequence number is advanced by `seq_offset` and the total length
    /// and both checksums are recomputed. Returns `None` for non-TCP views.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn reslice_tcp(original: &PacketView<'_>, payload: &[u8], seq_offset: u32) -> Option<Vec<u8>> {
        let tcp = original.tcp()?;
        let ip_len = original.header_len();
        let headers_len = ip_len + tcp.header_len;
        let payload = &payload[..payload.len().min(usize::from(u16::MAX) - headers_len)];
        let total_len = headers_len + payload.len();

        let mut packet = Vec::with_capacity(total_len);
        packet.extend_from_slice(&original.as_bytes()[..headers_len]);
        packet.extend_from_slice(payload);

        packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        packet[10..12].fill(0);
        let checksum = ipv4_header_checksum(&packet[..ip_len]);
        packet[10..12].copy_from_slice(&checksum.to_be_bytes());

        let segment = &mut packet[ip_len..];
        segment[4..8].copy_from_slice(&tcp.seq.wrapping_add(seq_offset).to_be_bytes());
        segment[16..18].fill(0);
        let checksum = transport_checksum(IPPROTO_TCP, original.src_ip(), original.dst_ip(), segment);
        segment[16..18].copy_from_slice(&checksum.to_be_bytes());

        Some(packet)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn write_ipv4_header(
    packet: &mut [u8],
    protocol: u8,
    src: SocketAddrV4,
    dst: SocketAddrV4,
    total_len: usize,
) {
    packet[0] = 0x45; // Version 4, IHL 5
    packet[1] = 0x00; // DSCP/ECN
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[4..6].copy_from_slice(&rand::random::<u16>().to_be_bytes());
    packet[6..8].copy_from_slice(&[0x40, 0x00]); // Don't fragment
    packet[8] = DEFAULT_TTL;
    packet[9] = protocol;
    packet[12..16].copy_from_slice(&src.ip().octets());
    packet[16..20].copy_from_slice(&dst.ip().octets());

    let checksum = ipv4_header_checksum(&packet[..IPV4_HEADER_LEN]);
    packet[10..12].copy_from_slice(&checksum.to_be_bytes());
}
