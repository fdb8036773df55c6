//! Internet checksum helpers (RFC 1071)

use std::net::Ipv4Addr;

/// Add `data` to a running one's-complement sum as big-endian 16-bit words.
///
/// An odd trailing byte is padded with zero.
pub fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([pair[0], pair[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([*last, 0])));
    }
    sum
}

/// Fold a 32-bit sum to 16 bits and complement it.
#[allow(clippy::cast_possible_truncation)]
pub fn finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// IPv4 header checksum. The checksum field must be zero.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    finish(sum_words(header, 0))
}

/// TCP/UDP checksum over the IPv4 pseudo-header plus `segment`.
///
/// The checksum field inside `segment` must be zero.
#[allow(clippy::cast_possible_truncation)]
pub fn transport_checksum(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum = sum_words(&src.octets(), 0);
    sum = sum_words(&dst.octets(), sum);
    sum = sum.wrapping_add(u32::from(protocol));
    sum = sum.wrapping_add(segment.len() as u32);
    finish(sum_words(segment, sum))
}

/// True if the IPv4 header and the TCP/UDP checksum of `packet` both verify.
///
/// A zero UDP checksum means "not computed" and is accepted.
pub fn verify_ipv4(packet: &[u8]) -> bool {
    if packet.len() < 20 {
        return false;
    }
    let ihl = usize::from(packet[0] & 0x0F) * 4;
    if ihl < 20 || packet.len() < ihl || finish(sum_words(&packet[..ihl], 0)) != 0 {
        return false;
    }

    let protocol = packet[9];
    let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    let segment = &packet[ihl..];

    if protocol == super::IPPROTO_UDP && segment.len() >= 8 && segment[6..8] == [0, 0] {
        return true;
    }

    transport_checksum(protocol, src, dst, segment) == 0
}
