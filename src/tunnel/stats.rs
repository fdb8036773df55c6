//! Aggregate traffic statistics

use serde::{Deserialize, Serialize};

use crate::tcp::TcpTableStats;
use crate::udp::UdpTableStats;

/// Engine-wide counters, refreshed every `stats_interval_frames` inbound
/// frames and on stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    /// Frames read from the interface
    pub packets_in: u64,
    /// Frames written to the interface
    pub packets_out: u64,
    /// Bytes read from the interface
    pub bytes_in: u64,
    /// Bytes written to the interface
    pub bytes_out: u64,
    /// Live TCP sessions
    pub tcp_sessions: u64,
    /// Live UDP sessions
    pub udp_sessions: u64,
    /// TCP flows whose first chunk was desynchronized
    pub desynced_flows: u64,
    /// UDP/443 datagrams dropped
    pub quic_dropped: u64,
    /// Frames that could not be parsed
    pub parse_errors: u64,
    /// Unix time of this snapshot in milliseconds
    pub timestamp_ms: u64,
}

impl TrafficStats {
    /// Fold the flow tables' counters into interface counters
    #[must_use]
    pub fn aggregate(
        interface: InterfaceCounters,
        tcp: &TcpTableStats,
        udp: &UdpTableStats,
    ) -> Self {
        Self {
            packets_in: interface.packets_in,
            packets_out: interface.packets_out,
            bytes_in: interface.bytes_in,
            bytes_out: interface.bytes_out,
            tcp_sessions: tcp.sessions,
            udp_sessions: udp.sessions,
            desynced_flows: tcp.desynced,
            quic_dropped: udp.quic_dropped,
            parse_errors: interface.parse_errors,
            timestamp_ms: now_ms(),
        }
    }

    /// Payload bytes relayed in both directions by both tables
    #[must_use]
    pub const fn relayed(tcp: &TcpTableStats, udp: &UdpTableStats) -> u64 {
        tcp.bytes_in + tcp.bytes_out + udp.bytes_in + udp.bytes_out
    }
}

/// Raw interface-level counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceCounters {
    /// Frames read
    pub packets_in: u64,
    /// Frames written
    pub packets_out: u64,
    /// Bytes read
    pub bytes_in: u64,
    /// Bytes written
    pub bytes_out: u64,
    /// Unparseable frames
    pub parse_errors: u64,
}

#[allow(clippy::cast_possible_truncation)]
fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
