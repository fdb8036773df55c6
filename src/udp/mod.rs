//! Userspace UDP NAT
//!
//! UDP needs no state machine: the first datagram for a key opens a real
//! socket, later ones reuse it, and an idle reader reaps the session.

mod table;

pub use table::{resolve_target, UdpFlowTable, UdpSession, UdpTableStats, DNS_PORT, QUIC_PORT};
