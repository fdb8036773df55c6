//! Virtual interface plumbing and the engine that drives it
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────── TunnelEngine ────────────────────┐
//! TUN fd ──> │ read loop ──> TcpFlowTable ──> Dialer ──> real TCP  │
//!            │           └─> UdpFlowTable ──> protected UDP socket │
//!            │                                                      │
//! TUN fd <── │ InterfaceWriter (one datagram per lock) <── sessions │
//!            └──────────────────────────────────────────────────────┘
//! ```

mod dialer;
mod engine;
mod fd;
mod interface;
mod protect;
mod stats;

pub use dialer::{create_udp_socket, BoxedStream, DialOptions, Dialer, DirectDialer, RealStream};
pub use engine::TunnelEngine;
pub use fd::FdInterface;
pub use interface::{InterfaceWriter, MemoryInterface, MemoryInterfaceHandle, VirtualInterface};
pub use protect::{FnProtector, MarkProtector, NoopProtector, SocketProtector};
pub use stats::{InterfaceCounters, TrafficStats};
