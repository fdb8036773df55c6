//! desync-tunnel: userspace relay with first-segment desynchronization
//!
//! Raw IPv4 frames captured by a virtual interface are terminated locally:
//! TCP flows get a minimal server-side state machine and are relayed
//! through real (protected) sockets, UDP datagrams are forwarded through
//! per-flow real sockets. The first chunk of each HTTP(S) flow is split,
//! reordered or preceded by a decoy so that in-path DPI cannot match the
//! hostname in a single segment.
//!
//! # Architecture
//!
//! ```text
//! app → virtual interface → TunnelEngine ─┬─ TcpFlowTable → DesyncEngine → real TCP socket → server
//!          ▲                              └─ UdpFlowTable ─────────────────→ real UDP socket → server
//!          └──────────── PacketBuilder ◄──────────── replies ◄──────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use desync_tunnel::config::{EngineConfig, SettingsStore};
//! use desync_tunnel::tunnel::{DirectDialer, MemoryInterface, NoopProtector, TunnelEngine};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::default();
//! let settings = Arc::new(SettingsStore::new(config.dpi.clone()));
//! let protector = Arc::new(NoopProtector);
//! let (iface, _handle) = MemoryInterface::pair(256);
//!
//! let engine = TunnelEngine::new(
//!     Arc::new(iface),
//!     settings,
//!     &config,
//!     Arc::new(DirectDialer::new(protector.clone())),
//!     protector,
//! );
//! engine.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: File configuration and hot-swappable DPI settings
//! - [`desync`]: Fragment planning and first-chunk writes
//! - [`error`]: Error types
//! - [`filter`]: Kernel-queue verdict callback adapter
//! - [`ipc`]: Privileged daemon client
//! - [`packet`]: IPv4/TCP/UDP parsing and construction
//! - [`sniff`]: TLS SNI and HTTP Host extraction
//! - [`tcp`]: TCP session state machine and flow table
//! - [`tunnel`]: Interface loop, real sockets, statistics
//! - [`udp`]: UDP flow table

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod desync;
pub mod error;
pub mod filter;
pub mod ipc;
pub mod packet;
pub mod sniff;
pub mod tcp;
pub mod tunnel;
pub mod udp;

// Re-export commonly used types at the crate root
pub use config::{DesyncMethod, DpiSettings, EngineConfig, SettingsStore};
pub use desync::{DesyncEngine, DesyncOutcome};
pub use error::{ConfigError, EngineError, InterfaceError, IpcError, PacketError, SessionError};
pub use filter::{DesyncFilter, FilterPacket, PacketFilterCallback, Verdict, VerdictSink};
pub use ipc::{DaemonClient, DaemonCommand, DaemonReply};
pub use packet::{FlowKey, PacketBuilder, PacketView};
pub use sniff::{sniff_first_chunk, Protocol, SniffResult};
pub use tcp::{TcpFlowTable, TcpSession, TcpState};
pub use tunnel::{TrafficStats, TunnelEngine, VirtualInterface};
pub use udp::UdpFlowTable;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
