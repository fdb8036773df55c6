//! Privileged daemon channel
//!
//! In root mode interception is done by a separate daemon (netfilter queue
//! based) instead of the virtual interface. The engine talks to it over a
//! Unix stream socket with newline-delimited JSON; see [`protocol`] for the
//! message shapes.

mod client;
pub mod protocol;

pub use client::{DaemonClient, DEFAULT_TIMEOUT, MAX_REPLY_SIZE};
pub use protocol::{DaemonCommand, DaemonReply, DaemonSettings, DaemonStatus};
