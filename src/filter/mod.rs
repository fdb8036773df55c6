//! Kernel-queue interception adapter
//!
//! On rooted devices packets can be intercepted by a netfilter queue
//! instead of the virtual interface. The queue backend is external; this
//! module defines its callback shape and a [`DesyncFilter`] that drives the
//! same fragment planning as the relay path.

mod desync;
mod packet;

pub use desync::{DesyncFilter, FilterStats, MAX_TRACKED_FLOWS};
pub use packet::{FilterPacket, PacketFilterCallback, Verdict, VerdictSink};
