//! Userspace TCP termination
//!
//! Each client connection seen on the virtual interface is terminated
//! locally by a [`TcpSession`] and relayed over a real socket opened by the
//! configured [`Dialer`](crate::tunnel::Dialer). No retransmission,
//! congestion control or reordering is modelled; the client is local and
//! well-behaved.

mod session;
mod table;

pub use session::{TcpSession, TcpState};
pub use table::{TcpFlowTable, TcpTableStats};
