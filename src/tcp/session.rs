//! Per-flow TCP session
//!
//! ```text
//! SYN ──> SYN_RECEIVED ──SYN-ACK──> CONNECTING ──connect ok──> ESTABLISHED
//!                                       │                          │
//!                                       │ connect err / RST        │ FIN (either side)
//!                                       ▼                          ▼
//!                                     CLOSED <──────────────── FIN_WAIT
//! ```
//!
//! All mutable fields live behind one async lock. The lock is held across
//! "compute header, build datagram, write to interface" so that two
//! segments of one session can never be emitted with overlapping sequence
//! numbers.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex, MutexGuard, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::InterfaceError;
use crate::packet::{tcp_flags, FlowKey, PacketBuilder, TcpSegment};
use crate::tunnel::InterfaceWriter;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    /// SYN seen, SYN-ACK not yet sent
    SynReceived,
    /// SYN-ACK sent, real socket connecting
    Connecting,
    /// Real socket attached, relaying
    Established,
    /// FIN being answered
    FinWait,
    /// Terminal
    Closed,
}

impl TcpState {
    /// Upper-case state name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SynReceived => "SYN_RECEIVED",
            Self::Connecting => "CONNECTING",
            Self::Established => "ESTABLISHED",
            Self::FinWait => "FIN_WAIT",
            Self::Closed => "CLOSED",
        }
    }

    /// Whether client payload may still be accepted
    #[must_use]
    pub const fn accepts_data(self) -> bool {
        matches!(self, Self::SynReceived | Self::Connecting | Self::Established)
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable session fields, guarded by the session lock
#[derive(Debug)]
pub(crate) struct SessionInner {
    pub(crate) state: TcpState,
    /// Next sequence number we send
    pub(crate) my_seq: u32,
    /// Next sequence number we expect from the client
    pub(crate) my_ack: u32,
    /// Highest acknowledgment the client sent
    pub(crate) their_ack: u32,
    /// Pending FIFO toward the real socket; `None` once closed
    pub(crate) pending: Option<mpsc::Sender<Bytes>>,
}

/// One relayed TCP flow.
pub struct TcpSession {
    key: FlowKey,
    id: u64,
    peer_isn: u32,
    window: u16,
    inner: Mutex<SessionInner>,
    last_activity: SyncMutex<Instant>,
    cancel: CancellationToken,
    task: SyncMutex<Option<JoinHandle<()>>>,
    /// Slot in the table's session limit; moves to a replacement session
    permit: SyncMutex<Option<OwnedSemaphorePermit>>,
}

impl TcpSession {
    pub(crate) fn new(
        key: FlowKey,
        id: u64,
        peer_isn: u32,
        window: u16,
        pending: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            key,
            id,
            peer_isn,
            window,
            inner: Mutex::new(SessionInner {
                state: TcpState::SynReceived,
                my_seq: rand::random::<u32>() & 0x7FFF_FFFF,
                my_ack: peer_isn.wrapping_add(1),
                their_ack: 0,
                pending: Some(pending),
            }),
            last_activity: SyncMutex::new(Instant::now()),
            cancel,
            task: SyncMutex::new(None),
            permit: SyncMutex::new(None),
        }
    }

    /// Flow key (client to server direction)
    pub const fn key(&self) -> &FlowKey {
        &self.key
    }

    /// Session number, unique within a table
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Client's initial sequence number
    pub const fn peer_isn(&self) -> u32 {
        self.peer_isn
    }

    /// Destination port 443
    pub const fn is_https(&self) -> bool {
        self.key.dst_port == 443
    }

    /// Current state
    pub async fn state(&self) -> TcpState {
        self.inner.lock().await.state
    }

    /// Next sequence number expected from the client
    pub async fn expected_seq(&self) -> u32 {
        self.inner.lock().await.my_ack
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().await
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn set_task(&self, handle: JoinHandle<()>) {
        *self.task.lock() = Some(handle);
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }

    pub(crate) fn set_permit(&self, permit: OwnedSemaphorePermit) {
        *self.permit.lock() = Some(permit);
    }

    pub(crate) fn take_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.permit.lock().take()
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Build and write one segment to the client, then advance `my_seq`.
    ///
    /// Must be called with the session lock held (`inner` is the guard).
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) async fn emit(
        &self,
        inner: &mut SessionInner,
        writer: &InterfaceWriter,
        flags: u8,
        mss: Option<u16>,
        payload: &[u8],
    ) -> Result<(), InterfaceError> {
        let packet = PacketBuilder::tcp(&TcpSegment {
            src: self.key.dst(),
            dst: self.key.src(),
            seq: inner.my_seq,
            ack: inner.my_ack,
            flags,
            window: self.window,
            mss,
            payload,
        });
        writer.write(&packet).await?;

        let mut advance = payload.len() as u32;
        if flags & (tcp_flags::SYN | tcp_flags::FIN) != 0 {
            advance += 1;
        }
        inner.my_seq = inner.my_seq.wrapping_add(advance);
        Ok(())
    }
}

impl fmt::Debug for TcpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpSession")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
