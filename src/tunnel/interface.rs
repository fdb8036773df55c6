//! Virtual interface abstraction
//!
//! The engine reads raw IPv4 frames from a [`VirtualInterface`] and writes
//! raw IPv4 frames back to it. Every outbound frame goes through one shared
//! [`InterfaceWriter`], whose lock is held for exactly one datagram so that
//! frames from different sessions never interleave.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use crate::error::InterfaceError;

/// Duplex source and sink of raw IPv4 frames
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    /// Read one frame into `buf`.
    ///
    /// `Ok(0)` means the interface is gone and the read loop should stop.
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one complete frame.
    async fn write_packet(&self, packet: &[u8]) -> io::Result<()>;
}

/// Serialized writer shared by every session.
pub struct InterfaceWriter {
    iface: Arc<dyn VirtualInterface>,
    lock: Mutex<()>,
    packets_out: AtomicU64,
    bytes_out: AtomicU64,
}

impl InterfaceWriter {
    /// Wrap an interface
    pub fn new(iface: Arc<dyn VirtualInterface>) -> Self {
        Self {
            iface,
            lock: Mutex::new(()),
            packets_out: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    /// Write one datagram under the interface lock.
    ///
    /// # Errors
    ///
    /// Returns `InterfaceError::Write` if the underlying write fails.
    pub async fn write(&self, packet: &[u8]) -> Result<(), InterfaceError> {
        let _guard = self.lock.lock().await;
        self.iface
            .write_packet(packet)
            .await
            .map_err(InterfaceError::Write)?;
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(packet.len() as u64, Ordering::Relaxed);
        trace!(len = packet.len(), "Frame written to interface");
        Ok(())
    }

    /// Frames written so far
    pub fn packets_out(&self) -> u64 {
        self.packets_out.load(Ordering::Relaxed)
    }

    /// Bytes written so far
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for InterfaceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceWriter")
            .field("packets_out", &self.packets_out())
            .field("bytes_out", &self.bytes_out())
            .finish_non_exhaustive()
    }
}

/// Channel-backed interface.
///
/// Frames injected through the paired [`MemoryInterfaceHandle`] are returned
/// by `read_packet`; frames written by the engine appear on the handle.
/// Dropping the handle's sender ends the read loop.
pub struct MemoryInterface {
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// Test-side end of a [`MemoryInterface`]
pub struct MemoryInterfaceHandle {
    inbound: Option<mpsc::Sender<Vec<u8>>>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryInterface {
    /// Create an interface and its handle; `capacity` bounds injected frames
    pub fn pair(capacity: usize) -> (Self, MemoryInterfaceHandle) {
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            Self {
                inbound: Mutex::new(in_rx),
                outbound: out_tx,
            },
            MemoryInterfaceHandle {
                inbound: Some(in_tx),
                outbound: out_rx,
            },
        )
    }
}

#[async_trait]
impl VirtualInterface for MemoryInterface {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        self.outbound
            .send(packet.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "interface handle dropped"))
    }
}

impl MemoryInterfaceHandle {
    /// Inject a frame as if the client had sent it
    ///
    /// # Errors
    ///
    /// Returns `InterfaceError::Closed` once the interface is gone or the
    /// handle has been closed.
    pub async fn inject(&self, frame: Vec<u8>) -> Result<(), InterfaceError> {
        let sender = self.inbound.as_ref().ok_or(InterfaceError::Closed)?;
        sender.send(frame).await.map_err(|_| InterfaceError::Closed)
    }

    /// Next frame written by the engine
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.outbound.recv().await
    }

    /// Next frame written by the engine, or `None` after `wait`
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<Vec<u8>> {
        tokio::time::timeout(wait, self.outbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// Frame already written, without waiting
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.outbound.try_recv().ok()
    }

    /// Signal end of input; the engine's next read returns 0
    pub fn close(&mut self) {
        self.inbound = None;
    }
}
