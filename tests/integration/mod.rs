//! Integration tests for desync-tunnel
//!
//! # Test Organization
//!
//! - `desync_writes`: write sequence and timing of every desync method
//! - `tcp_flow`: TCP session lifecycle through the flow table
//! - `udp_flow`: UDP relay over loopback sockets
//! - `tunnel_engine`: frame dispatch, statistics and shutdown
//!
//! # Test Requirements
//!
//! No network access or privileges are needed. TCP destinations are
//! in-memory duplex streams handed out by [`GatedDialer`]; UDP tests use
//! loopback sockets.

pub mod desync_writes;
pub mod tcp_flow;
pub mod tunnel_engine;
pub mod udp_flow;

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, DuplexStream};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use desync_tunnel::config::{DpiSettings, LimitsConfig, SettingsStore};
use desync_tunnel::error::SessionError;
use desync_tunnel::packet::{PacketBuilder, PacketView, TcpHeader, TcpSegment};
use desync_tunnel::tcp::TcpFlowTable;
use desync_tunnel::tunnel::{
    BoxedStream, DialOptions, Dialer, InterfaceWriter, MemoryInterface, MemoryInterfaceHandle,
};

/// How long tests wait for an expected frame or stream
pub const WAIT: Duration = Duration::from_secs(2);

/// Client address used by every test
pub fn client(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 8, 0, 2), port)
}

/// Destination address
pub fn server(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), port)
}

/// Client to server TCP datagram
pub fn tcp_frame(src: SocketAddrV4, dst: SocketAddrV4, seq: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    PacketBuilder::tcp(&TcpSegment {
        src,
        dst,
        seq,
        ack: 0,
        flags,
        window: 65535,
        mss: None,
        payload,
    })
}

/// TCP header and payload of a frame written by the engine
pub fn parse_tcp(frame: &[u8]) -> (TcpHeader, Vec<u8>) {
    let view = PacketView::parse(frame).expect("engine wrote an unparseable frame");
    let tcp = view.tcp().expect("engine wrote a non-TCP frame");
    (tcp, view.payload().to_vec())
}

/// Minimal TLS `ClientHello` carrying `sni`
#[allow(clippy::cast_possible_truncation)]
pub fn client_hello(sni: &str) -> Vec<u8> {
    let name = sni.as_bytes();
    let mut ext = vec![0x00, 0x00];
    ext.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
    ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    ext.push(0x00);
    ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
    ext.extend_from_slice(name);

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x11; 32]);
    body.push(0x00); // session id
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
    body.extend_from_slice(&ext);

    let mut hello = vec![0x16, 0x03, 0x01];
    hello.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
    hello.push(0x01);
    hello.extend_from_slice(&[0x00, (body.len() >> 8) as u8, body.len() as u8]);
    hello.extend_from_slice(&body);
    hello
}

/// Poll `check` until it holds or [`WAIT`] elapses
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ============================================================================
// Gated in-memory dialer
// ============================================================================

/// Dialer whose connects block until the gate opens, then return one end of
/// a duplex pipe. The other end is delivered to [`DialerControl`].
pub struct GatedDialer {
    gate: watch::Receiver<bool>,
    accepted: mpsc::UnboundedSender<(SocketAddrV4, DuplexStream)>,
}

/// Test side of a [`GatedDialer`]
pub struct DialerControl {
    gate: watch::Sender<bool>,
    accepted: mpsc::UnboundedReceiver<(SocketAddrV4, DuplexStream)>,
}

impl DialerControl {
    /// Let pending and future connects complete
    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    /// Destination end of the next completed connect
    pub async fn next_stream(&mut self) -> (SocketAddrV4, DuplexStream) {
        tokio::time::timeout(WAIT, self.accepted.recv())
            .await
            .expect("no connect within timeout")
            .expect("dialer dropped")
    }
}

/// Create a dialer, initially open or closed
pub fn gated_dialer(open: bool) -> (Arc<GatedDialer>, DialerControl) {
    let (gate_tx, gate_rx) = watch::channel(open);
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
    (
        Arc::new(GatedDialer {
            gate: gate_rx,
            accepted: accepted_tx,
        }),
        DialerControl {
            gate: gate_tx,
            accepted: accepted_rx,
        },
    )
}

#[async_trait]
impl Dialer for GatedDialer {
    async fn connect_tcp(&self, addr: SocketAddrV4, _opts: DialOptions) -> Result<BoxedStream, SessionError> {
        let mut gate = self.gate.clone();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| SessionError::Closed)?;

        let (near, far) = tokio::io::duplex(64 * 1024);
        self.accepted
            .send((addr, far))
            .map_err(|_| SessionError::Closed)?;
        Ok(Box::new(near))
    }
}

// ============================================================================
// TCP table harness
// ============================================================================

/// Flow table wired to an in-memory interface and a gated dialer
pub struct TcpHarness {
    pub table: TcpFlowTable,
    pub iface: MemoryInterfaceHandle,
    pub dialer: DialerControl,
}

impl TcpHarness {
    /// Build with default limits
    pub fn new(settings: DpiSettings, open: bool) -> Self {
        Self::with_limits(settings, LimitsConfig::default(), open)
    }

    /// Build with custom limits
    pub fn with_limits(settings: DpiSettings, limits: LimitsConfig, open: bool) -> Self {
        let (iface, handle) = MemoryInterface::pair(64);
        let (dialer, control) = gated_dialer(open);
        let table = TcpFlowTable::new(
            Arc::new(InterfaceWriter::new(Arc::new(iface))),
            Arc::new(SettingsStore::new(settings)),
            dialer,
            limits,
            CancellationToken::new(),
        );
        Self {
            table,
            iface: handle,
            dialer: control,
        }
    }

    /// Feed one client frame to the table
    pub async fn send(&self, frame: &[u8]) {
        let view = PacketView::parse(frame).expect("test built an unparseable frame");
        self.table.process_packet(&view).await;
    }

    /// Next frame the table wrote, parsed
    pub async fn expect_frame(&mut self) -> (TcpHeader, Vec<u8>) {
        let frame = self
            .iface
            .recv_timeout(WAIT)
            .await
            .expect("expected a frame from the engine");
        parse_tcp(&frame)
    }

    /// Assert nothing is written within a short window
    pub async fn expect_silence(&mut self) {
        assert!(
            self.iface.recv_timeout(Duration::from_millis(100)).await.is_none(),
            "unexpected frame from the engine"
        );
    }
}

// ============================================================================
// Recording writer
// ============================================================================

/// One `poll_write` call
#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub data: Vec<u8>,
    pub at: Instant,
}

/// `AsyncWrite` that accepts everything and records each write
#[derive(Debug, Clone, Default)]
pub struct RecordingWriter {
    writes: Arc<Mutex<Vec<RecordedWrite>>>,
}

impl RecordingWriter {
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().clone()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.writes.lock().iter().map(|w| w.data.clone()).collect()
    }
}

impl AsyncWrite for RecordingWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.writes.lock().push(RecordedWrite {
            data: buf.to_vec(),
            at: Instant::now(),
        });
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
