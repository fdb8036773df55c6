//! Interface read loop and dispatch
//!
//! ```text
//! VirtualInterface::read_packet
//!        │
//!        ▼
//!   PacketView::try_parse ──err──> parse_errors++
//!        │
//!        ├── TCP ──> TcpFlowTable::process_packet
//!        ├── UDP ──> UdpFlowTable::process_packet
//!        └── other ─> dropped
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::dialer::Dialer;
use super::interface::{InterfaceWriter, VirtualInterface};
use super::protect::SocketProtector;
use super::stats::{InterfaceCounters, TrafficStats};
use crate::config::{DpiSettings, EngineConfig, SettingsStore};
use crate::error::{ConfigError, EngineError, InterfaceError};
use crate::packet::{ip_version, PacketView, Transport};
use crate::tcp::TcpFlowTable;
use crate::udp::UdpFlowTable;

/// Owns the interface read loop and both flow tables.
pub struct TunnelEngine {
    iface: Arc<dyn VirtualInterface>,
    writer: Arc<InterfaceWriter>,
    settings: Arc<SettingsStore>,
    tcp: TcpFlowTable,
    udp: UdpFlowTable,
    mtu: usize,
    stats_interval: u64,
    cancel: CancellationToken,
    running: AtomicBool,
    packets_in: AtomicU64,
    bytes_in: AtomicU64,
    parse_errors: AtomicU64,
    stats_tx: watch::Sender<TrafficStats>,
}

impl TunnelEngine {
    /// Wire an engine over `iface`.
    ///
    /// `dialer` opens real TCP connections; `protector` is applied to every
    /// real UDP socket (the dialer protects its own TCP sockets).
    pub fn new(
        iface: Arc<dyn VirtualInterface>,
        settings: Arc<SettingsStore>,
        config: &EngineConfig,
        dialer: Arc<dyn Dialer>,
        protector: Arc<dyn SocketProtector>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let writer = Arc::new(InterfaceWriter::new(Arc::clone(&iface)));

        let tcp = TcpFlowTable::new(
            Arc::clone(&writer),
            Arc::clone(&settings),
            dialer,
            config.limits.clone(),
            cancel.child_token(),
        );
        let udp = UdpFlowTable::new(
            Arc::clone(&writer),
            Arc::clone(&settings),
            protector,
            config.limits.udp_idle_timeout(),
            cancel.child_token(),
        );
        let (stats_tx, _) = watch::channel(TrafficStats::default());

        Self {
            iface,
            writer,
            settings,
            tcp,
            udp,
            mtu: config.tun.mtu,
            stats_interval: config.limits.stats_interval_frames.max(1),
            cancel,
            running: AtomicBool::new(false),
            packets_in: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            stats_tx,
        }
    }

    /// Read and dispatch frames until the interface closes or the engine is
    /// stopped.
    ///
    /// Does not tear sessions down; call [`stop`](Self::stop) for that.
    ///
    /// # Errors
    ///
    /// Returns `InterfaceError::Read` if the interface fails.
    pub async fn run(&self) -> Result<(), EngineError> {
        self.running.store(true, Ordering::SeqCst);
        info!(mtu = self.mtu, method = %self.settings.load().method, "Tunnel engine started");

        let mut buf = vec![0u8; self.mtu];
        let result = loop {
            let read = tokio::select! {
                () = self.cancel.cancelled() => break Ok(()),
                r = self.iface.read_packet(&mut buf) => r,
            };

            match read {
                Ok(0) => {
                    info!("Interface closed, stopping read loop");
                    break Ok(());
                }
                Ok(n) => self.process_frame(&buf[..n]).await,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Interface read failed, stopping read loop");
                    break Err(EngineError::Interface(InterfaceError::Read(e)));
                }
            }
        };

        self.running.store(false, Ordering::SeqCst);
        self.publish_stats();
        result
    }

    /// Parse and dispatch one frame.
    pub async fn process_frame(&self, frame: &[u8]) {
        let frames = self.packets_in.fetch_add(1, Ordering::Relaxed) + 1;
        self.bytes_in.fetch_add(frame.len() as u64, Ordering::Relaxed);

        if ip_version(frame) == Some(4) {
            match PacketView::try_parse(frame) {
                Ok(view) => match view.transport() {
                    Transport::Tcp(_) => self.tcp.process_packet(&view).await,
                    Transport::Udp(_) => self.udp.process_packet(&view),
                    Transport::Other(protocol) => {
                        trace!(protocol, "Unsupported protocol dropped");
                    }
                },
                Err(e) => {
                    self.parse_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(len = frame.len(), error = %e, "Unparseable frame dropped");
                }
            }
        } else {
            trace!(version = ?ip_version(frame), "Non-IPv4 frame dropped");
        }

        if frames % self.stats_interval == 0 {
            self.publish_stats();
        }
    }

    /// Validate and install a new settings snapshot.
    ///
    /// Live sessions keep the snapshot and socket options they started with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` and keeps the current snapshot
    /// if `settings` is invalid.
    pub fn reload_settings(&self, settings: DpiSettings) -> Result<(), ConfigError> {
        self.settings.try_reload(settings)
    }

    /// Current settings snapshot
    pub fn settings(&self) -> Arc<DpiSettings> {
        self.settings.load()
    }

    /// Fresh counter snapshot
    pub fn stats(&self) -> TrafficStats {
        TrafficStats::aggregate(
            InterfaceCounters {
                packets_in: self.packets_in.load(Ordering::Relaxed),
                packets_out: self.writer.packets_out(),
                bytes_in: self.bytes_in.load(Ordering::Relaxed),
                bytes_out: self.writer.bytes_out(),
                parse_errors: self.parse_errors.load(Ordering::Relaxed),
            },
            &self.tcp.stats(),
            &self.udp.stats(),
        )
    }

    /// Periodic counter snapshots
    pub fn subscribe_stats(&self) -> watch::Receiver<TrafficStats> {
        self.stats_tx.subscribe()
    }

    /// TCP flow table
    pub const fn tcp(&self) -> &TcpFlowTable {
        &self.tcp
    }

    /// UDP flow table
    pub const fn udp(&self) -> &UdpFlowTable {
        &self.udp
    }

    /// Whether the read loop is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the read loop, close every session and clear both tables.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tcp.shutdown().await;
        self.udp.shutdown();
        self.publish_stats();
        let stats = self.stats();
        info!(
            packets_in = stats.packets_in,
            packets_out = stats.packets_out,
            desynced = stats.desynced_flows,
            "Tunnel engine stopped"
        );
    }

    fn publish_stats(&self) {
        self.stats_tx.send_replace(self.stats());
    }
}

impl std::fmt::Debug for TunnelEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEngine")
            .field("mtu", &self.mtu)
            .field("running", &self.is_running())
            .field("tcp", &self.tcp)
            .field("udp", &self.udp)
            .finish_non_exhaustive()
    }
}
