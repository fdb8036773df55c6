//! UDP flow table
//!
//! A session is a protected, unconnected real socket plus a reader task.
//! Datagrams from the client are sent with a non-blocking `try_send_to`
//! straight from the dispatch path; replies are wrapped by
//! [`PacketBuilder::udp`] with the client's original destination as their
//! source, so redirected DNS stays transparent.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{DpiSettings, SettingsStore};
use crate::packet::{FlowKey, PacketBuilder, PacketView, MAX_UDP_PAYLOAD};
use crate::tunnel::{create_udp_socket, InterfaceWriter, SocketProtector};

/// Destination port treated as QUIC
pub const QUIC_PORT: u16 = 443;

/// Destination port treated as DNS
pub const DNS_PORT: u16 = 53;

/// Counters exposed by the UDP table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpTableStats {
    /// Live sessions
    pub sessions: u64,
    /// Payload bytes client to destination
    pub bytes_in: u64,
    /// Payload bytes destination to client
    pub bytes_out: u64,
    /// Datagrams dropped by the QUIC block
    pub quic_dropped: u64,
    /// Sessions whose DNS traffic was redirected
    pub dns_redirected: u64,
}

/// One relayed UDP flow
pub struct UdpSession {
    key: FlowKey,
    target: SocketAddrV4,
    socket: UdpSocket,
    last_activity: SyncMutex<Instant>,
    cancel: CancellationToken,
}

impl UdpSession {
    /// Flow key (client to destination)
    pub const fn key(&self) -> &FlowKey {
        &self.key
    }

    /// Where datagrams are actually sent
    pub const fn target(&self) -> SocketAddrV4 {
        self.target
    }

    /// Local address of the real socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

impl std::fmt::Debug for UdpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSession")
            .field("key", &self.key)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

struct UdpShared {
    sessions: DashMap<FlowKey, Arc<UdpSession>>,
    writer: Arc<InterfaceWriter>,
    settings: Arc<SettingsStore>,
    protector: Arc<dyn SocketProtector>,
    idle_timeout: Duration,
    cancel: CancellationToken,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    quic_dropped: AtomicU64,
    dns_redirected: AtomicU64,
}

/// Table of relayed UDP flows.
#[derive(Clone)]
pub struct UdpFlowTable {
    shared: Arc<UdpShared>,
}

/// Real destination for a datagram addressed to `dst`.
///
/// Port 53 goes to the custom resolver when redirection is enabled.
pub fn resolve_target(dst: SocketAddrV4, settings: &DpiSettings) -> SocketAddrV4 {
    if dst.port() == DNS_PORT {
        if let Some(resolver) = settings.dns_redirect() {
            return resolver;
        }
    }
    dst
}

impl UdpFlowTable {
    /// Create a table; `cancel` stops every reader task.
    pub fn new(
        writer: Arc<InterfaceWriter>,
        settings: Arc<SettingsStore>,
        protector: Arc<dyn SocketProtector>,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(UdpShared {
                sessions: DashMap::new(),
                writer,
                settings,
                protector,
                idle_timeout,
                cancel,
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                quic_dropped: AtomicU64::new(0),
                dns_redirected: AtomicU64::new(0),
            }),
        }
    }

    /// Handle one inbound UDP datagram.
    pub fn process_packet(&self, view: &PacketView<'_>) {
        let Some(key) = view.flow_key().filter(FlowKey::is_udp) else {
            return;
        };
        let shared = &self.shared;
        let settings = shared.settings.load();

        if key.dst_port == QUIC_PORT && settings.block_quic {
            shared.quic_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(flow = %key, "QUIC datagram dropped");
            return;
        }

        let session = match shared.sessions.get(&key) {
            Some(entry) => Arc::clone(entry.value()),
            None => match self.open(key, &settings) {
                Some(session) => session,
                None => return,
            },
        };

        let payload = view.payload();
        match session.socket.try_send_to(payload, SocketAddr::V4(session.target)) {
            Ok(n) => {
                session.touch();
                shared.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                trace!(flow = %key, len = n, "UDP datagram sent");
            }
            Err(e) => debug!(flow = %key, error = %e, "UDP send failed, datagram dropped"),
        }
    }

    fn open(&self, key: FlowKey, settings: &DpiSettings) -> Option<Arc<UdpSession>> {
        let shared = &self.shared;
        let socket = match create_udp_socket(shared.protector.as_ref(), settings.buffer_size) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(flow = %key, error = %e, "Failed to open UDP socket");
                return None;
            }
        };

        let target = resolve_target(key.dst(), settings);
        if target != key.dst() {
            shared.dns_redirected.fetch_add(1, Ordering::Relaxed);
            debug!(flow = %key, resolver = %target, "DNS redirected");
        }

        let session = Arc::new(UdpSession {
            key,
            target,
            socket,
            last_activity: SyncMutex::new(Instant::now()),
            cancel: shared.cancel.child_token(),
        });
        shared.sessions.insert(key, Arc::clone(&session));
        debug!(flow = %key, "UDP session created");

        tokio::spawn(read_replies(Arc::clone(shared), Arc::clone(&session)));
        Some(session)
    }

    /// Session for `key`, if live
    pub fn session(&self, key: &FlowKey) -> Option<Arc<UdpSession>> {
        self.shared
            .sessions
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Whether no session is live
    pub fn is_empty(&self) -> bool {
        self.shared.sessions.is_empty()
    }

    /// Counter snapshot
    pub fn stats(&self) -> UdpTableStats {
        let shared = &self.shared;
        UdpTableStats {
            sessions: shared.sessions.len() as u64,
            bytes_in: shared.bytes_in.load(Ordering::Relaxed),
            bytes_out: shared.bytes_out.load(Ordering::Relaxed),
            quic_dropped: shared.quic_dropped.load(Ordering::Relaxed),
            dns_redirected: shared.dns_redirected.load(Ordering::Relaxed),
        }
    }

    /// Stop every reader and empty the table
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.sessions.clear();
        debug!("UDP flow table shut down");
    }
}

impl std::fmt::Debug for UdpFlowTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpFlowTable")
            .field("sessions", &self.shared.sessions.len())
            .finish_non_exhaustive()
    }
}

async fn read_replies(shared: Arc<UdpShared>, session: Arc<UdpSession>) {
    let key = session.key;
    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];

    loop {
        let received = tokio::select! {
            () = session.cancel.cancelled() => break,
            r = timeout(shared.idle_timeout, session.socket.recv_from(&mut buf)) => r,
        };

        match received {
            Err(_) => {
                if session.idle_for() >= shared.idle_timeout {
                    debug!(flow = %key, "UDP session idle, reaping");
                    break;
                }
            }
            Ok(Ok((n, from))) => {
                if from != SocketAddr::V4(session.target) {
                    trace!(flow = %key, %from, "Datagram from unexpected peer ignored");
                    continue;
                }
                session.touch();
                // Reply as the address the client originally asked for
                let packet = PacketBuilder::udp(key.dst(), key.src(), &buf[..n]);
                if let Err(e) = shared.writer.write(&packet).await {
                    debug!(flow = %key, error = %e, "Failed to write UDP reply");
                    break;
                }
                shared.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                debug!(flow = %key, error = %e, "UDP receive failed");
                break;
            }
        }
    }

    shared
        .sessions
        .remove_if(&key, |_, current| Arc::ptr_eq(current, &session));
    trace!(flow = %key, "UDP session removed");
}
