//! Real-socket creation
//!
//! [`Dialer`] opens the TCP connection a session relays to. The production
//! [`DirectDialer`] protects the socket, applies the per-snapshot socket
//! options, and connects without blocking the runtime. Tests substitute an
//! in-memory dialer.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::protect::SocketProtector;
use crate::config::DpiSettings;
use crate::error::SessionError;

/// Byte stream to the real destination
pub trait RealStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> RealStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed real stream
pub type BoxedStream = Box<dyn RealStream>;

/// Socket options captured from the settings snapshot at dial time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialOptions {
    /// Connect timeout
    pub timeout: Duration,
    /// TCP_NODELAY
    pub nodelay: bool,
    /// SO_SNDBUF / SO_RCVBUF
    pub buffer_size: usize,
}

impl DialOptions {
    /// Options for a new socket under `settings`
    pub fn from_settings(settings: &DpiSettings, timeout: Duration) -> Self {
        Self {
            timeout,
            nodelay: settings.tcp_nodelay,
            buffer_size: settings.buffer_size,
        }
    }
}

/// Opens real TCP connections
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr`.
    ///
    /// # Errors
    ///
    /// `SessionError::ConnectTimeout` past `opts.timeout`,
    /// `SessionError::ConnectFailed` or `SessionError::Protect` otherwise.
    async fn connect_tcp(&self, addr: SocketAddrV4, opts: DialOptions) -> Result<BoxedStream, SessionError>;
}

/// Dialer using protected kernel sockets
pub struct DirectDialer {
    protector: Arc<dyn SocketProtector>,
}

impl DirectDialer {
    /// Create a dialer that protects every socket with `protector`
    pub fn new(protector: Arc<dyn SocketProtector>) -> Self {
        Self { protector }
    }

    fn create_socket(&self, addr: SocketAddrV4, opts: DialOptions) -> Result<Socket, SessionError> {
        let fail = |e: std::io::Error| SessionError::connect_failed(addr, e.to_string());

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(fail)?;
        self.protector.protect(socket.as_raw_fd())?;

        socket.set_nonblocking(true).map_err(fail)?;
        socket.set_nodelay(opts.nodelay).map_err(fail)?;
        socket
            .set_tcp_keepalive(
                &TcpKeepalive::new()
                    .with_time(Duration::from_secs(60))
                    .with_interval(Duration::from_secs(15)),
            )
            .map_err(fail)?;
        // Close with RST
        socket.set_linger(Some(Duration::ZERO)).map_err(fail)?;

        if let Err(e) = socket.set_send_buffer_size(opts.buffer_size) {
            warn!(%addr, "Failed to set SO_SNDBUF: {}", e);
        }
        if let Err(e) = socket.set_recv_buffer_size(opts.buffer_size) {
            warn!(%addr, "Failed to set SO_RCVBUF: {}", e);
        }
        Ok(socket)
    }
}

impl std::fmt::Debug for DirectDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectDialer").finish_non_exhaustive()
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn connect_tcp(&self, addr: SocketAddrV4, opts: DialOptions) -> Result<BoxedStream, SessionError> {
        let socket = self.create_socket(addr, opts)?;

        match socket.connect(&SocketAddr::V4(addr).into()) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(SessionError::connect_failed(addr, e.to_string())),
        }

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)
            .map_err(|e| SessionError::connect_failed(addr, e.to_string()))?;

        let connected = timeout(opts.timeout, async {
            stream
                .writable()
                .await
                .map_err(|e| SessionError::connect_failed(addr, e.to_string()))?;
            match stream.take_error() {
                Ok(None) => Ok(()),
                Ok(Some(e)) | Err(e) => Err(SessionError::connect_failed(addr, e.to_string())),
            }
        })
        .await;

        match connected {
            Ok(Ok(())) => {
                debug!(%addr, "Real connection established");
                Ok(Box::new(stream))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::ConnectTimeout {
                addr,
                timeout_secs: opts.timeout.as_secs(),
            }),
        }
    }
}

/// Create a protected, unconnected UDP socket bound to an ephemeral port.
///
/// # Errors
///
/// Returns `SessionError::Protect` if protection fails, `SessionError::Io`
/// for any other socket error.
pub fn create_udp_socket(
    protector: &dyn SocketProtector,
    buffer_size: usize,
) -> Result<UdpSocket, SessionError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    protector.protect(socket.as_raw_fd())?;
    socket.set_nonblocking(true)?;

    if let Err(e) = socket.set_send_buffer_size(buffer_size) {
        warn!("Failed to set UDP SO_SNDBUF: {}", e);
    }
    if let Err(e) = socket.set_recv_buffer_size(buffer_size) {
        warn!("Failed to set UDP SO_RCVBUF: {}", e);
    }

    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}
