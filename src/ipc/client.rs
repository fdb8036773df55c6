//! Client for the privileged daemon

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

use super::protocol::{DaemonCommand, DaemonReply, DaemonSettings, DaemonStatus};
use crate::error::IpcError;

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest reply line accepted
pub const MAX_REPLY_SIZE: u64 = 64 * 1024;

/// One-connection-per-request client for the daemon socket
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DaemonClient {
    /// Create a client for `socket_path`
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the request timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Socket path
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a command and read the reply line, if the command has one.
    ///
    /// # Errors
    ///
    /// `IpcError::Connection` if the socket cannot be reached,
    /// `IpcError::Timeout` past the request timeout, `IpcError::Protocol` for
    /// a missing or malformed reply.
    pub async fn send(&self, command: &DaemonCommand) -> Result<Option<DaemonReply>, IpcError> {
        timeout(self.timeout, self.exchange(command))
            .await
            .map_err(|_| IpcError::Timeout)?
    }

    async fn exchange(&self, command: &DaemonCommand) -> Result<Option<DaemonReply>, IpcError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| IpcError::Connection(format!("{}: {e}", self.socket_path.display())))?;

        let mut line =
            serde_json::to_vec(command).map_err(|e| IpcError::serialization(e.to_string()))?;
        line.push(b'\n');
        stream.write_all(&line).await?;
        stream.flush().await?;

        if !command.expects_reply() {
            return Ok(None);
        }

        let mut reader = BufReader::new(stream).take(MAX_REPLY_SIZE);
        let mut reply = String::new();
        let n = reader.read_line(&mut reply).await?;
        if n == 0 {
            return Err(IpcError::protocol("daemon closed the connection without a reply"));
        }
        debug!(reply = reply.trim_end(), "Daemon reply");

        serde_json::from_str(reply.trim_end())
            .map(Some)
            .map_err(|e| IpcError::protocol(format!("malformed reply: {e}")))
    }

    async fn request(&self, command: &DaemonCommand) -> Result<DaemonReply, IpcError> {
        let reply = self
            .send(command)
            .await?
            .ok_or_else(|| IpcError::protocol("no reply"))?;
        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(IpcError::protocol(
                reply.message.unwrap_or_else(|| "daemon reported an error".into()),
            ))
        }
    }

    /// Check the daemon is alive
    ///
    /// # Errors
    ///
    /// Any transport error from [`send`](Self::send).
    pub async fn ping(&self) -> Result<bool, IpcError> {
        let reply = self.request(&DaemonCommand::Ping).await?;
        Ok(reply.pong.unwrap_or(false))
    }

    /// Query running flag and counters
    ///
    /// # Errors
    ///
    /// Any transport error, or an error status from the daemon.
    pub async fn status(&self) -> Result<DaemonStatus, IpcError> {
        Ok(self.request(&DaemonCommand::Status).await?.to_status())
    }

    /// Start interception
    ///
    /// # Errors
    ///
    /// Any transport error, or an error status from the daemon.
    pub async fn start(&self, settings: DaemonSettings) -> Result<DaemonReply, IpcError> {
        self.request(&DaemonCommand::Start { settings }).await
    }

    /// Stop interception
    ///
    /// # Errors
    ///
    /// Any transport error, or an error status from the daemon.
    pub async fn stop(&self) -> Result<DaemonReply, IpcError> {
        self.request(&DaemonCommand::Stop).await
    }

    /// Push new settings
    ///
    /// # Errors
    ///
    /// Any transport error, or an error status from the daemon.
    pub async fn update_settings(&self, settings: DaemonSettings) -> Result<DaemonReply, IpcError> {
        self.request(&DaemonCommand::Settings(settings)).await
    }

    /// Ask the daemon to exit; no reply is awaited
    ///
    /// # Errors
    ///
    /// Any transport error from [`send`](Self::send).
    pub async fn exit(&self) -> Result<(), IpcError> {
        self.send(&DaemonCommand::Exit).await.map(|_| ())
    }
}
