//! First-chunk desynchronization
//!
//! ```text
//! first chunk -> sniff -> whitelist? -> eligible? -> plan -> write/flush/sleep per fragment
//!                            |              |
//!                            +--------------+--> single unmodified write
//! ```
//!
//! Writes go to any [`AsyncWrite`], so the same code drives a real
//! `TcpStream` and the in-memory streams used by tests.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::plan::{plan, Fragment};
use crate::config::{DesyncMethod, DpiSettings};
use crate::sniff::{mix_host_case, sniff_first_chunk, SniffResult};

/// What to do with a first chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesyncAction {
    /// Not eligible; write unmodified
    Passthrough,
    /// Hostname matched the whitelist; write unmodified
    Whitelisted,
    /// Perturb with the given method
    Apply(DesyncMethod),
}

/// Decision plus the sniffed details that led to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesyncDecision {
    /// Sniffed protocol and hostname
    pub sniff: SniffResult,
    /// Chosen action
    pub action: DesyncAction,
}

/// How a first chunk was actually sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesyncOutcome {
    /// Single unmodified write, not eligible
    Passthrough,
    /// Single unmodified write, whitelisted host
    Whitelisted,
    /// Method applied in full
    Applied(DesyncMethod),
    /// Method failed before any real bytes went out; chunk resent unmodified
    FellBack(DesyncMethod),
}

impl DesyncOutcome {
    /// Whether the flow counts as desynchronized
    #[must_use]
    pub const fn is_desynced(self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Applies the configured desync method to the first chunk of a flow.
///
/// Holds one settings snapshot for the whole send, so a concurrent reload
/// cannot change the method halfway through a chunk.
#[derive(Debug, Clone)]
pub struct DesyncEngine {
    settings: Arc<DpiSettings>,
}

impl DesyncEngine {
    /// Create an engine bound to a settings snapshot
    pub fn new(settings: Arc<DpiSettings>) -> Self {
        Self { settings }
    }

    /// Settings snapshot in use
    pub fn settings(&self) -> &DpiSettings {
        &self.settings
    }

    /// Decide whether and how to perturb `chunk`.
    ///
    /// The whitelist always wins. HTTPS chunks are eligible only when they
    /// hold a `ClientHello`; HTTP chunks whenever HTTP desync is enabled.
    #[must_use]
    pub fn decide(&self, chunk: &[u8], is_https: bool) -> DesyncDecision {
        let sniff = sniff_first_chunk(chunk, is_https);

        if let Some(host) = sniff.domain() {
            if self.settings.is_whitelisted(host) {
                return DesyncDecision {
                    sniff,
                    action: DesyncAction::Whitelisted,
                };
            }
        }

        let eligible = if is_https {
            sniff.is_client_hello() && self.settings.desync_https
        } else {
            self.settings.desync_http
        };

        let action = if eligible {
            DesyncAction::Apply(self.settings.method)
        } else {
            DesyncAction::Passthrough
        };
        DesyncDecision { sniff, action }
    }

    /// Send the first chunk of a flow to `out`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error of the unmodified write when both the method
    /// and the fallback fail, or the method's error when real bytes were
    /// already sent and a resend would duplicate them.
    pub async fn send_first_chunk<W>(
        &self,
        out: &mut W,
        chunk: &[u8],
        is_https: bool,
    ) -> io::Result<DesyncOutcome>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let decision = self.decide(chunk, is_https);
        let host = decision.sniff.domain().unwrap_or("unknown");

        let method = match decision.action {
            DesyncAction::Passthrough => {
                write_flush(out, chunk).await?;
                return Ok(DesyncOutcome::Passthrough);
            }
            DesyncAction::Whitelisted => {
                debug!(host, "Whitelisted host, sending unmodified");
                write_flush(out, chunk).await?;
                return Ok(DesyncOutcome::Whitelisted);
            }
            DesyncAction::Apply(method) => method,
        };

        let mut payload = chunk.to_vec();
        if !is_https && self.settings.mix_host_case && mix_host_case(&mut payload) {
            debug!(host, "Host header case mixed");
        }

        let mut progress = Progress::default();
        match self.apply(out, method, &payload, &mut progress).await {
            Ok(()) => {
                info!(
                    %method,
                    host,
                    bytes = chunk.len(),
                    "{} applied for host {}",
                    method,
                    host
                );
                Ok(DesyncOutcome::Applied(method))
            }
            Err(e) if progress.real_bytes == 0 => {
                warn!(%method, host, error = %e, "Desync failed, sending unmodified");
                write_flush(out, chunk).await?;
                Ok(DesyncOutcome::FellBack(method))
            }
            Err(e) => {
                warn!(
                    %method,
                    host,
                    sent = progress.real_bytes,
                    error = %e,
                    "Desync failed mid-chunk"
                );
                Err(e)
            }
        }
    }

    async fn apply<W>(
        &self,
        out: &mut W,
        method: DesyncMethod,
        payload: &[u8],
        progress: &mut Progress,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let delay = self.settings.delay();

        if method == DesyncMethod::Fake {
            let decoy = self.settings.fake_payload();
            if decoy.is_empty() {
                debug!("Empty fake payload, skipping decoy");
            } else {
                for _ in 0..self.settings.fake_repeats() {
                    write_flush(out, &decoy).await?;
                    pause(delay).await;
                }
            }
        }

        for Fragment { range, delay_after } in plan(method, payload.len(), &self.settings) {
            let len = range.len();
            write_flush(out, &payload[range]).await?;
            progress.real_bytes += len;
            if delay_after {
                pause(delay).await;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Progress {
    real_bytes: usize,
}

async fn write_flush<W>(out: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    out.write_all(data).await?;
    out.flush().await
}

async fn pause(delay: std::time::Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
