//! TCP flow table
//!
//! The dispatch path ([`TcpFlowTable::process_packet`]) only touches the
//! session map, the session lock and the interface writer. Connecting and
//! relaying run on one spawned task per session, so a slow destination never
//! stalls the interface read loop.
//!
//! Pending data: each session owns a bounded FIFO of `pending_chunks`
//! entries. The dispatch path only ever `try_send`s into it; a segment that
//! does not fit is dropped *without* being acknowledged, so the client's TCP
//! retransmits it later.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::session::{TcpSession, TcpState};
use crate::config::{LimitsConfig, SettingsStore};
use crate::desync::DesyncEngine;
use crate::error::SessionError;
use crate::packet::{tcp_flags, FlowKey, PacketBuilder, PacketView, TcpHeader, TcpSegment};
use crate::tunnel::{BoxedStream, DialOptions, Dialer, InterfaceWriter};

/// Read buffer for real sockets
const READ_BUF_SIZE: usize = 16 * 1024;

/// Counters exposed by the TCP table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpTableStats {
    /// Live sessions
    pub sessions: u64,
    /// Sessions created since start
    pub sessions_total: u64,
    /// Payload bytes relayed client to destination
    pub bytes_in: u64,
    /// Payload bytes relayed destination to client
    pub bytes_out: u64,
    /// Flows whose first chunk was desynchronized
    pub desynced: u64,
    /// SYNs rejected at the session limit
    pub rejected: u64,
}

struct TcpShared {
    sessions: DashMap<FlowKey, Arc<TcpSession>>,
    writer: Arc<InterfaceWriter>,
    settings: Arc<SettingsStore>,
    dialer: Arc<dyn Dialer>,
    limits: LimitsConfig,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    next_id: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    desynced: AtomicU64,
    rejected: AtomicU64,
}

/// Table of relayed TCP flows, keyed by client-to-server [`FlowKey`].
#[derive(Clone)]
pub struct TcpFlowTable {
    shared: Arc<TcpShared>,
}

/// How the relay phase of a session ended
enum RelayEnd {
    /// Destination closed its side
    Eof,
    /// Real socket read failed
    ReadError(io::Error),
    /// No traffic in either direction for the idle timeout
    Idle,
    /// Writing to the real socket failed
    WriteError(io::Error),
    /// Client finished and every buffered chunk was written
    Drained,
    /// Session closed or cancelled from outside
    Closed,
}

impl TcpFlowTable {
    /// Create a table.
    ///
    /// `cancel` is the parent of every session's token; cancelling it stops
    /// all sessions.
    pub fn new(
        writer: Arc<InterfaceWriter>,
        settings: Arc<SettingsStore>,
        dialer: Arc<dyn Dialer>,
        limits: LimitsConfig,
        cancel: CancellationToken,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(limits.max_tcp_sessions));
        Self {
            shared: Arc::new(TcpShared {
                sessions: DashMap::new(),
                writer,
                settings,
                dialer,
                limits,
                permits,
                cancel,
                next_id: AtomicU64::new(1),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                desynced: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
        }
    }

    /// Handle one inbound TCP datagram.
    ///
    /// Order of evaluation: RST, SYN, payload, FIN, pure ACK. Segments for
    /// unknown keys are ignored.
    pub async fn process_packet(&self, view: &PacketView<'_>) {
        let Some(tcp) = view.tcp() else {
            return;
        };
        let Some(key) = view.flow_key() else {
            return;
        };

        trace!(flow = %key, flags = %tcp.flags_string(), len = view.payload().len(), "TCP segment");

        if tcp.is_rst() {
            if let Some(session) = self.session(&key) {
                debug!(flow = %key, "Client reset");
                self.shared.cancel_session(&session).await;
            }
            return;
        }

        if tcp.is_syn() {
            self.handle_syn(key, &tcp).await;
            return;
        }

        let Some(session) = self.session(&key) else {
            trace!(flow = %key, "Segment for unknown session ignored");
            return;
        };

        let payload = view.payload();
        if !payload.is_empty() {
            self.handle_data(&session, &tcp, payload).await;
        }

        if tcp.is_fin() {
            self.handle_fin(&session, &tcp, payload.len()).await;
        } else if payload.is_empty() && tcp.is_ack() {
            // Pure ACKs never provoke a reply
            session.lock().await.their_ack = tcp.ack;
        }
    }

    /// Session for `key`, if live
    pub fn session(&self, key: &FlowKey) -> Option<Arc<TcpSession>> {
        self.shared
            .sessions
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `key` has a live session
    pub fn contains(&self, key: &FlowKey) -> bool {
        self.shared.sessions.contains_key(key)
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
    pub fn stats(&self) -> TcpTableStats {
        let shared = &self.shared;
        TcpTableStats {
            sessions: shared.sessions.len() as u64,
            sessions_total: shared.next_id.load(Ordering::Relaxed) - 1,
            bytes_in: shared.bytes_in.load(Ordering::Relaxed),
            bytes_out: shared.bytes_out.load(Ordering::Relaxed),
            desynced: shared.desynced.load(Ordering::Relaxed),
            rejected: shared.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stop every session and empty the table.
    ///
    /// Cancels the table token, closes each session and waits for its task
    /// to release the real socket.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();

        let sessions: Vec<Arc<TcpSession>> = self
            .shared
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.shared.sessions.clear();

        for session in sessions {
            {
                let mut inner = session.lock().await;
                inner.state = TcpState::Closed;
                inner.pending = None;
            }
            if let Some(handle) = session.take_task() {
                let _ = handle.await;
            }
        }
        debug!("TCP flow table shut down");
    }

    async fn handle_syn(&self, key: FlowKey, tcp: &TcpHeader) {
        let shared = &self.shared;

        // A new SYN for a live key replaces the old session; its task must
        // release the old socket before the new one dials. The replacement
        // inherits the old slot in the session limit.
        let (predecessor, inherited) = match shared.sessions.remove(&key) {
            Some((_, old)) => {
                debug!(flow = %key, id = old.id(), "Replacing session on new SYN");
                old.cancel_token().cancel();
                {
                    let mut inner = old.lock().await;
                    inner.state = TcpState::Closed;
                    inner.pending = None;
                }
                (old.take_task(), old.take_permit())
            }
            None => (None, None),
        };

        let permit = match inherited {
            Some(permit) => permit,
            None => {
                let Ok(permit) = Arc::clone(&shared.permits).try_acquire_owned() else {
                    shared.rejected.fetch_add(1, Ordering::Relaxed);
                    let err = SessionError::PoolExhausted {
                        limit: shared.limits.max_tcp_sessions,
                    };
                    warn!(flow = %key, "SYN rejected: {}", err);
                    shared.reset_unknown(&key, tcp).await;
                    return;
                };
                permit
            }
        };

        let (tx, rx) = mpsc::channel(shared.limits.pending_chunks.max(1));
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(TcpSession::new(
            key,
            id,
            tcp.seq,
            shared.limits.window,
            tx,
            shared.cancel.child_token(),
        ));
        session.set_permit(permit);
        shared.sessions.insert(key, Arc::clone(&session));

        {
            let mut inner = session.lock().await;
            let syn_ack = tcp_flags::SYN | tcp_flags::ACK;
            let mss = u16::try_from(shared.limits.mss).ok();
            if let Err(e) = session.emit(&mut inner, &shared.writer, syn_ack, mss, b"").await {
                warn!(flow = %key, error = %e, "Failed to send SYN-ACK");
                drop(inner);
                drop(session.take_permit());
                shared.finish(&session).await;
                return;
            }
            inner.state = TcpState::Connecting;
        }
        debug!(flow = %key, id, "Session created");

        let handle = tokio::spawn(run_session(
            Arc::clone(shared),
            Arc::clone(&session),
            rx,
            predecessor,
        ));
        session.set_task(handle);
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    async fn handle_data(&self, session: &Arc<TcpSession>, tcp: &TcpHeader, payload: &[u8]) {
        let shared = &self.shared;
        let mut inner = session.lock().await;
        if !inner.state.accepts_data() {
            return;
        }

        // Distance of this segment's first byte from the next one we expect
        let offset = tcp.seq.wrapping_sub(inner.my_ack) as i32;
        let data = if offset == 0 {
            payload
        } else if offset < 0 && (offset.unsigned_abs() as usize) < payload.len() {
            &payload[offset.unsigned_abs() as usize..]
        } else {
            // Old retransmission or a gap: re-acknowledge what we have
            trace!(flow = %session.key(), offset, "Out-of-window segment");
            if let Err(e) = session
                .emit(&mut inner, &shared.writer, tcp_flags::ACK, None, b"")
                .await
            {
                debug!(flow = %session.key(), error = %e, "Failed to send ACK");
            }
            return;
        };

        let Some(pending) = inner.pending.as_ref() else {
            return;
        };
        match pending.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(
                    flow = %session.key(),
                    state = %inner.state,
                    len = data.len(),
                    "Pending buffer full, segment left unacknowledged"
                );
                return;
            }
            Err(TrySendError::Closed(_)) => return,
        }

        session.touch();
        inner.my_ack = inner.my_ack.wrapping_add(data.len() as u32);
        if let Err(e) = session
            .emit(&mut inner, &shared.writer, tcp_flags::ACK, None, b"")
            .await
        {
            debug!(flow = %session.key(), error = %e, "Failed to send ACK");
        }
    }

    /// Answer a client FIN.
    ///
    /// The FIN is only consumed once every byte before it has been accepted;
    /// otherwise nothing is acknowledged and the client retransmits. A FIN
    /// that arrives while the real socket is still connecting leaves the
    /// session in `FIN_WAIT` so the connect can deliver what was buffered.
    #[allow(clippy::cast_possible_truncation)]
    async fn handle_fin(&self, session: &Arc<TcpSession>, tcp: &TcpHeader, payload_len: usize) {
        let shared = &self.shared;
        {
            let mut inner = session.lock().await;
            if !inner.state.accepts_data() {
                return;
            }
            if tcp.seq.wrapping_add(payload_len as u32) != inner.my_ack {
                trace!(flow = %session.key(), seq = tcp.seq, "FIN ahead of accepted data");
                return;
            }
            let connecting = inner.state != TcpState::Established;
            inner.my_ack = inner.my_ack.wrapping_add(1);
            inner.state = TcpState::FinWait;
            let fin_ack = tcp_flags::FIN | tcp_flags::ACK;
            if let Err(e) = session.emit(&mut inner, &shared.writer, fin_ack, None, b"").await {
                debug!(flow = %session.key(), error = %e, "Failed to send FIN-ACK");
            }
            // Dropping the sender lets the relay drain what was already
            // acknowledged, then end
            if !connecting {
                inner.state = TcpState::Closed;
            }
            inner.pending = None;
        }
        shared.remove(session);
        debug!(flow = %session.key(), "Client closed session");
    }
}

/// Returns the session's slot in the session limit when its task ends
struct PermitRelease<'a>(&'a TcpSession);

impl Drop for PermitRelease<'_> {
    fn drop(&mut self) {
        drop(self.0.take_permit());
    }
}

impl std::fmt::Debug for TcpFlowTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpFlowTable")
            .field("sessions", &self.shared.sessions.len())
            .finish_non_exhaustive()
    }
}

impl TcpShared {
    /// Remove `session` from the map unless a replacement took its key
    fn remove(&self, session: &Arc<TcpSession>) {
        self.sessions
            .remove_if(session.key(), |_, current| Arc::ptr_eq(current, session));
    }

    /// Mark closed and remove
    async fn finish(&self, session: &Arc<TcpSession>) {
        {
            let mut inner = session.lock().await;
            inner.state = TcpState::Closed;
            inner.pending = None;
        }
        self.remove(session);
    }

    /// Close from outside the session task (client RST)
    async fn cancel_session(&self, session: &Arc<TcpSession>) {
        session.cancel_token().cancel();
        self.finish(session).await;
    }

    /// Send RST-ACK to the client unless the session is already closed
    async fn reset(&self, session: &Arc<TcpSession>) {
        let mut inner = session.lock().await;
        if inner.state == TcpState::Closed {
            return;
        }
        let rst = tcp_flags::RST | tcp_flags::ACK;
        if let Err(e) = session.emit(&mut inner, &self.writer, rst, None, b"").await {
            debug!(flow = %session.key(), error = %e, "Failed to send RST");
        }
        inner.state = TcpState::Closed;
        inner.pending = None;
    }

    /// RST for a SYN we refuse to track
    async fn reset_unknown(&self, key: &FlowKey, tcp: &TcpHeader) {
        let packet = PacketBuilder::tcp(&TcpSegment {
            src: key.dst(),
            dst: key.src(),
            seq: 0,
            ack: tcp.seq.wrapping_add(1),
            flags: tcp_flags::RST | tcp_flags::ACK,
            window: 0,
            mss: None,
            payload: b"",
        });
        if let Err(e) = self.writer.write(&packet).await {
            debug!(flow = %key, error = %e, "Failed to send RST");
        }
    }

    /// Write a destination chunk to the client as MSS-sized segments
    async fn send_to_client(&self, session: &TcpSession, data: &[u8]) -> Result<(), SessionError> {
        let mut inner = session.lock().await;
        if inner.state != TcpState::Established {
            return Err(SessionError::Closed);
        }
        let flags = tcp_flags::PSH | tcp_flags::ACK;
        for chunk in data.chunks(self.limits.mss.max(1)) {
            session
                .emit(&mut inner, &self.writer, flags, None, chunk)
                .await
                .map_err(|e| SessionError::Io(io::Error::new(io::ErrorKind::BrokenPipe, e)))?;
        }
        self.bytes_out.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Connect, relay, tear down. Runs on its own task.
async fn run_session(
    shared: Arc<TcpShared>,
    session: Arc<TcpSession>,
    rx: mpsc::Receiver<Bytes>,
    predecessor: Option<JoinHandle<()>>,
) {
    let _release = PermitRelease(&session);
    let key = *session.key();
    let cancel = session.cancel_token().clone();

    if let Some(previous) = predecessor {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = previous => {}
        }
    }

    let opts = DialOptions::from_settings(&shared.settings.load(), shared.limits.connect_timeout());
    let connected = tokio::select! {
        () = cancel.cancelled() => {
            shared.finish(&session).await;
            return;
        }
        result = shared.dialer.connect_tcp(key.dst(), opts) => result,
    };

    let stream = match connected {
        Ok(stream) => stream,
        Err(e) => {
            warn!(flow = %key, error = %e, "Real connect failed");
            shared.reset(&session).await;
            shared.remove(&session);
            return;
        }
    };

    let draining = {
        let mut inner = session.lock().await;
        match inner.state {
            TcpState::Connecting => {
                inner.state = TcpState::Established;
                false
            }
            TcpState::FinWait => true,
            _ => {
                // Closed while connecting; the stream is dropped here
                drop(inner);
                shared.remove(&session);
                return;
            }
        }
    };

    if draining {
        debug!(flow = %key, "Client finished while connecting, flushing buffered data");
        let (_, write_half) = tokio::io::split(stream);
        let end = tokio::select! {
            () = cancel.cancelled() => RelayEnd::Closed,
            end = write_loop(&shared, &session, rx, write_half) => end,
        };
        if let RelayEnd::WriteError(e) = end {
            debug!(flow = %key, error = %e, "Flush after client FIN failed");
        }
        shared.finish(&session).await;
        return;
    }

    session.touch();
    debug!(flow = %key, id = session.id(), "Session established");

    let end = relay(&shared, &session, stream, rx, &cancel).await;

    match end {
        RelayEnd::Eof => {
            debug!(flow = %key, "Destination closed");
            let mut inner = session.lock().await;
            if inner.state == TcpState::Established {
                inner.state = TcpState::FinWait;
                let fin_ack = tcp_flags::FIN | tcp_flags::ACK;
                if let Err(e) = session.emit(&mut inner, &shared.writer, fin_ack, None, b"").await {
                    debug!(flow = %key, error = %e, "Failed to send FIN-ACK");
                }
            }
        }
        RelayEnd::ReadError(e) | RelayEnd::WriteError(e) => {
            debug!(flow = %key, error = %e, "Real socket error, resetting");
            shared.reset(&session).await;
        }
        RelayEnd::Idle => {
            debug!(flow = %key, "Idle timeout, resetting");
            shared.reset(&session).await;
        }
        RelayEnd::Drained | RelayEnd::Closed => {}
    }

    shared.finish(&session).await;
    debug!(flow = %key, id = session.id(), "Session closed");
}

async fn relay(
    shared: &TcpShared,
    session: &TcpSession,
    stream: BoxedStream,
    rx: mpsc::Receiver<Bytes>,
    cancel: &CancellationToken,
) -> RelayEnd {
    let (read_half, write_half) = tokio::io::split(stream);
    let writer = write_loop(shared, session, rx, write_half);
    let reader = read_loop(shared, session, read_half);
    tokio::pin!(writer, reader);

    let end = tokio::select! {
        () = cancel.cancelled() => return RelayEnd::Closed,
        end = &mut writer => end,
        end = &mut reader => end,
    };

    // The client already finished but acknowledged data is still queued
    if matches!(end, RelayEnd::Closed) {
        return tokio::select! {
            () = cancel.cancelled() => RelayEnd::Closed,
            end = &mut writer => end,
        };
    }
    end
}

async fn write_loop(
    shared: &TcpShared,
    session: &TcpSession,
    mut rx: mpsc::Receiver<Bytes>,
    mut out: WriteHalf<BoxedStream>,
) -> RelayEnd {
    let mut first = true;
    while let Some(chunk) = rx.recv().await {
        let result = if first {
            first = false;
            let engine = DesyncEngine::new(shared.settings.load());
            match engine.send_first_chunk(&mut out, &chunk, session.is_https()).await {
                Ok(outcome) => {
                    if outcome.is_desynced() {
                        shared.desynced.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            out.write_all(&chunk).await
        };

        if let Err(e) = result {
            return RelayEnd::WriteError(e);
        }
        session.touch();
        shared.bytes_in.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }

    // Sender dropped: the client sent FIN
    if let Err(e) = out.shutdown().await {
        trace!(flow = %session.key(), error = %e, "Shutdown of real socket failed");
    }
    RelayEnd::Drained
}

async fn read_loop(
    shared: &TcpShared,
    session: &TcpSession,
    mut input: ReadHalf<BoxedStream>,
) -> RelayEnd {
    let idle = shared.limits.tcp_idle_timeout();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        match timeout(idle, input.read(&mut buf)).await {
            Err(_) => {
                if session.idle_for() >= idle {
                    return RelayEnd::Idle;
                }
            }
            Ok(Ok(0)) => return RelayEnd::Eof,
            Ok(Ok(n)) => {
                session.touch();
                match shared.send_to_client(session, &buf[..n]).await {
                    Ok(()) => {}
                    Err(SessionError::Io(e)) => return RelayEnd::ReadError(e),
                    Err(_) => return RelayEnd::Closed,
                }
            }
            Ok(Err(e)) => return RelayEnd::ReadError(e),
        }
    }
}
