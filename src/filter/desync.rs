//! Desync over the kernel-queue backend
//!
//! Instead of relaying through real sockets, the first eligible payload of
//! an outgoing HTTP(S) flow is stolen from the queue, re-emitted as a
//! sequence of smaller datagrams, and the original is dropped.
//!
//! ```text
//! on_packet ──> DROP   (QUIC blocked)
//!           ──> STOLEN (first eligible payload)
//!           ──> ACCEPT (everything else)
//!
//! STOLEN ──> fragment_packet ──> inject each ──> set_verdict(DROP)
//!                                    └─fail──> set_verdict(ACCEPT)
//! ```
//!
//! FAKE has no decoy in this path: an injected decoy would carry a live
//! sequence number and corrupt the stream, so it fragments like SPLIT.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use super::packet::{FilterPacket, PacketFilterCallback, Verdict, VerdictSink};
use crate::config::{DesyncMethod, SettingsStore};
use crate::desync::{plan, DesyncAction, DesyncEngine};
use crate::packet::{FlowKey, PacketBuilder, PacketView, IPPROTO_TCP, IPPROTO_UDP};
use crate::sniff::mix_host_case;

/// Flows remembered before the table is flushed
pub const MAX_TRACKED_FLOWS: usize = 65_536;

const HTTPS_PORT: u16 = 443;
const HTTP_PORT: u16 = 80;

/// Counters reported by [`DesyncFilter::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    /// Packets seen by the callback
    pub packets: u64,
    /// Stolen packets replaced by fragments
    pub bypassed: u64,
    /// Packets dropped by QUIC blocking
    pub dropped: u64,
}

/// Verdict callback applying the current desync settings.
pub struct DesyncFilter {
    settings: Arc<SettingsStore>,
    /// Flows whose first payload has already been inspected
    inspected: DashMap<FlowKey, ()>,
    packets: AtomicU64,
    bypassed: AtomicU64,
    dropped: AtomicU64,
}

impl DesyncFilter {
    /// Create a filter reading from `settings`
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self {
            settings,
            inspected: DashMap::new(),
            packets: AtomicU64::new(0),
            bypassed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> FilterStats {
        FilterStats {
            packets: self.packets.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Number of flows currently tracked
    pub fn tracked_flows(&self) -> usize {
        self.inspected.len()
    }

    /// Replacement datagrams for a stolen TCP datagram, in send order.
    ///
    /// Each fragment keeps the original headers with the sequence number
    /// advanced by the fragment's offset into the payload. Returns `None`
    /// for anything that is not a TCP datagram with payload.
    #[must_use]
    pub fn fragment_packet(&self, datagram: &[u8]) -> Option<Vec<Vec<u8>>> {
        self.build_fragments(datagram)
            .map(|fragments| fragments.into_iter().map(|(bytes, _)| bytes).collect())
    }

    /// Settle a packet previously answered with [`Verdict::Stolen`].
    ///
    /// Fragments are handed to `inject` in order, sleeping the configured
    /// delay where the method calls for one, and the original is dropped.
    /// If fragmenting or any injection fails the original is accepted
    /// instead.
    ///
    /// # Errors
    ///
    /// Returns the error from `sink` if the final verdict could not be set.
    pub fn complete_stolen<F>(
        &self,
        packet: &FilterPacket,
        sink: &dyn VerdictSink,
        mut inject: F,
    ) -> io::Result<Verdict>
    where
        F: FnMut(&[u8]) -> io::Result<()>,
    {
        let fragments = packet
            .payload
            .as_deref()
            .and_then(|datagram| self.build_fragments(datagram));

        let Some(fragments) = fragments else {
            debug!(id = packet.id, "Stolen packet cannot be fragmented, accepting");
            sink.set_verdict(packet.id, Verdict::Accept, None)?;
            return Ok(Verdict::Accept);
        };

        let delay = self.settings.load().delay();
        for (bytes, delay_after) in &fragments {
            if let Err(e) = inject(bytes) {
                warn!(id = packet.id, error = %e, "Fragment injection failed, accepting original");
                sink.set_verdict(packet.id, Verdict::Accept, None)?;
                return Ok(Verdict::Accept);
            }
            if *delay_after && !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }

        self.bypassed.fetch_add(1, Ordering::Relaxed);
        sink.set_verdict(packet.id, Verdict::Drop, None)?;
        Ok(Verdict::Drop)
    }

    fn build_fragments(&self, datagram: &[u8]) -> Option<Vec<(Vec<u8>, bool)>> {
        let view = PacketView::parse(datagram)?;
        let tcp = view.tcp()?;
        if view.payload().is_empty() {
            return None;
        }

        let settings = self.settings.load();
        let mut payload = view.payload().to_vec();
        if tcp.dst_port != HTTPS_PORT && settings.mix_host_case {
            mix_host_case(&mut payload);
        }

        let method = match settings.method {
            DesyncMethod::Fake => DesyncMethod::Split,
            other => other,
        };

        plan(method, payload.len(), &settings)
            .into_iter()
            .map(|fragment| {
                let offset = u32::try_from(fragment.range.start).ok()?;
                let bytes = PacketBuilder::reslice_tcp(&view, &payload[fragment.range.clone()], offset)?;
                Some((bytes, fragment.delay_after))
            })
            .collect()
    }

    fn inspect_tcp(&self, packet: &FilterPacket) -> Verdict {
        let Some(view) = packet.payload.as_deref().and_then(PacketView::parse) else {
            return Verdict::Accept;
        };
        let (Some(tcp), Some(key)) = (view.tcp(), view.flow_key()) else {
            return Verdict::Accept;
        };

        // A new handshake or a teardown restarts first-payload tracking
        if tcp.is_syn() || tcp.is_fin() || tcp.is_rst() {
            self.inspected.remove(&key);
        }

        if view.payload().is_empty() || !matches!(tcp.dst_port, HTTPS_PORT | HTTP_PORT) {
            return Verdict::Accept;
        }

        if self.inspected.len() >= MAX_TRACKED_FLOWS {
            debug!(flows = MAX_TRACKED_FLOWS, "Flow tracking table full, flushing");
            self.inspected.clear();
        }
        if self.inspected.insert(key, ()).is_some() {
            trace!(flow = %key, "Payload after first, accepting");
            return Verdict::Accept;
        }

        let engine = DesyncEngine::new(self.settings.load());
        let decision = engine.decide(view.payload(), tcp.dst_port == HTTPS_PORT);
        match decision.action {
            DesyncAction::Apply(method) => {
                info!(
                    id = packet.id,
                    flow = %key,
                    "{} queued for host {}",
                    method,
                    decision.sniff.domain().unwrap_or("unknown")
                );
                Verdict::Stolen
            }
            DesyncAction::Whitelisted | DesyncAction::Passthrough => Verdict::Accept,
        }
    }
}

impl PacketFilterCallback for DesyncFilter {
    fn on_packet(&self, packet: &FilterPacket) -> Verdict {
        self.packets.fetch_add(1, Ordering::Relaxed);

        match packet.protocol {
            IPPROTO_UDP => {
                let block = self.settings.load().block_quic
                    && matches!(packet.dst_port, HTTPS_PORT | HTTP_PORT);
                if block {
                    debug!(id = packet.id, port = packet.dst_port, "QUIC blocked");
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Verdict::Drop
                } else {
                    Verdict::Accept
                }
            }
            IPPROTO_TCP => self.inspect_tcp(packet),
            _ => Verdict::Accept,
        }
    }
}
