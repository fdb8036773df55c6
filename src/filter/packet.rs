//! Callback contract of the kernel-queue interception backend
//!
//! The backend itself lives outside this crate. It hands each queued
//! datagram to a [`PacketFilterCallback`] and applies the returned
//! [`Verdict`]; a `Stolen` packet is settled later through a
//! [`VerdictSink`].

use std::fmt;
use std::net::Ipv4Addr;

use crate::packet::PacketView;

/// Disposition of a queued packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Verdict {
    /// Discard the packet
    Drop = 0,
    /// Let the packet continue
    Accept = 1,
    /// Hold the packet; a verdict follows through [`VerdictSink`]
    Stolen = 3,
    /// Re-inject the packet at the start of the hook
    Repeat = 4,
}

impl Verdict {
    /// Numeric code used across the native boundary
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Parse a numeric verdict code
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Drop),
            1 => Some(Self::Accept),
            3 => Some(Self::Stolen),
            4 => Some(Self::Repeat),
            _ => None,
        }
    }

    /// Verdict name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Drop => "DROP",
            Self::Accept => "ACCEPT",
            Self::Stolen => "STOLEN",
            Self::Repeat => "REPEAT",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packet descriptor passed to the callback.
///
/// Addresses are the numeric value of the dotted quad (`a.b.c.d` is
/// `a << 24 | b << 16 | c << 8 | d`). `payload` is the whole IP datagram
/// when the backend copied it out of the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPacket {
    /// Queue packet id, echoed in the verdict
    pub id: u32,
    /// IP protocol number
    pub protocol: u8,
    /// Source address
    pub src_ip: u32,
    /// Destination address
    pub dst_ip: u32,
    /// Source port (0 for protocols without ports)
    pub src_port: u16,
    /// Destination port (0 for protocols without ports)
    pub dst_port: u16,
    /// Raw IP datagram
    pub payload: Option<Vec<u8>>,
}

impl FilterPacket {
    /// Build a descriptor from a raw IPv4 datagram.
    ///
    /// Returns `None` if the datagram does not parse.
    #[must_use]
    pub fn from_ip_packet(id: u32, datagram: &[u8]) -> Option<Self> {
        let view = PacketView::parse(datagram)?;
        let (src_port, dst_port) = view
            .flow_key()
            .map_or((0, 0), |key| (key.src_port, key.dst_port));

        Some(Self {
            id,
            protocol: view.protocol(),
            src_ip: u32::from(view.src_ip()),
            dst_ip: u32::from(view.dst_ip()),
            src_port,
            dst_port,
            payload: Some(view.as_bytes().to_vec()),
        })
    }

    /// Source address as [`Ipv4Addr`]
    #[must_use]
    pub fn source(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_ip)
    }

    /// Destination address as [`Ipv4Addr`]
    #[must_use]
    pub fn destination(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_ip)
    }
}

/// Decides the fate of each queued packet
pub trait PacketFilterCallback: Send + Sync {
    /// Verdict for `packet`; called on the backend's queue thread
    fn on_packet(&self, packet: &FilterPacket) -> Verdict;
}

/// Settles packets previously answered with [`Verdict::Stolen`]
pub trait VerdictSink: Send + Sync {
    /// Issue the final verdict for packet `id`, optionally replacing its
    /// contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejected the verdict.
    fn set_verdict(&self, id: u32, verdict: Verdict, replacement: Option<&[u8]>) -> std::io::Result<()>;
}
