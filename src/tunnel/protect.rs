//! Socket protection
//!
//! Every real socket must be excluded from the tunnel before it connects,
//! otherwise its traffic would be captured again and loop forever. How that
//! is done depends on the host:
//!
//! - Linux policy routing: `SO_MARK` and/or `SO_BINDTODEVICE` ([`MarkProtector`])
//! - Mobile VPN services: a host callback ([`FnProtector`])
//! - Tests: nothing ([`NoopProtector`])

use std::io;
use std::mem;
use std::os::fd::RawFd;

use tracing::debug;

use crate::config::ProtectConfig;
use crate::error::SessionError;

/// Excludes a socket from the tunnel before it is used
pub trait SocketProtector: Send + Sync {
    /// Protect the socket behind `fd`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Protect` if the socket cannot be protected; the
    /// caller must not use it.
    fn protect(&self, fd: RawFd) -> Result<(), SessionError>;
}

/// Protector that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _fd: RawFd) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Protector backed by a host callback returning success
pub struct FnProtector<F> {
    callback: F,
}

impl<F> FnProtector<F>
where
    F: Fn(RawFd) -> bool + Send + Sync,
{
    /// Wrap a callback
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> SocketProtector for FnProtector<F>
where
    F: Fn(RawFd) -> bool + Send + Sync,
{
    fn protect(&self, fd: RawFd) -> Result<(), SessionError> {
        if (self.callback)(fd) {
            Ok(())
        } else {
            Err(SessionError::Protect(format!("host refused to protect fd {fd}")))
        }
    }
}

/// Linux policy-routing protector
#[derive(Debug, Clone, Default)]
pub struct MarkProtector {
    routing_mark: Option<u32>,
    bind_interface: Option<String>,
}

impl MarkProtector {
    /// Create from the `protect` config section
    pub fn new(config: &ProtectConfig) -> Self {
        Self {
            routing_mark: config.routing_mark,
            bind_interface: config.bind_interface.clone(),
        }
    }

    /// Whether any option is configured
    pub fn is_active(&self) -> bool {
        self.routing_mark.is_some() || self.bind_interface.is_some()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn set_bind_device(fd: RawFd, interface: &str) -> Result<(), SessionError> {
        // IFNAMSIZ is 16 including the terminating NUL
        if interface.len() > 15 {
            return Err(SessionError::Protect(format!(
                "Interface name too long: {interface} (max 15 chars)"
            )));
        }

        let mut ifname = [0u8; 16];
        ifname[..interface.len()].copy_from_slice(interface.as_bytes());

        // SAFETY: ifname outlives the call and its length is passed alongside
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                ifname.as_ptr().cast::<libc::c_void>(),
                ifname.len() as libc::socklen_t,
            )
        };
        if ret != 0 {
            let err = io::Error::last_os_error();
            return Err(SessionError::Protect(format!(
                "SO_BINDTODEVICE {interface}: {err}"
            )));
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn set_routing_mark(fd: RawFd, mark: u32) -> Result<(), SessionError> {
        // SAFETY: mark outlives the call and its size is passed alongside
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_MARK,
                std::ptr::addr_of!(mark).cast::<libc::c_void>(),
                mem::size_of::<u32>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            let err = io::Error::last_os_error();
            return Err(SessionError::Protect(format!("SO_MARK {mark}: {err}")));
        }
        Ok(())
    }
}

impl SocketProtector for MarkProtector {
    fn protect(&self, fd: RawFd) -> Result<(), SessionError> {
        if let Some(ref interface) = self.bind_interface {
            Self::set_bind_device(fd, interface)?;
        }
        if let Some(mark) = self.routing_mark {
            Self::set_routing_mark(fd, mark)?;
        }
        debug!(fd, mark = ?self.routing_mark, interface = ?self.bind_interface, "Socket protected");
        Ok(())
    }
}
