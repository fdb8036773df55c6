//! Raw TUN file descriptor backend
//!
//! The descriptor is created and configured elsewhere (by the platform VPN
//! service or `ip tuntap`) and handed to us already open. We switch it to
//! non-blocking mode and drive it through tokio's reactor.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::debug;

use super::interface::VirtualInterface;

/// Virtual interface over an inherited TUN descriptor
pub struct FdInterface {
    inner: AsyncFd<File>,
}

impl FdInterface {
    /// Take ownership of `fd` and register it with the reactor.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be made non-blocking or
    /// registered.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        let file = File::from(fd);
        debug!(fd = file.as_raw_fd(), "TUN descriptor registered");
        Ok(Self {
            inner: AsyncFd::with_interest(file, Interest::READABLE | Interest::WRITABLE)?,
        })
    }

    /// Underlying descriptor
    pub fn raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[async_trait]
impl VirtualInterface for FdInterface {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| inner.get_ref().write(packet)) {
                Ok(Ok(n)) if n == packet.len() => return Ok(()),
                Ok(Ok(n)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short TUN write: {n} of {} bytes", packet.len()),
                    ))
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; no memory is passed
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
