//! Transport to the kernel driver.
//!
//! The session reads framed requests from and writes gathered replies to a
//! `Channel`. The real transport is a FUSE character device file descriptor;
//! tests and embedders can supply their own implementation.

use std::io;
use std::io::IoSlice;
use std::os::unix::io::RawFd;

/// A byte-stream carrier of length-framed FUSE messages.
///
/// `receive` must return exactly one framed request per call; `send` must
/// write one complete reply atomically.
pub trait Channel: Send + Sync {
    /// Read one framed request into `buf`, returning its length.
    fn receive(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one reply as a single gathered write.
    fn send(&self, bufs: &[IoSlice<'_>]) -> io::Result<()>;
}

/// Channel over a FUSE device file descriptor.
///
/// The descriptor is borrowed: it comes out of the mount handshake, which
/// also owns closing it.
#[derive(Clone, Copy, Debug)]
pub struct DeviceChannel {
    fd: RawFd,
}

impl DeviceChannel {
    /// Wrap an already-mounted FUSE device descriptor.
    pub fn new(fd: RawFd) -> Self {
        DeviceChannel { fd }
    }
}

impl Channel for DeviceChannel {
    fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        let res = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }

    fn send(&self, bufs: &[IoSlice<'_>]) -> io::Result<()> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let res = unsafe {
            // IoSlice is ABI-compatible with iovec.
            libc::writev(self.fd, bufs.as_ptr().cast(), bufs.len() as libc::c_int)
        };
        if res < 0 {
            Err(io::Error::last_os_error())
        } else if res as usize != total {
            Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write on fuse device",
            ))
        } else {
            Ok(())
        }
    }
}
