//! Byte-stream adapter over a socket descriptor.
//!
//! A [`Stream`] borrows the fd by value and never owns it; it must not
//! outlive the [`Descriptor`](crate::socket::Descriptor) it was created
//! from. Blocking behavior is whatever the descriptor is configured for.

use std::os::fd::RawFd;

use crate::error::{Error, Result};
use crate::socket::Descriptor;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

/// Read/write byte sinks over a borrowed socket fd.
pub struct Stream {
    fd: RawFd,
}

impl Stream {
    pub fn new(sock: &Descriptor) -> Self {
        Stream { fd: sock.raw() }
    }

    /// Read whatever is available, up to `buf.len()` bytes.
    ///
    /// `Ok(0)` means the peer performed an orderly shutdown; a socket with
    /// no data ready reports `Err(WouldBlock)` instead, so the two are never
    /// confused.
    pub fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let n = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(Error::last_os());
        }
        Ok(n as usize)
    }

    /// Write as much as the socket accepts right now.
    pub fn write_some(&mut self, buf: &[u8]) -> Result<usize> {
        let n = unsafe {
            libc::send(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                SEND_FLAGS,
            )
        };
        if n < 0 {
            return Err(Error::last_os());
        }
        Ok(n as usize)
    }

    /// Write the whole buffer, retrying short writes and interrupted calls.
    ///
    /// Returns the number of bytes actually sent; on a non-blocking socket
    /// this may be less than `buf.len()` if the socket stops accepting bytes
    /// (the caller keeps the remainder and waits for send readiness). Any
    /// non-transient error aborts the write.
    pub fn write_fully(&mut self, buf: &[u8]) -> Result<usize> {
        let mut sent = 0;
        while sent < buf.len() {
            match self.write_some(&buf[sent..]) {
                Ok(0) => break,
                Ok(n) => sent += n,
                Err(Error::Interrupted) => continue,
                Err(Error::WouldBlock) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }
}
