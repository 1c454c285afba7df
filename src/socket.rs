//! Owned socket descriptors and the primitive operations on them.
//!
//! [`Descriptor`] is the single owner of a kernel socket slot: move-only,
//! closed exactly once on drop. Every code path that obtains a raw fd wraps
//! it in a `Descriptor` before it can fail, so the drop closes it.

use std::fmt;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Once;

use crate::addr::{Address, Family, SocketKind};
use crate::config::KeepAlive;
use crate::error::{Error, Result};

/// Exclusively-owned handle to a kernel socket. `-1` denotes invalid.
pub struct Descriptor {
    fd: RawFd,
}

impl Descriptor {
    /// An invalid handle owning nothing.
    pub const fn invalid() -> Self {
        Descriptor { fd: -1 }
    }

    /// Take ownership of a raw fd. The descriptor closes it on drop.
    pub fn from_raw(fd: RawFd) -> Self {
        Descriptor { fd }
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    pub fn is_valid(&self) -> bool {
        self.fd >= 0
    }

    /// Yield the raw fd and void ownership; the caller closes it.
    pub fn release(&mut self) -> RawFd {
        mem::replace(&mut self.fd, -1)
    }

    /// Swap in another handle, closing any previous one.
    pub fn reset(&mut self, fd: RawFd) {
        if self.fd != fd {
            self.close();
            self.fd = fd;
        }
    }

    /// Close now. Idempotent.
    pub fn close(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsRawFd for Descriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Descriptor").field(&self.fd).finish()
    }
}

/// Process-wide network-stack startup. Idempotent.
///
/// On unix the only required step is suppressing SIGPIPE so writes to a dead
/// peer surface EPIPE instead of killing the process.
pub fn startup() {
    static INIT: Once = Once::new();
    INIT.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

/// Create a socket for the given family, kind, and protocol.
pub fn create(family: Family, kind: SocketKind, protocol: i32) -> Result<Descriptor> {
    startup();
    let fd = unsafe { libc::socket(family.to_raw(), kind.to_raw(), protocol) };
    if fd < 0 {
        return Err(Error::last_os());
    }
    Ok(Descriptor::from_raw(fd))
}

/// Bind to an address, optionally enabling address reuse first.
pub fn bind(sock: &Descriptor, addr: &Address, reuse: bool) -> Result<()> {
    if !sock.is_valid() {
        return Err(Error::InvalidArgument);
    }
    if reuse {
        set_reuse_address(sock, true)?;
    }
    let (storage, len) = addr.to_raw();
    let rc = unsafe {
        libc::bind(
            sock.raw(),
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    };
    if rc < 0 {
        return Err(Error::last_os());
    }
    Ok(())
}

pub fn listen(sock: &Descriptor, backlog: i32) -> Result<()> {
    if !sock.is_valid() {
        return Err(Error::InvalidArgument);
    }
    let rc = unsafe { libc::listen(sock.raw(), backlog) };
    if rc < 0 {
        return Err(Error::last_os());
    }
    Ok(())
}

fn set_opt_int(sock: &Descriptor, level: i32, name: i32, value: i32) -> Result<()> {
    if !sock.is_valid() {
        return Err(Error::InvalidArgument);
    }
    let rc = unsafe {
        libc::setsockopt(
            sock.raw(),
            level,
            name,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::last_os());
    }
    Ok(())
}

pub fn set_reuse_address(sock: &Descriptor, on: bool) -> Result<()> {
    set_opt_int(sock, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as i32)
}

pub fn set_no_delay(sock: &Descriptor, on: bool) -> Result<()> {
    set_opt_int(sock, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as i32)
}

/// Restrict a v6 listener to v6 peers. Rejects non-v6 sockets.
pub fn set_ipv6_only(sock: &Descriptor, family: Family, only: bool) -> Result<()> {
    if family != Family::V6 {
        return Err(Error::InvalidArgument);
    }
    set_opt_int(sock, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, only as i32)
}

/// Set SO_SNDBUF and SO_RCVBUF to the same target.
pub fn set_buffer_sizes(sock: &Descriptor, bytes: usize) -> Result<()> {
    let value = bytes.min(i32::MAX as usize) as i32;
    set_opt_int(sock, libc::SOL_SOCKET, libc::SO_SNDBUF, value)?;
    set_opt_int(sock, libc::SOL_SOCKET, libc::SO_RCVBUF, value)
}

/// Configure TCP keep-alive probing.
pub fn set_keep_alive(sock: &Descriptor, ka: &KeepAlive) -> Result<()> {
    set_opt_int(sock, libc::SOL_SOCKET, libc::SO_KEEPALIVE, ka.enable as i32)?;
    if !ka.enable {
        return Ok(());
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    let idle_opt = libc::TCP_KEEPALIVE;
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    let idle_opt = libc::TCP_KEEPIDLE;

    set_opt_int(sock, libc::IPPROTO_TCP, idle_opt, ka.idle_secs as i32)?;
    set_opt_int(
        sock,
        libc::IPPROTO_TCP,
        libc::TCP_KEEPINTVL,
        ka.interval_secs as i32,
    )?;
    set_opt_int(
        sock,
        libc::IPPROTO_TCP,
        libc::TCP_KEEPCNT,
        ka.probe_count as i32,
    )
}

pub(crate) fn timeval_from_secs(secs: f64) -> libc::timeval {
    if secs <= 0.0 {
        return libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
    }
    let whole = secs.trunc();
    libc::timeval {
        tv_sec: whole as libc::time_t,
        tv_usec: ((secs - whole) * 1_000_000.0) as libc::suseconds_t,
    }
}

pub(crate) fn set_nonblocking_fd(fd: RawFd, nonblocking: bool) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::last_os());
    }
    let wanted = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if wanted != flags {
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, wanted) };
        if rc < 0 {
            return Err(Error::last_os());
        }
    }
    Ok(())
}

fn install_timeouts(sock: &Descriptor, send_timeout: f64, recv_timeout: f64) -> Result<()> {
    let tv = timeval_from_secs(send_timeout);
    let rc = unsafe {
        libc::setsockopt(
            sock.raw(),
            libc::SOL_SOCKET,
            libc::SO_SNDTIMEO,
            &tv as *const _ as *const libc::c_void,
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::last_os());
    }
    let tv = timeval_from_secs(recv_timeout);
    let rc = unsafe {
        libc::setsockopt(
            sock.raw(),
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const _ as *const libc::c_void,
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::last_os());
    }
    Ok(())
}

/// Toggle blocking mode and install send/recv timeouts in one operation.
///
/// A zero duration means "no timeout". If installing the timeouts fails the
/// blocking-mode toggle is reverted, so the descriptor never ends up with
/// only half of the requested state.
pub fn set_blocking(
    sock: &Descriptor,
    blocking: bool,
    send_timeout: f64,
    recv_timeout: f64,
) -> Result<()> {
    if !sock.is_valid() {
        return Err(Error::InvalidArgument);
    }
    let fd = sock.raw();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::last_os());
    }
    set_nonblocking_fd(fd, !blocking)?;

    if let Err(e) = install_timeouts(sock, send_timeout, recv_timeout) {
        // Restore the original mode before surfacing the failure.
        unsafe {
            libc::fcntl(fd, libc::F_SETFL, flags);
        }
        return Err(e);
    }
    Ok(())
}

/// The locally bound address of a socket, via getsockname.
pub fn local_address(sock: &Descriptor, kind: SocketKind, protocol: i32) -> Result<Address> {
    if !sock.is_valid() {
        return Err(Error::InvalidArgument);
    }
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            sock.raw(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(Error::last_os());
    }
    Address::from_raw(&storage, len, kind, protocol)
}

/// A descriptor paired with the address it was created for, remembering the
/// blocking mode and timeouts so `recreate` can re-apply them.
pub struct Socket {
    sock: Descriptor,
    addr: Address,
    blocking: bool,
    send_timeout: f64,
    recv_timeout: f64,
}

impl Socket {
    /// Create a fresh socket for the address's family, kind, and protocol.
    pub fn open(addr: Address) -> Result<Self> {
        let sock = create(addr.family(), addr.kind(), addr.protocol())?;
        Ok(Socket {
            sock,
            addr,
            blocking: true,
            send_timeout: 0.0,
            recv_timeout: 0.0,
        })
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.sock
    }

    pub fn address(&self) -> &Address {
        &self.addr
    }

    /// Bind to the stored address. When bound to port 0 the address is
    /// refreshed with the port the kernel chose.
    pub fn bind(&mut self, reuse: bool) -> Result<()> {
        bind(&self.sock, &self.addr, reuse)?;
        if self.addr.port() == 0 {
            self.addr = local_address(&self.sock, self.addr.kind(), self.addr.protocol())?;
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        listen(&self.sock, backlog)
    }

    pub fn set_blocking(
        &mut self,
        blocking: bool,
        send_timeout: f64,
        recv_timeout: f64,
    ) -> Result<()> {
        set_blocking(&self.sock, blocking, send_timeout, recv_timeout)?;
        self.blocking = blocking;
        self.send_timeout = send_timeout;
        self.recv_timeout = recv_timeout;
        Ok(())
    }

    pub fn set_ipv6_only(&self, only: bool) -> Result<()> {
        set_ipv6_only(&self.sock, self.addr.family(), only)
    }

    /// Close the current descriptor and create a fresh one with the same
    /// family, kind, and protocol, re-applying blocking mode and timeouts.
    /// The caller binds again explicitly if it needs to.
    pub fn recreate(&mut self) -> Result<()> {
        self.sock.close();
        self.sock = create(self.addr.family(), self.addr.kind(), self.addr.protocol())?;
        set_blocking(
            &self.sock,
            self.blocking,
            self.send_timeout,
            self.recv_timeout,
        )
    }

    pub(crate) fn close_descriptor(&mut self) {
        self.sock.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback(port: u16) -> Address {
        Address::stream(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn fd_is_open(fd: RawFd) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) >= 0 }
    }

    #[test]
    fn descriptor_closes_once_on_drop() {
        let desc = create(Family::V4, SocketKind::Stream, libc::IPPROTO_TCP).unwrap();
        let fd = desc.raw();
        assert!(fd_is_open(fd));
        drop(desc);
        assert!(!fd_is_open(fd));
    }

    #[test]
    fn release_voids_ownership() {
        let mut desc = create(Family::V4, SocketKind::Stream, libc::IPPROTO_TCP).unwrap();
        let fd = desc.release();
        assert!(!desc.is_valid());
        drop(desc);
        // Still ours to close: the drop must not have touched it.
        assert!(fd_is_open(fd));
        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn reset_closes_previous_handle() {
        let mut a = create(Family::V4, SocketKind::Stream, libc::IPPROTO_TCP).unwrap();
        let first = a.raw();
        let mut b = create(Family::V4, SocketKind::Stream, libc::IPPROTO_TCP).unwrap();
        let second = b.release();
        a.reset(second);
        assert!(!fd_is_open(first));
        assert_eq!(a.raw(), second);
    }

    #[test]
    fn close_is_idempotent() {
        let mut desc = create(Family::V4, SocketKind::Stream, libc::IPPROTO_TCP).unwrap();
        desc.close();
        desc.close();
        assert!(!desc.is_valid());
    }

    #[test]
    fn bind_ephemeral_refreshes_port() {
        let mut sock = Socket::open(loopback(0)).unwrap();
        sock.bind(true).unwrap();
        assert_ne!(sock.address().port(), 0);
    }

    #[test]
    fn set_blocking_installs_timeouts() {
        let sock = Socket::open(loopback(0)).unwrap();
        set_blocking(sock.descriptor(), true, 1.5, 2.5).unwrap();

        let mut tv: libc::timeval = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::timeval>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                sock.descriptor().raw(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &mut tv as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        assert_eq!(rc, 0);
        assert_eq!(tv.tv_sec, 2);
    }

    #[test]
    fn set_blocking_rejects_invalid_descriptor() {
        let desc = Descriptor::invalid();
        assert_eq!(
            set_blocking(&desc, true, 0.0, 0.0),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn ipv6_only_rejects_v4_socket() {
        let sock = Socket::open(loopback(0)).unwrap();
        assert_eq!(sock.set_ipv6_only(true), Err(Error::InvalidArgument));
    }

    #[test]
    fn recreate_swaps_in_fresh_descriptor() {
        let mut sock = Socket::open(loopback(0)).unwrap();
        sock.set_blocking(false, 0.0, 0.0).unwrap();
        let old = sock.descriptor().raw();
        sock.recreate().unwrap();
        assert!(sock.descriptor().is_valid());
        // Same family/kind/protocol, nonblocking re-applied.
        let flags = unsafe { libc::fcntl(sock.descriptor().raw(), libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);
        let _ = old;
    }

    #[test]
    fn timeval_conversion() {
        let tv = timeval_from_secs(2.25);
        assert_eq!(tv.tv_sec, 2);
        assert_eq!(tv.tv_usec, 250_000);
        let tv = timeval_from_secs(0.0);
        assert_eq!((tv.tv_sec, tv.tv_usec), (0, 0));
        let tv = timeval_from_secs(-1.0);
        assert_eq!((tv.tv_sec, tv.tv_usec), (0, 0));
    }
}
