//! Per-connection state and the handler capability contract.
//!
//! A connection type embeds an [`Endpoint`] (the owned descriptor, the peer
//! address, and the bookkeeping the registry maintains) and implements
//! [`Conn`] for its event handling. Dispatch is monomorphic over the
//! concrete type; no per-event allocation happens anywhere on the path.

use std::os::fd::RawFd;

use crate::addr::Address;
use crate::error::Result;
use crate::socket::Descriptor;
use crate::stream::Stream;

/// Receive-inactivity timeout applied to new endpoints, in seconds.
pub const DEFAULT_RECV_TIMEOUT: f64 = 120.0;

/// Core state of an accepted stream endpoint.
///
/// The registry refreshes the last-received time and the byte counters
/// after every successful handler return, so individual connection types
/// cannot forget to.
pub struct Endpoint {
    sock: Descriptor,
    peer: Address,
    last_recv_time: f64,
    recv_timeout: f64,
    recv_total: u64,
    send_total: u64,
}

impl Endpoint {
    pub fn new(sock: Descriptor, peer: Address) -> Self {
        Endpoint {
            sock,
            peer,
            last_recv_time: 0.0,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            recv_total: 0,
            send_total: 0,
        }
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.sock
    }

    /// Mutable descriptor access, intended for setup and teardown. While
    /// the connection is joined, the registry owns the lifecycle; swapping
    /// the fd out from under it violates the registration invariant.
    pub fn descriptor_mut(&mut self) -> &mut Descriptor {
        &mut self.sock
    }

    pub fn peer(&self) -> &Address {
        &self.peer
    }

    pub fn fd(&self) -> RawFd {
        self.sock.raw()
    }

    /// A byte-stream adapter borrowing this endpoint's fd.
    pub fn stream(&self) -> Stream {
        Stream::new(&self.sock)
    }

    pub fn recv_timeout(&self) -> f64 {
        self.recv_timeout
    }

    pub fn set_recv_timeout(&mut self, seconds: f64) {
        self.recv_timeout = seconds;
    }

    pub fn last_recv_time(&self) -> f64 {
        self.last_recv_time
    }

    /// Forget the last receive time; the inactivity check stays dormant
    /// until data arrives again.
    pub fn restart_recv_clock(&mut self) {
        self.last_recv_time = 0.0;
    }

    pub fn recv_total(&self) -> u64 {
        self.recv_total
    }

    pub fn send_total(&self) -> u64 {
        self.send_total
    }

    pub(crate) fn mark_recv(&mut self, now: f64, bytes: u64) {
        self.last_recv_time = now;
        self.recv_total += bytes;
    }

    pub(crate) fn mark_send(&mut self, bytes: u64) {
        self.send_total += bytes;
    }

    /// True once the inactivity window has elapsed. Dormant until the
    /// first receive stamps a time.
    pub fn recv_timed_out(&self, now: f64) -> bool {
        self.last_recv_time > 0.0 && self.last_recv_time + self.recv_timeout < now
    }
}

/// The capability set a connection provides to the registry.
///
/// `on_receive` and `on_send` run on the owner thread when the notifier
/// reports readiness. On an edge-triggered backend they must keep reading
/// or writing until they see `WouldBlock`; a wakeup with nothing to do is
/// reported as `Ok(0)`. Returning an error enrolls the connection in the
/// cycle's errored set.
pub trait Conn {
    fn endpoint(&self) -> &Endpoint;

    fn endpoint_mut(&mut self) -> &mut Endpoint;

    /// Data (or an orderly close) is readable. `max_bytes` is a read-size
    /// hint; `now` is the registry clock's current time.
    fn on_receive(&mut self, max_bytes: usize, now: f64) -> Result<usize>;

    /// The socket can accept outbound bytes. Only invoked when
    /// [`wants_send_events`](Conn::wants_send_events) opted in.
    fn on_send(&mut self, max_bytes: usize) -> Result<usize> {
        let _ = max_bytes;
        Ok(0)
    }

    /// The backend reported an error condition; observational. The
    /// connection is enrolled in the errored set regardless.
    fn on_error(&mut self, native_code: i32) {
        let _ = native_code;
    }

    /// Invoked exactly once when the connection leaves the registry, on
    /// error, peer hang-up, or explicit unjoin.
    fn on_close(&mut self) {}

    /// Per-cycle hook for timeout and heartbeat checks. Returning `false`
    /// enrolls the connection in the errored set. The default enforces the
    /// receive-inactivity timeout.
    fn on_update(&mut self, now: f64) -> bool {
        !self.endpoint().recv_timed_out(now)
    }

    /// Opt in to send-readiness events. Off by default; edge backends that
    /// need connect-completion signaling can enable it per connection.
    fn wants_send_events(&self) -> bool {
        false
    }
}
