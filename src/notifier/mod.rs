//! Unified readiness notification over the native mechanisms.
//!
//! One trait, three backends: a level-triggered `select` bitmap, an
//! edge-triggered `epoll` interest list (Linux), and a level-triggered
//! `kqueue` dual-filter queue (macOS/BSD). All of them classify readiness
//! into the same three partitions: receive, send, error.

use std::os::fd::RawFd;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::event::EventList;

pub mod select;

#[cfg(target_os = "linux")]
pub mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub mod kqueue;

/// Which backend to use. `Auto` picks the best mechanism the platform has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// Level-triggered `select` bitmap. Works everywhere; descriptor values
    /// must fit below FD_SETSIZE.
    LevelSet,
    /// Edge-triggered `epoll` interest list (Linux only).
    EdgeInterest,
    /// Level-triggered `kqueue` read/write filter queue (macOS/BSD only).
    DualFilter,
    #[default]
    Auto,
}

/// Readiness interest for a registration. Error and hang-up conditions are
/// always observed regardless of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };

    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };
}

/// The readiness-notification contract shared by all backends.
///
/// `poll` blocks up to `timeout` seconds (negative = infinite, zero =
/// non-blocking) and appends classified events to the three partitions,
/// returning the total number of events, `Ok(0)` on timeout. It fails only
/// when the descriptor table itself is corrupt; transient conditions such as
/// an interrupting signal report `Ok(0)`.
pub trait Notifier {
    fn add(&mut self, fd: RawFd, interest: Interest) -> Result<()>;

    /// Remove a registration. Idempotent: absent descriptors report `false`.
    fn remove(&mut self, fd: RawFd) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all registrations and free the backend's kernel resources.
    fn clear(&mut self);

    fn poll(
        &mut self,
        timeout: f64,
        recv: &mut EventList,
        send: &mut EventList,
        error: &mut EventList,
    ) -> Result<usize>;

    /// Whether handlers must drain readiness until WouldBlock. Edge
    /// backends put every registered descriptor into non-blocking mode so
    /// that draining is safe.
    fn edge_triggered(&self) -> bool;
}

/// Build a notifier for the requested backend.
pub fn create(backend: Backend, max_events: usize) -> Result<Box<dyn Notifier>> {
    match backend {
        Backend::LevelSet => Ok(Box::new(select::SelectNotifier::new(max_events))),
        Backend::EdgeInterest => edge_interest(max_events),
        Backend::DualFilter => dual_filter(max_events),
        Backend::Auto => native(max_events),
    }
}

#[cfg(target_os = "linux")]
fn edge_interest(max_events: usize) -> Result<Box<dyn Notifier>> {
    Ok(Box::new(epoll::EpollNotifier::new(max_events)?))
}

#[cfg(not(target_os = "linux"))]
fn edge_interest(_max_events: usize) -> Result<Box<dyn Notifier>> {
    Err(Error::InvalidArgument)
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn dual_filter(max_events: usize) -> Result<Box<dyn Notifier>> {
    Ok(Box::new(kqueue::KqueueNotifier::new(max_events)?))
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn dual_filter(_max_events: usize) -> Result<Box<dyn Notifier>> {
    Err(Error::InvalidArgument)
}

#[cfg(target_os = "linux")]
fn native(max_events: usize) -> Result<Box<dyn Notifier>> {
    edge_interest(max_events)
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn native(max_events: usize) -> Result<Box<dyn Notifier>> {
    dual_filter(max_events)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn native(max_events: usize) -> Result<Box<dyn Notifier>> {
    Ok(Box::new(select::SelectNotifier::new(max_events)))
}

/// Pending socket error for a descriptor, or 0 when none is reported.
pub(crate) fn socket_error(fd: RawFd) -> i32 {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut value as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 { 0 } else { value }
}
