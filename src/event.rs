//! Readiness events produced by the notifier and consumed by the registry.

use std::os::fd::RawFd;

/// What a descriptor became ready for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Data (or an orderly close) can be read.
    Recv,
    /// The socket can accept outbound bytes.
    Send,
    /// The backend reported an error or hang-up; carries the native errno,
    /// or 0 when the backend had no code to give.
    Error(i32),
}

/// A single readiness event: which descriptor, and what for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub fd: RawFd,
    pub kind: EventKind,
}

impl EventRecord {
    pub fn new(fd: RawFd, kind: EventKind) -> Self {
        EventRecord { fd, kind }
    }
}

/// Scratch partition reused across poll cycles.
pub type EventList = Vec<EventRecord>;
