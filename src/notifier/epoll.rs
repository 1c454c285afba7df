//! Edge-triggered backend over the Linux epoll interest list.
//!
//! Events are reported on transitions, so handlers must drain readiness
//! until they see WouldBlock. To make that safe, every descriptor accepted
//! here is switched to non-blocking mode.

use std::collections::HashSet;
use std::os::fd::RawFd;

use crate::error::{Error, Result};
use crate::event::{EventKind, EventList, EventRecord};
use crate::notifier::{Interest, Notifier, socket_error};
use crate::socket::{Descriptor, set_nonblocking_fd};

pub struct EpollNotifier {
    epfd: Descriptor,
    fds: HashSet<RawFd>,
    events: Vec<libc::epoll_event>,
}

impl EpollNotifier {
    pub fn new(max_events: usize) -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::last_os());
        }
        let cap = max_events.max(1);
        Ok(EpollNotifier {
            epfd: Descriptor::from_raw(epfd),
            fds: HashSet::with_capacity(cap),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; cap],
        })
    }

    fn interest_bits(interest: Interest) -> u32 {
        let mut bits = libc::EPOLLET as u32 | libc::EPOLLRDHUP as u32;
        if interest.readable {
            bits |= libc::EPOLLIN as u32;
        }
        if interest.writable {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }
}

impl Notifier for EpollNotifier {
    fn add(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        if fd < 0 || !self.epfd.is_valid() {
            return Err(Error::InvalidArgument);
        }
        // Edge triggering requires the drain-until-WouldBlock discipline.
        set_nonblocking_fd(fd, true)?;

        let mut ev = libc::epoll_event {
            events: Self::interest_bits(interest),
            u64: fd as u64,
        };
        let mut rc = unsafe { libc::epoll_ctl(self.epfd.raw(), libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EEXIST) {
            rc = unsafe { libc::epoll_ctl(self.epfd.raw(), libc::EPOLL_CTL_MOD, fd, &mut ev) };
        }
        if rc < 0 {
            return Err(Error::last_os());
        }
        self.fds.insert(fd);
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> bool {
        if !self.fds.remove(&fd) {
            return false;
        }
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        unsafe {
            libc::epoll_ctl(self.epfd.raw(), libc::EPOLL_CTL_DEL, fd, &mut ev);
        }
        true
    }

    fn len(&self) -> usize {
        self.fds.len()
    }

    fn clear(&mut self) {
        self.fds.clear();
        self.epfd.close();
    }

    fn poll(
        &mut self,
        timeout: f64,
        recv: &mut EventList,
        send: &mut EventList,
        error: &mut EventList,
    ) -> Result<usize> {
        if !self.epfd.is_valid() {
            return Err(Error::InvalidArgument);
        }
        if self.fds.is_empty() {
            return Ok(0);
        }

        let timeout_ms: libc::c_int = if timeout < 0.0 {
            -1
        } else {
            (timeout * 1000.0).ceil() as libc::c_int
        };

        let n = unsafe {
            libc::epoll_wait(
                self.epfd.raw(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let e = Error::last_os();
            return match e {
                Error::InvalidArgument => Err(e),
                _ => Ok(0),
            };
        }

        let mut total = 0;
        for ev in &self.events[..n as usize] {
            let fd = ev.u64 as RawFd;
            let bits = ev.events;

            if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                error.push(EventRecord::new(fd, EventKind::Error(socket_error(fd))));
                total += 1;
                continue;
            }
            // EPOLLRDHUP counts as readable so buffered bytes drain before
            // the read path reports the orderly close.
            if bits & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0 {
                recv.push(EventRecord::new(fd, EventKind::Recv));
                total += 1;
            }
            if bits & libc::EPOLLOUT as u32 != 0 {
                send.push(EventRecord::new(fd, EventKind::Send));
                total += 1;
            }
        }
        Ok(total)
    }

    fn edge_triggered(&self) -> bool {
        true
    }
}
