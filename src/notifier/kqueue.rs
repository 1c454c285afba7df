//! Level-triggered backend over the BSD kqueue dual-filter queue.
//!
//! Read and write readiness are separate filter entries. The write filter
//! is registered only when a registration asks for it; most connections
//! never do.

use std::collections::HashMap;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;

use crate::error::{Error, Result};
use crate::event::{EventKind, EventList, EventRecord};
use crate::notifier::{Interest, Notifier};
use crate::socket::Descriptor;

pub struct KqueueNotifier {
    kq: Descriptor,
    fds: HashMap<RawFd, Interest>,
    events: Vec<libc::kevent>,
}

impl KqueueNotifier {
    pub fn new(max_events: usize) -> Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(Error::last_os());
        }
        let cap = max_events.max(1);
        Ok(KqueueNotifier {
            kq: Descriptor::from_raw(kq),
            fds: HashMap::with_capacity(cap),
            events: vec![unsafe { mem::zeroed() }; cap],
        })
    }

    fn change(fd: RawFd, filter: i16, flags: u16) -> libc::kevent {
        let mut ev: libc::kevent = unsafe { mem::zeroed() };
        ev.ident = fd as libc::uintptr_t;
        ev.filter = filter;
        ev.flags = flags;
        ev
    }

    fn apply(&self, changes: &[libc::kevent]) -> i32 {
        unsafe {
            libc::kevent(
                self.kq.raw(),
                changes.as_ptr(),
                changes.len() as libc::c_int,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        }
    }
}

impl Notifier for KqueueNotifier {
    fn add(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        if fd < 0 || !self.kq.is_valid() {
            return Err(Error::InvalidArgument);
        }

        let mut changes = [Self::change(0, 0, 0); 2];
        let mut n = 0;
        if interest.readable {
            changes[n] = Self::change(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ENABLE);
            n += 1;
        }
        if interest.writable {
            changes[n] = Self::change(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_ENABLE);
            n += 1;
        }
        if n == 0 {
            return Err(Error::InvalidArgument);
        }
        if self.apply(&changes[..n]) != 0 {
            return Err(Error::last_os());
        }
        self.fds.insert(fd, interest);
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> bool {
        let Some(interest) = self.fds.remove(&fd) else {
            return false;
        };
        if !self.kq.is_valid() {
            return true;
        }
        // Delete only the filters that were registered; errors here mean
        // the kernel already dropped them with the socket.
        let mut changes = [Self::change(0, 0, 0); 2];
        let mut n = 0;
        if interest.readable {
            changes[n] = Self::change(fd, libc::EVFILT_READ, libc::EV_DELETE);
            n += 1;
        }
        if interest.writable {
            changes[n] = Self::change(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
            n += 1;
        }
        self.apply(&changes[..n]);
        true
    }

    fn len(&self) -> usize {
        self.fds.len()
    }

    fn clear(&mut self) {
        self.fds.clear();
        self.kq.close();
    }

    fn poll(
        &mut self,
        timeout: f64,
        recv: &mut EventList,
        send: &mut EventList,
        error: &mut EventList,
    ) -> Result<usize> {
        if !self.kq.is_valid() {
            return Err(Error::InvalidArgument);
        }
        if self.fds.is_empty() {
            return Ok(0);
        }

        let ts;
        let ts_ptr = if timeout < 0.0 {
            ptr::null()
        } else {
            let whole = timeout.trunc();
            ts = libc::timespec {
                tv_sec: whole as libc::time_t,
                tv_nsec: ((timeout - whole) * 1_000_000_000.0) as libc::c_long,
            };
            &ts as *const libc::timespec
        };

        let n = unsafe {
            libc::kevent(
                self.kq.raw(),
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                ts_ptr,
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
            let fd = ev.ident as RawFd;
            if ev.flags & libc::EV_ERROR != 0 {
                error.push(EventRecord::new(fd, EventKind::Error(ev.data as i32)));
                total += 1;
            } else if ev.filter == libc::EVFILT_READ {
                recv.push(EventRecord::new(fd, EventKind::Recv));
                total += 1;
            } else if ev.filter == libc::EVFILT_WRITE {
                send.push(EventRecord::new(fd, EventKind::Send));
                total += 1;
            }
        }
        Ok(total)
    }

    fn edge_triggered(&self) -> bool {
        false
    }
}
