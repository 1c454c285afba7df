//! Level-triggered backend over the classic `select` bitmap.
//!
//! The fallback mechanism when no advanced readiness API exists. Per-fd cost
//! is O(max_fd) per poll and descriptor values must fit below FD_SETSIZE.

use std::collections::HashMap;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;

use crate::error::{Error, Result};
use crate::event::{EventKind, EventList, EventRecord};
use crate::notifier::{Interest, Notifier, socket_error};
use crate::socket::timeval_from_secs;

pub struct SelectNotifier {
    fds: HashMap<RawFd, Interest>,
}

impl SelectNotifier {
    pub fn new(max_events: usize) -> Self {
        SelectNotifier {
            fds: HashMap::with_capacity(max_events.min(libc::FD_SETSIZE)),
        }
    }
}

impl Notifier for SelectNotifier {
    fn add(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE {
            return Err(Error::InvalidArgument);
        }
        self.fds.insert(fd, interest);
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> bool {
        self.fds.remove(&fd).is_some()
    }

    fn len(&self) -> usize {
        self.fds.len()
    }

    fn clear(&mut self) {
        self.fds.clear();
    }

    fn poll(
        &mut self,
        timeout: f64,
        recv: &mut EventList,
        send: &mut EventList,
        error: &mut EventList,
    ) -> Result<usize> {
        if self.fds.is_empty() {
            return Ok(0);
        }

        let mut read_set: libc::fd_set = unsafe { mem::zeroed() };
        let mut write_set: libc::fd_set = unsafe { mem::zeroed() };
        let mut error_set: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_ZERO(&mut error_set);
        }

        let mut max_fd: RawFd = -1;
        for (&fd, interest) in &self.fds {
            unsafe {
                if interest.readable {
                    libc::FD_SET(fd, &mut read_set);
                }
                if interest.writable {
                    libc::FD_SET(fd, &mut write_set);
                }
                // Errors are observed regardless of interest.
                libc::FD_SET(fd, &mut error_set);
            }
            max_fd = max_fd.max(fd);
        }

        // select consumes the timeout in place, so it is rebuilt per call.
        let mut tv;
        let tv_ptr = if timeout < 0.0 {
            ptr::null_mut()
        } else {
            tv = timeval_from_secs(timeout);
            &mut tv as *mut libc::timeval
        };

        let rc = unsafe {
            libc::select(
                max_fd + 1,
                &mut read_set,
                &mut write_set,
                &mut error_set,
                tv_ptr,
            )
        };
        if rc < 0 {
            let e = Error::last_os();
            return match e {
                Error::InvalidArgument => Err(e),
                _ => Ok(0),
            };
        }
        if rc == 0 {
            return Ok(0);
        }

        let mut total = 0;
        for (&fd, interest) in &self.fds {
            if unsafe { libc::FD_ISSET(fd, &error_set) } {
                error.push(EventRecord::new(fd, EventKind::Error(socket_error(fd))));
                total += 1;
                continue;
            }
            if interest.readable && unsafe { libc::FD_ISSET(fd, &read_set) } {
                recv.push(EventRecord::new(fd, EventKind::Recv));
                total += 1;
            }
            if interest.writable && unsafe { libc::FD_ISSET(fd, &write_set) } {
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
