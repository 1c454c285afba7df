//! Connection registry and per-cycle event dispatch.
//!
//! A [`Registry`] owns every joined connection, keyed by descriptor value,
//! and drives one readiness cycle per [`update`](Registry::update) call.
//! It is deliberately not thread-safe: exactly one thread — the one that
//! constructed it — may touch it, and acceptor threads reach it only
//! through the intake channel.

use std::collections::HashMap;
use std::mem;
use std::os::fd::RawFd;
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use crate::addr::Address;
use crate::clock::{Clock, MonotonicClock};
use crate::connection::Conn;
use crate::error::{Error, Result};
use crate::event::{EventKind, EventList};
use crate::metrics;
use crate::notifier::{self, Backend, Interest, Notifier};
use crate::socket::Descriptor;

/// Read-size hint passed to receive handlers.
const DEFAULT_READ_SIZE_HINT: usize = 64 * 1024;

/// A connection the registry refused, handed back with the reason so the
/// caller keeps ownership of its descriptor.
pub struct Rejected<C> {
    pub conn: C,
    pub error: Error,
}

type Factory<C> = Box<dyn FnMut(Descriptor, Address) -> C>;

pub struct Registry<C: Conn + 'static> {
    conns: HashMap<RawFd, C>,
    notifier: Box<dyn Notifier>,
    clock: Box<dyn Clock>,
    max_connections: usize,
    read_size_hint: usize,
    // Scratch partitions reused across cycles.
    recv_list: EventList,
    send_list: EventList,
    error_list: EventList,
    // Descriptors to pull out at the end of the current cycle.
    enroll: Vec<RawFd>,
    errored: Vec<C>,
    intake: Option<Receiver<(Descriptor, Address)>>,
    factory: Option<Factory<C>>,
    owner: ThreadId,
}

impl<C: Conn + 'static> Registry<C> {
    pub fn new(max_connections: usize, backend: Backend) -> Result<Self> {
        Self::with_clock(max_connections, backend, Box::new(MonotonicClock::new()))
    }

    /// Construct with a caller-supplied clock; every `now` handed to
    /// connection callbacks comes from it.
    pub fn with_clock(
        max_connections: usize,
        backend: Backend,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        if max_connections == 0 {
            return Err(Error::InvalidArgument);
        }
        let notifier = notifier::create(backend, max_connections)?;
        Ok(Registry {
            conns: HashMap::with_capacity(max_connections),
            notifier,
            clock,
            max_connections,
            read_size_hint: DEFAULT_READ_SIZE_HINT,
            recv_list: Vec::new(),
            send_list: Vec::new(),
            error_list: Vec::new(),
            enroll: Vec::new(),
            errored: Vec::new(),
            intake: None,
            factory: None,
            owner: thread::current().id(),
        })
    }

    /// Attach the acceptor handoff queue. Arrivals are turned into
    /// connections by `factory` and joined at the start of each cycle.
    pub fn attach_intake<F>(&mut self, rx: Receiver<(Descriptor, Address)>, factory: F)
    where
        F: FnMut(Descriptor, Address) -> C + 'static,
    {
        self.intake = Some(rx);
        self.factory = Some(Box::new(factory));
    }

    pub fn set_read_size_hint(&mut self, bytes: usize) {
        self.read_size_hint = bytes.max(1);
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.conns.contains_key(&fd)
    }

    pub fn get(&self, fd: RawFd) -> Option<&C> {
        self.conns.get(&fd)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut C> {
        self.conns.get_mut(&fd)
    }

    /// Whether the active backend requires the drain-until-WouldBlock
    /// discipline in receive handlers.
    pub fn edge_triggered(&self) -> bool {
        self.notifier.edge_triggered()
    }

    fn assert_owner(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "registry accessed from a thread other than its owner"
        );
    }

    /// Insert a connection and register it with the notifier. A colliding
    /// or invalid descriptor, a full registry, or a notifier failure hands
    /// the connection back untouched.
    pub fn join(&mut self, conn: C) -> std::result::Result<(), Rejected<C>> {
        self.assert_owner();
        if !conn.endpoint().descriptor().is_valid() {
            return Err(Rejected {
                conn,
                error: Error::InvalidArgument,
            });
        }
        let fd = conn.endpoint().fd();
        if self.conns.contains_key(&fd) {
            return Err(Rejected {
                conn,
                error: Error::InvalidArgument,
            });
        }
        if self.conns.len() >= self.max_connections {
            return Err(Rejected {
                conn,
                error: Error::ResourceExhausted,
            });
        }
        let interest = if conn.wants_send_events() {
            Interest::BOTH
        } else {
            Interest::READABLE
        };
        if let Err(error) = self.notifier.add(fd, interest) {
            return Err(Rejected { conn, error });
        }
        debug!(fd, peer = %conn.endpoint().peer(), "connection joined");
        metrics::CONNECTIONS_ACTIVE.increment();
        self.conns.insert(fd, conn);
        Ok(())
    }

    /// Join a batch, returning how many were inserted plus the rejects.
    /// A rejected element does not disturb the others.
    pub fn join_batch(&mut self, batch: Vec<C>) -> (usize, Vec<Rejected<C>>) {
        self.assert_owner();
        let mut joined = 0;
        let mut rejected = Vec::new();
        for conn in batch {
            match self.join(conn) {
                Ok(()) => joined += 1,
                Err(r) => rejected.push(r),
            }
        }
        (joined, rejected)
    }

    /// Remove a connection: notifier first, then the map, then `on_close`.
    /// Unknown descriptors are a no-op.
    pub fn unjoin(&mut self, fd: RawFd) -> Option<C> {
        self.assert_owner();
        self.notifier.remove(fd);
        let mut conn = self.conns.remove(&fd)?;
        conn.on_close();
        metrics::CONNECTIONS_ACTIVE.decrement();
        debug!(fd, "connection unjoined");
        Some(conn)
    }

    /// Drive one readiness cycle.
    ///
    /// Order within the cycle: the previous cycle's unconsumed errored set
    /// is released, intake arrivals are joined, the notifier is polled,
    /// then all receive handlers run before all send handlers before all
    /// error handlers, and finally the per-tick `on_update` pass enrolls
    /// timeouts. Enrolled connections are unlinked from the notifier,
    /// removed from the map, given `on_close`, and parked in the errored
    /// set for [`error_snapshot`](Registry::error_snapshot).
    pub fn update(&mut self, timeout: f64) -> Result<usize> {
        self.assert_owner();

        self.errored.clear();
        self.drain_intake();

        if self.notifier.is_empty() {
            return self.wait_for_intake(timeout);
        }

        self.recv_list.clear();
        self.send_list.clear();
        self.error_list.clear();
        let count = self.notifier.poll(
            timeout,
            &mut self.recv_list,
            &mut self.send_list,
            &mut self.error_list,
        )?;

        let now = self.clock.now();
        self.enroll.clear();

        for i in 0..self.recv_list.len() {
            let ev = self.recv_list[i];
            let Some(conn) = self.conns.get_mut(&ev.fd) else {
                continue;
            };
            match conn.on_receive(self.read_size_hint, now) {
                Ok(n) => {
                    conn.endpoint_mut().mark_recv(now, n as u64);
                    if n > 0 {
                        metrics::BYTES_RECEIVED.add(n as u64);
                    }
                }
                Err(Error::WouldBlock) | Err(Error::Interrupted) => {}
                Err(_) => self.enroll.push(ev.fd),
            }
        }

        for i in 0..self.send_list.len() {
            let ev = self.send_list[i];
            let Some(conn) = self.conns.get_mut(&ev.fd) else {
                continue;
            };
            match conn.on_send(self.read_size_hint) {
                Ok(n) => {
                    conn.endpoint_mut().mark_send(n as u64);
                    if n > 0 {
                        metrics::BYTES_SENT.add(n as u64);
                    }
                }
                Err(Error::WouldBlock) | Err(Error::Interrupted) => {}
                Err(_) => self.enroll.push(ev.fd),
            }
        }

        for i in 0..self.error_list.len() {
            let ev = self.error_list[i];
            let EventKind::Error(code) = ev.kind else {
                continue;
            };
            let Some(conn) = self.conns.get_mut(&ev.fd) else {
                continue;
            };
            conn.on_error(code);
            self.enroll.push(ev.fd);
        }

        for (&fd, conn) in self.conns.iter_mut() {
            if !conn.on_update(now) {
                self.enroll.push(fd);
            }
        }

        // An fd can be enrolled more than once in a cycle (error event plus
        // failed tick); it must leave the registry exactly once.
        self.enroll.sort_unstable();
        self.enroll.dedup();
        for i in 0..self.enroll.len() {
            let fd = self.enroll[i];
            self.notifier.remove(fd);
            if let Some(mut conn) = self.conns.remove(&fd) {
                conn.on_close();
                metrics::CONNECTIONS_ACTIVE.decrement();
                debug!(fd, "connection errored");
                self.errored.push(conn);
            }
        }

        Ok(count)
    }

    /// Take the connections that errored during the most recent `update`.
    /// Consume it before the next cycle; whatever is left gets dropped
    /// (descriptors closed) when the next cycle starts.
    pub fn error_snapshot(&mut self) -> Vec<C> {
        self.assert_owner();
        mem::take(&mut self.errored)
    }

    /// Unregister and drop everything, including the notifier's kernel
    /// resources. The registry is spent afterwards.
    pub fn clear(&mut self) {
        self.assert_owner();
        self.notifier.clear();
        for conn in self.conns.values_mut() {
            conn.on_close();
            metrics::CONNECTIONS_ACTIVE.decrement();
        }
        self.conns.clear();
        self.errored.clear();
    }

    fn join_intake_conn(&mut self, sock: Descriptor, peer: Address) {
        let Some(mut make) = self.factory.take() else {
            return;
        };
        let conn = make(sock, peer);
        self.factory = Some(make);
        if let Err(rejected) = self.join(conn) {
            warn!(error = %rejected.error, "rejecting accepted connection");
        }
    }

    fn drain_intake(&mut self) {
        let Some(rx) = self.intake.clone() else {
            return;
        };
        while let Ok((sock, peer)) = rx.try_recv() {
            self.join_intake_conn(sock, peer);
        }
    }

    /// With nothing registered there is nothing to poll; park on the
    /// intake queue (or just sleep) so callers do not spin.
    fn wait_for_intake(&mut self, timeout: f64) -> Result<usize> {
        let Some(rx) = self.intake.clone() else {
            if timeout > 0.0 {
                thread::sleep(Duration::from_secs_f64(timeout));
            }
            return Ok(0);
        };
        let first = if timeout < 0.0 {
            rx.recv().ok()
        } else if timeout > 0.0 {
            rx.recv_timeout(Duration::from_secs_f64(timeout)).ok()
        } else {
            None
        };
        if let Some((sock, peer)) = first {
            self.join_intake_conn(sock, peer);
            self.drain_intake();
        }
        Ok(0)
    }
}
