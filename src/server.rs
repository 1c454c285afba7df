//! Wiring the listener, the acceptor pool, and the registry together.
//!
//! [`ServerBuilder`] turns a [`Config`] plus a bind address into a running
//! [`Server`]: a bound and listening socket, a pool of acceptor threads
//! publishing into the handoff queue, and a registry draining that queue
//! on the calling thread. The caller then drives
//! [`update`](Server::update) at its own cadence.

use std::io;

use tracing::{error, info};

use crate::acceptor::{AcceptorOptions, AcceptorPool};
use crate::addr::{Address, Family};
use crate::clock::Clock;
use crate::config::Config;
use crate::connection::Conn;
use crate::error::{Error, Result};
use crate::notifier::Backend;
use crate::registry::Registry;
use crate::socket::{self, Descriptor, Socket};

/// A listening TCP engine: registry plus acceptor pool.
///
/// Not thread-safe by design; the thread that called
/// [`ServerBuilder::launch`] owns it and drives `update`.
pub struct Server<C: Conn + 'static> {
    registry: Registry<C>,
    pool: AcceptorPool,
}

impl<C: Conn + 'static> Server<C> {
    /// The bound listener address, with the real port when bound to 0.
    pub fn local_address(&self) -> &Address {
        self.pool.local_address()
    }

    pub fn registry(&mut self) -> &mut Registry<C> {
        &mut self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Drive one readiness cycle; see [`Registry::update`].
    pub fn update(&mut self, timeout: f64) -> Result<usize> {
        self.registry.update(timeout)
    }

    /// Take the connections that errored during the most recent `update`.
    pub fn error_snapshot(&mut self) -> Vec<C> {
        self.registry.error_snapshot()
    }

    /// Stop accepting new connections. Existing ones stay joined until
    /// they error, time out, or the registry is cleared.
    pub fn shutdown(&mut self) {
        self.pool.shutdown();
    }
}

impl<C: Conn + 'static> Drop for Server<C> {
    fn drop(&mut self) {
        self.pool.shutdown();
        self.registry.clear();
    }
}

/// Builder for a [`Server`].
pub struct ServerBuilder {
    config: Config,
    bind_addr: Option<String>,
    clock: Option<Box<dyn Clock>>,
}

impl ServerBuilder {
    pub fn new(config: Config) -> Self {
        ServerBuilder {
            config,
            bind_addr: None,
            clock: None,
        }
    }

    /// Set the listen address, e.g. `127.0.0.1:9000` or `[::1]:9000`.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = Some(addr.to_string());
        self
    }

    /// Substitute the registry clock (tests).
    pub fn clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Create the listener, spawn the acceptor pool, and wire the registry.
    ///
    /// `factory` runs on the owner thread for every accepted connection;
    /// the configured receive timeout is applied to whatever it returns.
    pub fn launch<C, F>(self, factory: F) -> Result<Server<C>>
    where
        C: Conn + 'static,
        F: FnMut(Descriptor, Address) -> C + 'static,
    {
        if let Err(e) = self.config.validate() {
            error!(error = %e, "invalid configuration");
            return Err(Error::InvalidArgument);
        }
        let config = self.config;

        socket::startup();

        let bind = self.bind_addr.ok_or(Error::InvalidArgument)?;
        let addr: Address = bind.parse()?;

        let mut listener = Socket::open(addr)?;
        if config.ipv6_only && addr.family() == Family::V6 {
            listener.set_ipv6_only(true)?;
        }
        listener.bind(config.reuse_address)?;
        listener.listen(config.backlog)?;

        let threads = if config.acceptor_threads == 0 {
            num_cpus()
        } else {
            config.acceptor_threads
        };

        ensure_nofile_limit(config.max_connections, threads)?;

        let (tx, rx) = crossbeam_channel::unbounded::<(Descriptor, Address)>();

        let opts = AcceptorOptions {
            accept_timeout: config.accept_timeout_seconds,
            overload_wait: config.overload_wait_seconds,
            no_delay: config.tcp_no_delay,
            keep_alive: config.keep_alive,
            buffer_bytes: config.tcp_buffer_bytes,
        };

        let pool = AcceptorPool::spawn(listener, threads, opts, tx)?;

        let mut registry = match self.clock {
            Some(clock) => {
                Registry::with_clock(config.max_connections, config.notifier_backend, clock)?
            }
            None => Registry::new(config.max_connections, config.notifier_backend)?,
        };

        let recv_timeout = config.recv_timeout_seconds;
        let mut factory = factory;
        registry.attach_intake(rx, move |sock, peer| {
            let mut conn = factory(sock, peer);
            conn.endpoint_mut().set_recv_timeout(recv_timeout);
            conn
        });

        info!(
            address = %pool.local_address(),
            acceptor_threads = threads,
            backend = backend_name(config.notifier_backend),
            "listening"
        );

        Ok(Server { registry, pool })
    }
}

fn backend_name(backend: Backend) -> &'static str {
    match backend {
        Backend::LevelSet => "level-set",
        Backend::EdgeInterest => "edge-interest",
        Backend::DualFilter => "dual-filter",
        Backend::Auto => "auto",
    }
}

/// Get the number of available CPU cores.
fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 { 1 } else { ret as usize }
}

/// Ensure RLIMIT_NOFILE covers the configured connection count.
///
/// Every joined connection holds a process fd, plus per-acceptor and
/// global overhead (listen socket, notifier fd, stdio). The soft limit is
/// raised up to the hard limit when possible.
fn ensure_nofile_limit(max_connections: usize, acceptor_threads: usize) -> Result<()> {
    let mut rlim: libc::rlimit = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if ret != 0 {
        return Err(Error::from(io::Error::last_os_error()));
    }

    let per_acceptor_overhead: u64 = 4;
    let global_overhead: u64 = 64;
    let required = max_connections as u64
        + per_acceptor_overhead * acceptor_threads as u64
        + global_overhead;

    let soft = rlim.rlim_cur;
    let hard = rlim.rlim_max;

    if soft >= required {
        return Ok(());
    }

    if hard >= required || hard == libc::RLIM_INFINITY {
        let new_soft = if hard == libc::RLIM_INFINITY {
            required
        } else {
            std::cmp::min(required, hard)
        };
        rlim.rlim_cur = new_soft;
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
        if ret != 0 {
            return Err(Error::from(io::Error::last_os_error()));
        }
        Ok(())
    } else {
        error!(
            required,
            hard, soft, "RLIMIT_NOFILE too low; raise it with ulimit -n"
        );
        Err(Error::ResourceExhausted)
    }
}
