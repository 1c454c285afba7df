//! Accepting new connections and feeding them to the registry owner.
//!
//! A single [`Acceptor`] drives the accept contract against one listening
//! socket; an [`AcceptorPool`] runs several of them on dedicated threads
//! against the same listener (the kernel serializes accept) and publishes
//! `(Descriptor, Address)` pairs into the handoff queue the registry
//! drains.

use std::fmt::Write as _;
use std::mem;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, error, info, warn};

use crate::addr::{Address, SocketKind};
use crate::config::KeepAlive;
use crate::error::{Error, Result};
use crate::metrics;
use crate::socket::{self, Descriptor, Socket};

/// What a failing accept errno means for the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptDisposition {
    /// Nothing to do this round; try again.
    Transient,
    /// File table exhausted; back off before retrying.
    Overload,
    /// Unrecoverable; the acceptor gives up.
    Fatal,
}

pub(crate) fn classify_accept_errno(errno: i32) -> AcceptDisposition {
    if errno == 0
        || errno == libc::EAGAIN
        || errno == libc::EWOULDBLOCK
        || errno == libc::EINTR
        || errno == libc::ETIMEDOUT
        || errno == libc::ECONNABORTED
    {
        return AcceptDisposition::Transient;
    }
    if errno == libc::EMFILE || errno == libc::ENFILE {
        return AcceptDisposition::Overload;
    }
    AcceptDisposition::Fatal
}

/// One accept attempt against `listen_fd`.
///
/// Waits up to `accept_timeout` seconds for the listener to become
/// readable, then accepts. `Ok(None)` covers both the timeout and every
/// transient failure; file-table exhaustion sleeps `overload_wait` seconds
/// first. The peer's printable form is rendered into `peer_text`, reused
/// across calls.
fn accept_on(
    listen_fd: RawFd,
    accept_timeout: f64,
    overload_wait: f64,
    peer_text: &mut String,
) -> Result<Option<(Descriptor, Address)>> {
    if listen_fd < 0 {
        return Err(Error::InvalidArgument);
    }

    if accept_timeout > 0.0 && (listen_fd as usize) < libc::FD_SETSIZE {
        let mut read_set: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_SET(listen_fd, &mut read_set);
        }
        let mut tv = socket::timeval_from_secs(accept_timeout);
        let rc = unsafe {
            libc::select(
                listen_fd + 1,
                &mut read_set,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut tv,
            )
        };
        if rc <= 0 {
            return Ok(None);
        }
    }

    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let fd = unsafe {
        libc::accept(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if fd < 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return match classify_accept_errno(errno) {
            AcceptDisposition::Transient => Ok(None),
            AcceptDisposition::Overload => {
                warn!(errno, "file table exhausted; backing off");
                metrics::ACCEPT_OVERLOADS.increment();
                thread::sleep(Duration::from_secs_f64(overload_wait.max(0.0)));
                Ok(None)
            }
            AcceptDisposition::Fatal => {
                error!(errno, "accept failed");
                Err(Error::from_errno(errno))
            }
        };
    }

    // Own the fd before anything else can fail.
    let sock = Descriptor::from_raw(fd);
    let peer = Address::from_raw(&storage, len, SocketKind::Stream, libc::IPPROTO_TCP)?;

    peer_text.clear();
    let _ = write!(peer_text, "{peer}");
    info!(peer = %peer_text, fd, "accepted connection");
    metrics::CONNECTIONS_ACCEPTED.increment();

    Ok(Some((sock, peer)))
}

/// Socket options applied to each accepted connection, on the acceptor
/// thread, before the handoff.
#[derive(Debug, Clone)]
pub struct AcceptorOptions {
    pub accept_timeout: f64,
    pub overload_wait: f64,
    pub no_delay: bool,
    pub keep_alive: KeepAlive,
    /// SO_SNDBUF/SO_RCVBUF target; 0 keeps the kernel defaults.
    pub buffer_bytes: usize,
}

impl Default for AcceptorOptions {
    fn default() -> Self {
        AcceptorOptions {
            accept_timeout: 60.0,
            overload_wait: 10.0,
            no_delay: false,
            keep_alive: KeepAlive::default(),
            buffer_bytes: 0,
        }
    }
}

fn apply_conn_options(sock: &Descriptor, opts: &AcceptorOptions) {
    // Best effort: a connection that rejects an option is still usable.
    if opts.no_delay {
        let _ = socket::set_no_delay(sock, true);
    }
    if opts.keep_alive.enable {
        let _ = socket::set_keep_alive(sock, &opts.keep_alive);
    }
    if opts.buffer_bytes > 0 {
        let _ = socket::set_buffer_sizes(sock, opts.buffer_bytes);
    }
}

/// Single-threaded acceptor owning its listening socket.
pub struct Acceptor {
    listener: Socket,
    accept_timeout: f64,
    overload_wait: f64,
    peer_text: String,
}

impl Acceptor {
    /// Wrap a bound, listening socket.
    pub fn new(listener: Socket) -> Self {
        Acceptor {
            listener,
            accept_timeout: 60.0,
            overload_wait: 10.0,
            peer_text: String::with_capacity(64),
        }
    }

    pub fn listener(&self) -> &Socket {
        &self.listener
    }

    pub fn set_accept_timeout(&mut self, seconds: f64) {
        self.accept_timeout = seconds;
    }

    pub fn set_overload_wait(&mut self, seconds: f64) {
        self.overload_wait = seconds;
    }

    /// One accept attempt; see the module docs for the contract.
    pub fn accept(&mut self) -> Result<Option<(Descriptor, Address)>> {
        accept_on(
            self.listener.descriptor().raw(),
            self.accept_timeout,
            self.overload_wait,
            &mut self.peer_text,
        )
    }

    pub fn into_listener(self) -> Socket {
        self.listener
    }
}

/// Fixed pool of acceptor threads publishing into a handoff queue.
///
/// The pool owns the listening socket; `shutdown` raises the shared flag
/// and closes the listener so any accept blocked in the kernel unblocks.
pub struct AcceptorPool {
    listener: Socket,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl AcceptorPool {
    pub fn spawn(
        listener: Socket,
        threads: usize,
        opts: AcceptorOptions,
        tx: Sender<(Descriptor, Address)>,
    ) -> Result<Self> {
        if !listener.descriptor().is_valid() {
            return Err(Error::InvalidArgument);
        }
        let threads = threads.max(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let listen_fd = listener.descriptor().raw();

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let tx = tx.clone();
            let shutdown = shutdown.clone();
            let opts = opts.clone();
            let handle = thread::Builder::new()
                .name(format!("acceptor-{i}"))
                .spawn(move || accept_loop(listen_fd, opts, tx, shutdown))
                .map_err(Error::from)?;
            handles.push(handle);
        }

        Ok(AcceptorPool {
            listener,
            shutdown,
            handles,
        })
    }

    pub fn local_address(&self) -> &Address {
        self.listener.address()
    }

    /// Stop accepting: raise the flag and close the listening descriptor
    /// to unblock pending accepts. Idempotent.
    pub fn shutdown(&mut self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.listener.close_descriptor();
        }
    }

    /// Shut down and wait for every acceptor thread to exit.
    pub fn join(mut self) {
        self.shutdown();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for AcceptorPool {
    fn drop(&mut self) {
        self.shutdown();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn accept_loop(
    listen_fd: RawFd,
    opts: AcceptorOptions,
    tx: Sender<(Descriptor, Address)>,
    shutdown: Arc<AtomicBool>,
) {
    let mut peer_text = String::with_capacity(64);
    while !shutdown.load(Ordering::Acquire) {
        match accept_on(listen_fd, opts.accept_timeout, opts.overload_wait, &mut peer_text) {
            Ok(Some((sock, peer))) => {
                apply_conn_options(&sock, &opts);
                if tx.send((sock, peer)).is_err() {
                    // Registry gone; nothing left to accept for.
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                if !shutdown.load(Ordering::Acquire) {
                    error!(error = %e, "acceptor stopping on fatal accept error");
                }
                break;
            }
        }
    }
    debug!("acceptor thread exiting");
}
