//! Readiness-based TCP connection engine.
//!
//! One contract over three native readiness mechanisms — a level-triggered
//! `select` bitmap, an edge-triggered `epoll` interest list, and a
//! `kqueue` dual-filter queue — plus the connection lifecycle machinery on
//! top of it: a single-threaded [`Registry`] that classifies readiness
//! into receive/send/error partitions and dispatches to [`Conn`]
//! handlers, and a multi-threaded [`AcceptorPool`] feeding accepted
//! sockets to the registry owner over an MPSC handoff queue.
//!
//! Application protocols sit on top: implement [`Conn`] for your
//! connection type, read and write through [`Stream`], and consume
//! [`Registry::error_snapshot`] after each update cycle.

pub mod acceptor;
pub mod addr;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod logging;
pub mod metrics;
pub mod notifier;
pub mod registry;
pub mod server;
pub mod socket;
pub mod stream;

// Public API re-exports
pub use acceptor::{Acceptor, AcceptorOptions, AcceptorPool};
pub use addr::{Address, Family, FamilyPref, SocketKind, resolve, resolve_scheme, scheme_port};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{Config, KeepAlive, LogFormat, LoggingConfig};
pub use connection::{Conn, DEFAULT_RECV_TIMEOUT, Endpoint};
pub use error::{Error, Result};
pub use event::{EventKind, EventList, EventRecord};
pub use notifier::{Backend, Interest, Notifier};
pub use registry::{Registry, Rejected};
pub use server::{Server, ServerBuilder};
pub use socket::{Descriptor, Socket, startup};
pub use stream::Stream;
