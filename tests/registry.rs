//! Registry lifecycle properties driven over socket pairs: batch joins,
//! dispatch ordering, descriptor cleanup, and the errored-set contract.

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use pollio::{
    Address, Backend, Conn, Descriptor, Endpoint, Error, Registry, Result, Stream,
};

type EventLog = Rc<RefCell<Vec<(RawFd, &'static str)>>>;

/// Test connection that records which callbacks ran, in order.
struct Probe {
    endpoint: Endpoint,
    log: EventLog,
    wants_send: bool,
    /// What `on_receive` should do: read and report, or fail outright.
    fail_receive: Option<Error>,
}

impl Probe {
    fn over(stream: UnixStream, log: &EventLog) -> Self {
        Probe {
            endpoint: Endpoint::new(
                Descriptor::from_raw(stream.into_raw_fd()),
                Address::stream(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            ),
            log: log.clone(),
            wants_send: false,
            fail_receive: None,
        }
    }
}

impl Conn for Probe {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }

    fn on_receive(&mut self, _max_bytes: usize, _now: f64) -> Result<usize> {
        self.log.borrow_mut().push((self.endpoint.fd(), "recv"));
        if let Some(e) = self.fail_receive {
            return Err(e);
        }
        let mut buf = [0u8; 1024];
        match self.endpoint.stream().read_some(&mut buf) {
            Ok(0) => Err(Error::PeerClosed),
            Ok(n) => Ok(n),
            Err(Error::WouldBlock) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn on_send(&mut self, _max_bytes: usize) -> Result<usize> {
        self.log.borrow_mut().push((self.endpoint.fd(), "send"));
        Ok(0)
    }

    fn on_error(&mut self, _native_code: i32) {
        self.log.borrow_mut().push((self.endpoint.fd(), "error"));
    }

    fn on_close(&mut self) {
        self.log.borrow_mut().push((self.endpoint.fd(), "close"));
    }

    fn wants_send_events(&self) -> bool {
        self.wants_send
    }
}

fn fd_is_open(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) >= 0 }
}

#[test]
fn batch_join_with_one_duplicate_inserts_the_rest() {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let mut registry = Registry::new(256, Backend::LevelSet).unwrap();

    let mut peers = Vec::new();
    let mut batch = Vec::new();
    for _ in 0..100 {
        let (local, peer) = UnixStream::pair().unwrap();
        peers.push(peer);
        batch.push(Probe::over(local, &log));
    }

    // Make element 50 collide with element 49's descriptor.
    let dup_fd = batch[49].endpoint().fd();
    batch[50].endpoint_mut().descriptor_mut().reset(dup_fd);

    let (joined, rejected) = registry.join_batch(batch);
    assert_eq!(joined, 99);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].error, Error::InvalidArgument);
    assert_eq!(registry.len(), 99);

    // The collision victim is untouched and still registered.
    assert!(registry.contains(dup_fd));
    assert!(fd_is_open(dup_fd));

    // Forget the duplicate's borrowed handle before dropping it so it
    // cannot close the descriptor the registry owns.
    let mut rejects = rejected;
    rejects[0].conn.endpoint_mut().descriptor_mut().release();
}

#[test]
fn recv_dispatch_precedes_send_dispatch() {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let mut registry = Registry::new(8, Backend::LevelSet).unwrap();

    // One connection with pending inbound data...
    let (local_a, peer_a) = UnixStream::pair().unwrap();
    let reader = Probe::over(local_a, &log);
    let reader_fd = reader.endpoint().fd();
    registry.join(reader).ok().unwrap();

    let mut tx = Descriptor::from_raw(peer_a.into_raw_fd());
    Stream::new(&tx).write_fully(b"data").unwrap();

    // ...and one that only wants send readiness (always writable).
    let (local_b, _peer_b) = UnixStream::pair().unwrap();
    let mut writer = Probe::over(local_b, &log);
    writer.wants_send = true;
    let writer_fd = writer.endpoint().fd();
    registry.join(writer).ok().unwrap();

    registry.update(1.0).unwrap();

    let events = log.borrow().clone();
    let recv_pos = events
        .iter()
        .position(|&(fd, what)| fd == reader_fd && what == "recv")
        .expect("reader never got its recv callback");
    let send_pos = events
        .iter()
        .position(|&(fd, what)| fd == writer_fd && what == "send")
        .expect("writer never got its send callback");
    assert!(
        recv_pos < send_pos,
        "recv must dispatch before send within a cycle: {events:?}"
    );

    tx.close();
    registry.clear();
}

#[test]
fn handler_failure_enrolls_into_snapshot_with_close() {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let mut registry = Registry::new(8, Backend::LevelSet).unwrap();

    let (local, peer) = UnixStream::pair().unwrap();
    let mut probe = Probe::over(local, &log);
    probe.fail_receive = Some(Error::Os(libc::EIO));
    let fd = probe.endpoint().fd();
    registry.join(probe).ok().unwrap();

    let tx = Descriptor::from_raw(peer.into_raw_fd());
    Stream::new(&tx).write_fully(b"x").unwrap();

    registry.update(1.0).unwrap();

    let snapshot = registry.error_snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].endpoint().fd(), fd);
    assert!(!registry.contains(fd));

    let events = log.borrow().clone();
    assert!(events.contains(&(fd, "close")));
}

#[test]
fn graceful_peer_close_reports_bytes_then_errors() {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let mut registry = Registry::new(8, Backend::LevelSet).unwrap();

    let (local, peer) = UnixStream::pair().unwrap();
    let probe = Probe::over(local, &log);
    let fd = probe.endpoint().fd();
    registry.join(probe).ok().unwrap();

    {
        let tx = Descriptor::from_raw(peer.into_raw_fd());
        Stream::new(&tx).write_fully(b"HELLO").unwrap();
        // tx drops here: orderly close after 5 bytes.
    }

    // First cycle reads the 5 bytes.
    registry.update(1.0).unwrap();
    assert!(registry.error_snapshot().is_empty());
    assert_eq!(registry.get(fd).unwrap().endpoint().recv_total(), 5);

    // Second cycle sees the orderly close and errors the connection.
    registry.update(1.0).unwrap();
    let snapshot = registry.error_snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].endpoint().recv_total(), 5);

    let events = log.borrow().clone();
    assert!(events.contains(&(fd, "close")), "on_close must fire: {events:?}");
}

#[test]
fn errored_set_is_drained_at_the_start_of_each_update() {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let mut registry = Registry::new(8, Backend::LevelSet).unwrap();

    let (local, peer) = UnixStream::pair().unwrap();
    let probe = Probe::over(local, &log);
    let fd = probe.endpoint().fd();
    registry.join(probe).ok().unwrap();
    drop(peer);

    registry.update(1.0).unwrap();
    // Snapshot intentionally NOT consumed; the next update must release it.
    registry.update(0.0).unwrap();
    assert!(registry.error_snapshot().is_empty());
    assert!(!fd_is_open(fd), "unconsumed errored connection must be closed");
}

#[test]
fn unjoin_is_a_no_op_on_unknown_descriptors() {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let mut registry = Registry::new(8, Backend::LevelSet).unwrap();

    let (local, _peer) = UnixStream::pair().unwrap();
    let probe = Probe::over(local, &log);
    let fd = probe.endpoint().fd();
    registry.join(probe).ok().unwrap();

    assert!(registry.unjoin(fd).is_some());
    assert!(registry.unjoin(fd).is_none());
    assert!(registry.unjoin(9999).is_none());

    let events = log.borrow().clone();
    assert_eq!(
        events.iter().filter(|&&(f, w)| f == fd && w == "close").count(),
        1,
        "on_close fires exactly once"
    );
}

#[test]
fn clear_closes_every_descriptor() {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let mut registry = Registry::new(32, Backend::LevelSet).unwrap();

    let mut fds = Vec::new();
    let mut peers = Vec::new();
    for _ in 0..8 {
        let (local, peer) = UnixStream::pair().unwrap();
        let probe = Probe::over(local, &log);
        fds.push(probe.endpoint().fd());
        peers.push(peer);
        registry.join(probe).ok().unwrap();
    }
    assert_eq!(registry.len(), 8);

    registry.clear();
    assert_eq!(registry.len(), 0);
    for fd in fds {
        assert!(!fd_is_open(fd), "descriptor {fd} leaked after clear");
    }
}

#[test]
fn snapshot_connections_keep_their_descriptors_until_dropped() {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let mut registry = Registry::new(8, Backend::LevelSet).unwrap();

    let (local, peer) = UnixStream::pair().unwrap();
    let probe = Probe::over(local, &log);
    let fd = probe.endpoint().fd();
    registry.join(probe).ok().unwrap();
    drop(peer);

    registry.update(1.0).unwrap();
    let snapshot = registry.error_snapshot();
    assert_eq!(snapshot.len(), 1);
    // Ownership moved out: the fd stays open until the caller drops it.
    assert!(fd_is_open(fd));
    drop(snapshot);
    assert!(!fd_is_open(fd));
}
