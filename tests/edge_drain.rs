//! Edge-triggered draining discipline, driven through the registry with the
//! edge-interest backend. Linux only.
#![cfg(target_os = "linux")]

use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::IntoRawFd;
use std::os::unix::net::UnixStream;

use pollio::{
    Address, Backend, Conn, Descriptor, Endpoint, Error, Registry, Result, Stream,
};

/// Reads at most `chunk` bytes per wakeup; drains only when `drain` is set.
struct Reader {
    endpoint: Endpoint,
    chunk: usize,
    drain: bool,
    received: usize,
    wakeups: usize,
}

impl Reader {
    fn over(stream: UnixStream, chunk: usize, drain: bool) -> Self {
        Reader {
            endpoint: Endpoint::new(
                Descriptor::from_raw(stream.into_raw_fd()),
                Address::stream(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            ),
            chunk,
            drain,
            received: 0,
            wakeups: 0,
        }
    }
}

impl Conn for Reader {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }

    fn on_receive(&mut self, _max_bytes: usize, _now: f64) -> Result<usize> {
        self.wakeups += 1;
        let mut stream = self.endpoint.stream();
        let mut buf = vec![0u8; self.chunk];
        let mut total = 0;
        loop {
            match stream.read_some(&mut buf) {
                Ok(0) => return Err(Error::PeerClosed),
                Ok(n) => {
                    total += n;
                    self.received += n;
                    if !self.drain {
                        return Ok(total);
                    }
                }
                Err(Error::WouldBlock) => return Ok(total),
                Err(e) => return Err(e),
            }
        }
    }
}

const PAYLOAD: usize = 64 * 1024;

fn write_payload(peer: UnixStream) -> Descriptor {
    let tx = Descriptor::from_raw(peer.into_raw_fd());
    let data = vec![0xa5u8; PAYLOAD];
    // A 64 KiB burst fits the default socket buffer, so the blocking write
    // completes in one call.
    let sent = Stream::new(&tx).write_fully(&data).unwrap();
    assert_eq!(sent, PAYLOAD);
    tx
}

#[test]
fn draining_handler_consumes_the_whole_burst() {
    let mut registry = Registry::new(4, Backend::EdgeInterest).unwrap();
    assert!(registry.edge_triggered());

    let (local, peer) = UnixStream::pair().unwrap();
    let conn = Reader::over(local, 4096, true);
    let fd = conn.endpoint().fd();
    registry.join(conn).ok().unwrap();

    let _tx = write_payload(peer);

    for _ in 0..50 {
        registry.update(0.05).unwrap();
        if registry.get(fd).is_some_and(|c| c.received >= PAYLOAD) {
            break;
        }
    }

    let conn = registry.get(fd).expect("connection should still be joined");
    assert_eq!(
        conn.received, PAYLOAD,
        "draining handler must consume the entire burst"
    );
}

#[test]
fn undrained_data_starves_the_connection() {
    let mut registry = Registry::new(4, Backend::EdgeInterest).unwrap();

    let (local, peer) = UnixStream::pair().unwrap();
    // Reads a single 1 KiB chunk per wakeup and stops without draining.
    let conn = Reader::over(local, 1024, false);
    let fd = conn.endpoint().fd();
    registry.join(conn).ok().unwrap();

    let _tx = write_payload(peer);

    registry.update(1.0).unwrap();
    let after_first = registry.get(fd).unwrap().wakeups;
    assert!(after_first >= 1, "first transition must be reported");
    let received_first = registry.get(fd).unwrap().received;

    // Data is still buffered, but the edge backend reports transitions,
    // not levels: no new bytes, no new wakeups.
    for _ in 0..5 {
        registry.update(0.05).unwrap();
    }
    let conn = registry.get(fd).unwrap();
    assert_eq!(
        conn.wakeups, after_first,
        "edge backend woke an undrained connection again"
    );
    assert_eq!(conn.received, received_first);
}
