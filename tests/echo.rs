//! End-to-end echo server exercising the full pipeline: acceptor thread,
//! handoff queue, registry dispatch, and error snapshot.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use pollio::{Address, Config, Conn, Descriptor, Endpoint, Error, Result, ServerBuilder};

struct EchoConn {
    endpoint: Endpoint,
    buf: Vec<u8>,
    edge: bool,
}

impl Conn for EchoConn {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }

    fn on_receive(&mut self, _max_bytes: usize, _now: f64) -> Result<usize> {
        let mut stream = self.endpoint.stream();
        let mut total = 0;
        loop {
            match stream.read_some(&mut self.buf) {
                Ok(0) => return Err(Error::PeerClosed),
                Ok(n) => {
                    total += n;
                    stream.write_fully(&self.buf[..n])?;
                    if !self.edge {
                        return Ok(total);
                    }
                }
                Err(Error::WouldBlock) => return Ok(total),
                Err(e) => return Err(e),
            }
        }
    }
}

fn launch_echo(config: Config) -> pollio::Server<EchoConn> {
    ServerBuilder::new(config)
        .bind("127.0.0.1:0")
        .launch(|sock: Descriptor, peer: Address| EchoConn {
            endpoint: Endpoint::new(sock, peer),
            buf: vec![0u8; 8192],
            edge: cfg!(target_os = "linux"),
        })
        .expect("failed to launch echo server")
}

#[test]
fn echo_single_connection_then_snapshot_exactly_once() {
    let mut config = Config::new(4);
    config.accept_timeout_seconds = 0.1;
    config.tcp_no_delay = true;
    let mut server = launch_echo(config);

    let target = server.local_address().to_socket_addr();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(target).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(b"PING\n").unwrap();

        let mut got = Vec::new();
        let mut buf = [0u8; 64];
        while got.len() < 5 {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "server closed before echoing");
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&got, b"PING\n");
        // Dropping the stream closes it; the server should then report the
        // connection in an error snapshot.
    });

    let mut errored = 0;
    for _ in 0..200 {
        server.update(0.05).unwrap();
        errored += server.error_snapshot().len();
        if errored > 0 && client.is_finished() {
            break;
        }
    }
    client.join().unwrap();
    assert_eq!(errored, 1, "connection must error exactly once");
    assert_eq!(server.connection_count(), 0);

    server.shutdown();
}

#[test]
fn echo_multiple_clients() {
    let mut config = Config::new(16);
    config.accept_timeout_seconds = 0.1;
    config.acceptor_threads = 2;
    let mut server = launch_echo(config);

    let target = server.local_address().to_socket_addr();
    let mut clients = Vec::new();
    for i in 0..4 {
        clients.push(thread::spawn(move || {
            let mut stream = TcpStream::connect(target).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let message = format!("hello-{i}");
            stream.write_all(message.as_bytes()).unwrap();

            let mut got = vec![0u8; message.len()];
            stream.read_exact(&mut got).unwrap();
            assert_eq!(got, message.as_bytes());
        }));
    }

    for _ in 0..200 {
        server.update(0.05).unwrap();
        let _ = server.error_snapshot();
        if clients.iter().all(|c| c.is_finished()) {
            break;
        }
    }
    for client in clients {
        client.join().unwrap();
    }

    server.shutdown();
}

#[test]
fn connection_count_tracks_joins_and_errors() {
    let mut config = Config::new(4);
    config.accept_timeout_seconds = 0.1;
    let mut server = launch_echo(config);
    let target = server.local_address().to_socket_addr();

    let stream = TcpStream::connect(target).unwrap();
    for _ in 0..100 {
        server.update(0.05).unwrap();
        if server.connection_count() == 1 {
            break;
        }
    }
    assert_eq!(server.connection_count(), 1);

    drop(stream);
    let mut errored = 0;
    for _ in 0..100 {
        server.update(0.05).unwrap();
        errored += server.error_snapshot().len();
        if errored > 0 {
            break;
        }
    }
    assert_eq!(errored, 1);
    assert_eq!(server.connection_count(), 0);
}
