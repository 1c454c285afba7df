use pollio::{Address, Config, Conn, Descriptor, Endpoint, Error, Result, ServerBuilder};

struct EchoConn {
    endpoint: Endpoint,
    buf: Vec<u8>,
    edge: bool,
}

impl EchoConn {
    fn new(sock: Descriptor, peer: Address, edge: bool) -> Self {
        EchoConn {
            endpoint: Endpoint::new(sock, peer),
            buf: vec![0u8; 16 * 1024],
            edge,
        }
    }
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
                        // Level-triggered backend re-reports leftovers.
                        return Ok(total);
                    }
                }
                Err(Error::WouldBlock) => return Ok(total),
                Err(e) => return Err(e),
            }
        }
    }

    fn on_error(&mut self, native_code: i32) {
        eprintln!(
            "connection {} error (errno {native_code})",
            self.endpoint.peer()
        );
    }

    fn on_close(&mut self) {
        eprintln!(
            "connection {} closed after {} bytes in / {} bytes out",
            self.endpoint.peer(),
            self.endpoint.recv_total(),
            self.endpoint.send_total()
        );
    }
}

fn main() {
    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string());

    let mut config = Config::new(1024);
    config.tcp_no_delay = true;
    config.accept_timeout_seconds = 1.0;
    pollio::logging::init(&config.logging);

    let mut server = ServerBuilder::new(config)
        .bind(&bind_addr)
        .launch(|sock, peer| EchoConn::new(sock, peer, cfg!(target_os = "linux")))
        .expect("failed to launch server");

    eprintln!("echo server listening on {}", server.local_address());

    loop {
        if let Err(e) = server.update(0.5) {
            eprintln!("update failed: {e}");
            break;
        }
        for conn in server.error_snapshot() {
            drop(conn);
        }
    }
}
