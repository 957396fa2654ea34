//! Boots a real server on ephemeral ports and drives it over real
//! sockets, one instance per test.
#![allow(dead_code)]

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use bodega::Settings;
use bodega_server::Server;

pub struct TestServer {
    pub tcp: SocketAddr,
    pub udp: Option<SocketAddr>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start() -> Self {
        Self::start_with(|_| {})
    }

    pub fn start_with(tweak: impl FnOnce(&mut Settings)) -> Self {
        let mut settings = Settings {
            tcp_port: Some(0),
            udp_port: Some(0),
            num_threads: 2,
            bind_addr: Some("127.0.0.1".parse().expect("loopback")),
            ..Settings::default()
        };
        tweak(&mut settings);
        let server = Server::bind(settings).expect("server bind");
        let tcp = server.tcp_addr().expect("tcp listener");
        let udp = server.udp_addr();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || {
            server.run(&flag).expect("server run");
        });
        Self { tcp, udp, shutdown, handle: Some(handle) }
    }

    pub fn client(&self) -> Client {
        Client::connect(self.tcp)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub struct Client {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect");
        stream.set_read_timeout(Some(Duration::from_secs(5))).expect("read timeout");
        stream.set_nodelay(true).expect("nodelay");
        Self { stream, pending: Vec::new() }
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("send");
    }

    /// Reads through the first occurrence of `pat` and returns everything
    /// up to and including it; later bytes stay buffered.
    pub fn read_until(&mut self, pat: &[u8]) -> Vec<u8> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(pos) = find_subslice(&self.pending, pat) {
                let rest = self.pending.split_off(pos + pat.len());
                return std::mem::replace(&mut self.pending, rest);
            }
            let n = self.stream.read(&mut chunk).expect("read");
            assert!(n > 0, "peer closed while waiting for {:?}", String::from_utf8_lossy(pat));
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    /// Reads one `\r\n`-terminated line.
    pub fn read_line(&mut self) -> Vec<u8> {
        self.read_until(b"\r\n")
    }

    pub fn expect(&mut self, exact: &[u8]) {
        let got = self.read_until(b"\r\n");
        assert_eq!(
            got,
            exact,
            "expected {:?}, got {:?}",
            String::from_utf8_lossy(exact),
            String::from_utf8_lossy(&got)
        );
    }

    /// Reads exactly `n` bytes (binary protocol framing).
    pub fn read_exact_n(&mut self, n: usize) -> Vec<u8> {
        while self.pending.len() < n {
            let mut chunk = [0u8; 4096];
            let got = self.stream.read(&mut chunk).expect("read");
            assert!(got > 0, "peer closed mid-frame");
            self.pending.extend_from_slice(&chunk[..got]);
        }
        let rest = self.pending.split_off(n);
        std::mem::replace(&mut self.pending, rest)
    }

    /// True when the peer has closed and no buffered bytes remain.
    pub fn at_eof(&mut self) -> bool {
        if !self.pending.is_empty() {
            return false;
        }
        let mut chunk = [0u8; 64];
        match self.stream.read(&mut chunk) {
            Ok(0) => true,
            Ok(n) => {
                self.pending.extend_from_slice(&chunk[..n]);
                false
            }
            Err(_) => false,
        }
    }

    pub fn stat_value(stats: &[u8], key: &str) -> Option<String> {
        let text = String::from_utf8_lossy(stats);
        text.lines()
            .find_map(|line| line.strip_prefix(&format!("STAT {key} ")))
            .map(str::to_string)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
