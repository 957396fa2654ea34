use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bodega::Settings;
use bodega_server::Server;

#[test]
fn unix_socket_serves_text_protocol() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bodega.sock");

    let settings = Settings {
        tcp_port: None,
        udp_port: None,
        unix_socket: Some(path.clone()),
        num_threads: 1,
        ..Settings::default()
    };
    let server = Server::bind(settings).expect("bind");
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let handle = std::thread::spawn(move || server.run(&flag).expect("run"));

    let mut stream = UnixStream::connect(&path).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(5))).expect("timeout");

    stream.write_all(b"set s 0 0 2\r\nok\r\n").expect("send");
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.ends_with(b"STORED\r\n") {
        let n = stream.read(&mut chunk).expect("read");
        assert!(n > 0, "peer closed early");
        buf.extend_from_slice(&chunk[..n]);
    }

    stream.write_all(b"get s\r\n").expect("send");
    buf.clear();
    while !buf.ends_with(b"END\r\n") {
        let n = stream.read(&mut chunk).expect("read");
        assert!(n > 0, "peer closed early");
        buf.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(buf, b"VALUE s 0 2\r\nok\r\nEND\r\n");

    shutdown.store(true, Ordering::Relaxed);
    let _ = handle.join();
}
