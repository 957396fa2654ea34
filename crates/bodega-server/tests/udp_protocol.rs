mod common;

use std::{net::UdpSocket, time::Duration};

use common::TestServer;

fn udp_client(server: &TestServer) -> (UdpSocket, std::net::SocketAddr) {
    let target = server.udp.expect("udp enabled");
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind client socket");
    socket.set_read_timeout(Some(Duration::from_secs(5))).expect("timeout");
    (socket, target)
}

fn framed(request_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&request_id.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // seq
    out.extend_from_slice(&1u16.to_be_bytes()); // total
    out.extend_from_slice(&0u16.to_be_bytes()); // reserved
    out.extend_from_slice(payload);
    out
}

fn recv(socket: &UdpSocket) -> (u16, u16, u16, Vec<u8>) {
    let mut buf = [0u8; 65536];
    let (n, _) = socket.recv_from(&mut buf).expect("recv");
    assert!(n >= 8, "datagram shorter than the frame header");
    let request_id = u16::from_be_bytes([buf[0], buf[1]]);
    let seq = u16::from_be_bytes([buf[2], buf[3]]);
    let total = u16::from_be_bytes([buf[4], buf[5]]);
    (request_id, seq, total, buf[8..n].to_vec())
}

#[test]
fn get_over_udp() {
    let server = TestServer::start();
    let mut tcp = server.client();
    tcp.send(b"set foo 0 0 6\r\nfooval\r\n");
    tcp.expect(b"STORED\r\n");

    let (socket, target) = udp_client(&server);
    socket.send_to(&framed(0x1234, b"get foo\r\n"), target).expect("send");
    let (request_id, seq, total, payload) = recv(&socket);
    assert_eq!(request_id, 0x1234);
    assert_eq!(seq, 0);
    assert_eq!(total, 1);
    assert_eq!(payload, b"VALUE foo 0 6\r\nfooval\r\nEND\r\n");
}

#[test]
fn set_over_udp() {
    let server = TestServer::start();
    let (socket, target) = udp_client(&server);

    socket.send_to(&framed(7, b"set u 0 0 3\r\nxyz\r\n"), target).expect("send");
    let (_, _, _, payload) = recv(&socket);
    assert_eq!(payload, b"STORED\r\n");

    let mut tcp = server.client();
    tcp.send(b"get u\r\n");
    let reply = tcp.read_until(b"END\r\n");
    assert_eq!(reply, b"VALUE u 0 3\r\nxyz\r\nEND\r\n");
}

#[test]
fn multi_packet_requests_are_rejected() {
    let server = TestServer::start();
    let (socket, target) = udp_client(&server);

    let mut dgram = Vec::new();
    dgram.extend_from_slice(&9u16.to_be_bytes());
    dgram.extend_from_slice(&0u16.to_be_bytes());
    dgram.extend_from_slice(&2u16.to_be_bytes()); // total = 2
    dgram.extend_from_slice(&0u16.to_be_bytes());
    dgram.extend_from_slice(b"get foo\r\n");
    socket.send_to(&dgram, target).expect("send");
    let (request_id, _, _, payload) = recv(&socket);
    assert_eq!(request_id, 9);
    assert_eq!(payload, b"SERVER_ERROR multi-packet request not supported\r\n");
}

#[test]
fn large_replies_span_datagrams() {
    let server = TestServer::start();
    let mut tcp = server.client();
    let value = vec![b'v'; 3000];
    tcp.send(format!("set big 0 0 {}\r\n", value.len()).as_bytes());
    tcp.send(&value);
    tcp.send(b"\r\n");
    tcp.expect(b"STORED\r\n");

    let (socket, target) = udp_client(&server);
    socket.send_to(&framed(3, b"get big\r\n"), target).expect("send");

    let mut parts = Vec::new();
    let (_, seq, total, payload) = recv(&socket);
    parts.push((seq, payload));
    for _ in 1..total {
        let (_, seq, t, payload) = recv(&socket);
        assert_eq!(t, total);
        parts.push((seq, payload));
    }
    assert!(total > 1, "a 3000 byte value cannot fit one datagram");
    parts.sort_by_key(|(seq, _)| *seq);
    let joined: Vec<u8> = parts.into_iter().flat_map(|(_, p)| p).collect();
    let mut expected = b"VALUE big 0 3000\r\n".to_vec();
    expected.extend_from_slice(&value);
    expected.extend_from_slice(b"\r\nEND\r\n");
    assert_eq!(joined, expected);
}
