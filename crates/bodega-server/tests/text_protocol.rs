mod common;

use common::{Client, TestServer};

#[test]
fn set_then_get_roundtrips() {
    let server = TestServer::start();
    let mut c = server.client();

    c.send(b"set foo 0 0 6\r\nfooval\r\n");
    c.expect(b"STORED\r\n");

    c.send(b"get foo\r\n");
    let reply = c.read_until(b"END\r\n");
    assert_eq!(reply, b"VALUE foo 0 6\r\nfooval\r\nEND\r\n");
}

#[test]
fn delete_counts_hits_and_misses() {
    let server = TestServer::start();
    let mut c = server.client();

    c.send(b"set foo 0 0 6\r\nfooval\r\n");
    c.expect(b"STORED\r\n");
    c.send(b"delete foo\r\n");
    c.expect(b"DELETED\r\n");
    c.send(b"delete foo\r\n");
    c.expect(b"NOT_FOUND\r\n");

    c.send(b"stats\r\n");
    let stats = c.read_until(b"END\r\n");
    assert_eq!(Client::stat_value(&stats, "delete_hits").as_deref(), Some("1"));
    assert_eq!(Client::stat_value(&stats, "delete_misses").as_deref(), Some("1"));
}

#[test]
fn incr_decr_arithmetic() {
    let server = TestServer::start();
    let mut c = server.client();

    c.send(b"incr i 1\r\n");
    c.expect(b"NOT_FOUND\r\n");
    c.send(b"set n 0 0 1\r\n0\r\n");
    c.expect(b"STORED\r\n");
    c.send(b"incr n 3\r\n");
    c.expect(b"3\r\n");
    c.send(b"decr n 1\r\n");
    c.expect(b"2\r\n");
    // Decrement saturates at zero.
    c.send(b"decr n 10\r\n");
    c.expect(b"0\r\n");

    c.send(b"stats\r\n");
    let stats = c.read_until(b"END\r\n");
    assert_eq!(Client::stat_value(&stats, "incr_hits").as_deref(), Some("1"));
    assert_eq!(Client::stat_value(&stats, "incr_misses").as_deref(), Some("1"));
    assert_eq!(Client::stat_value(&stats, "decr_hits").as_deref(), Some("2"));
    assert_eq!(Client::stat_value(&stats, "decr_misses").as_deref(), Some("0"));
}

#[test]
fn non_numeric_value_refuses_arithmetic() {
    let server = TestServer::start();
    let mut c = server.client();

    c.send(b"set t 0 0 3\r\nabc\r\n");
    c.expect(b"STORED\r\n");
    c.send(b"incr t 1\r\n");
    c.expect(b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n");
}

#[test]
fn gets_and_cas() {
    let server = TestServer::start();
    let mut c = server.client();

    c.send(b"set a 5 0 3\r\nbar\r\n");
    c.expect(b"STORED\r\n");

    c.send(b"gets a\r\n");
    let reply = c.read_until(b"END\r\n");
    let text = String::from_utf8_lossy(&reply);
    let header = text.lines().next().expect("VALUE line");
    let mut fields = header.split(' ');
    assert_eq!(fields.next(), Some("VALUE"));
    assert_eq!(fields.next(), Some("a"));
    assert_eq!(fields.next(), Some("5"));
    assert_eq!(fields.next(), Some("3"));
    let cas: u64 = fields.next().expect("cas id").parse().expect("numeric cas");

    let stale = format!("cas a 5 0 3 {}\r\nbaz\r\n", cas + 1);
    c.send(stale.as_bytes());
    c.expect(b"EXISTS\r\n");

    let fresh = format!("cas a 5 0 3 {cas}\r\nbaz\r\n");
    c.send(fresh.as_bytes());
    c.expect(b"STORED\r\n");

    c.send(b"cas nosuch 0 0 1 1\r\nx\r\n");
    c.expect(b"NOT_FOUND\r\n");
}

#[test]
fn append_inherits_flags() {
    let server = TestServer::start();
    let mut c = server.client();

    c.send(b"set x 7 0 3\r\nabc\r\n");
    c.expect(b"STORED\r\n");
    c.send(b"append x 0 0 3\r\ndef\r\n");
    c.expect(b"STORED\r\n");

    c.send(b"get x\r\n");
    let reply = c.read_until(b"END\r\n");
    assert_eq!(reply, b"VALUE x 7 6\r\nabcdef\r\nEND\r\n");

    c.send(b"prepend x 0 0 2\r\n__\r\n");
    c.expect(b"STORED\r\n");
    c.send(b"get x\r\n");
    let reply = c.read_until(b"END\r\n");
    assert_eq!(reply, b"VALUE x 7 8\r\n__abcdef\r\nEND\r\n");

    c.send(b"append missing 0 0 1\r\nz\r\n");
    c.expect(b"NOT_FOUND\r\n");
}

#[test]
fn stats_counts_this_connection() {
    let server = TestServer::start();
    let mut c = server.client();

    c.send(b"stats\r\n");
    let stats = c.read_until(b"END\r\n");
    assert_eq!(Client::stat_value(&stats, "curr_connections").as_deref(), Some("1"));
    let cmd_get: u64 =
        Client::stat_value(&stats, "cmd_get").expect("cmd_get").parse().expect("numeric");

    c.send(b"get nothing\r\n");
    c.read_until(b"END\r\n");
    c.send(b"stats\r\n");
    let stats = c.read_until(b"END\r\n");
    let after: u64 =
        Client::stat_value(&stats, "cmd_get").expect("cmd_get").parse().expect("numeric");
    assert_eq!(after, cmd_get + 1);
    for key in ["pid", "uptime", "time", "version", "pointer_size", "limit_maxbytes", "threads"] {
        assert!(Client::stat_value(&stats, key).is_some(), "missing stat {key}");
    }
}

#[test]
fn unknown_command_keeps_connection_open() {
    let server = TestServer::start();
    let mut c = server.client();

    c.send(b"bogus\r\n");
    c.expect(b"ERROR\r\n");
    c.send(b"slabs reassign 1 2\r\n");
    c.expect(b"ERROR\r\n");
    c.send(b"version\r\n");
    let line = c.read_line();
    assert!(line.starts_with(b"VERSION "), "got {:?}", String::from_utf8_lossy(&line));
}

#[test]
fn oversized_key_is_a_client_error() {
    let server = TestServer::start();
    let mut c = server.client();

    let mut line = b"get ".to_vec();
    line.extend_from_slice(&[b'k'; 251]);
    line.extend_from_slice(b"\r\n");
    c.send(&line);
    c.expect(b"CLIENT_ERROR bad command line format\r\n");
}

#[test]
fn noreply_suppresses_the_reply() {
    let server = TestServer::start();
    let mut c = server.client();

    c.send(b"set q 0 0 1 noreply\r\n1\r\nget q\r\n");
    let reply = c.read_until(b"END\r\n");
    assert_eq!(reply, b"VALUE q 0 1\r\n1\r\nEND\r\n");
}

#[test]
fn pipelined_commands_run_in_order() {
    let server = TestServer::start();
    let mut c = server.client();

    c.send(b"set p 0 0 1\r\na\r\nset p 0 0 1\r\nb\r\nget p\r\n");
    c.expect(b"STORED\r\n");
    c.expect(b"STORED\r\n");
    let reply = c.read_until(b"END\r\n");
    assert_eq!(reply, b"VALUE p 0 1\r\nb\r\nEND\r\n");
}

#[test]
fn flush_all_empties_the_cache() {
    let server = TestServer::start();
    let mut c = server.client();

    c.send(b"set f 0 0 1\r\nx\r\n");
    c.expect(b"STORED\r\n");
    // The flush marker is current_time - 1: items stored in the very same
    // second survive, so step past the second boundary first.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    c.send(b"flush_all\r\n");
    c.expect(b"OK\r\n");
    c.send(b"get f\r\n");
    let reply = c.read_until(b"END\r\n");
    assert_eq!(reply, b"END\r\n");

    // Items stored after the flush live on.
    c.send(b"set g 0 0 1\r\ny\r\n");
    c.expect(b"STORED\r\n");
    c.send(b"get g\r\n");
    let reply = c.read_until(b"END\r\n");
    assert_eq!(reply, b"VALUE g 0 1\r\ny\r\nEND\r\n");
}

#[test]
fn flush_all_zero_delay_flushes_now() {
    let server = TestServer::start();
    let mut c = server.client();

    c.send(b"set f 0 0 1\r\nx\r\n");
    c.expect(b"STORED\r\n");
    std::thread::sleep(std::time::Duration::from_millis(1100));
    // A zero delay is the common spelling of an immediate flush.
    c.send(b"flush_all 0\r\n");
    c.expect(b"OK\r\n");
    c.send(b"get f\r\n");
    let reply = c.read_until(b"END\r\n");
    assert_eq!(reply, b"END\r\n");
}

#[test]
fn oversized_value_is_rejected() {
    let server = TestServer::start();
    let mut c = server.client();

    c.send(b"set big 0 0 2097152\r\n");
    c.expect(b"SERVER_ERROR object too large for cache\r\n");
}

#[test]
fn bad_trailer_is_a_client_error() {
    let server = TestServer::start();
    let mut c = server.client();

    // 3 declared bytes but the payload slot holds "abXY": trailer check
    // fails without desyncing the stream.
    c.send(b"set t 0 0 2\r\nabXY\r\n");
    c.expect(b"CLIENT_ERROR bad data chunk\r\n");
}

#[test]
fn multiple_keys_one_get() {
    let server = TestServer::start();
    let mut c = server.client();

    c.send(b"set k1 0 0 1\r\na\r\n");
    c.expect(b"STORED\r\n");
    c.send(b"set k2 0 0 1\r\nb\r\n");
    c.expect(b"STORED\r\n");

    c.send(b"get k1 missing k2\r\n");
    let reply = c.read_until(b"END\r\n");
    assert_eq!(reply, b"VALUE k1 0 1\r\na\r\nVALUE k2 0 1\r\nb\r\nEND\r\n");
}

#[test]
fn verbosity_acknowledges() {
    let server = TestServer::start();
    let mut c = server.client();
    c.send(b"verbosity 1\r\n");
    c.expect(b"OK\r\n");
    c.send(b"stats reset\r\n");
    c.expect(b"RESET\r\n");
}
