//! Text-protocol command execution: parses one line at a time off the
//! connection's read buffer, runs it against the store, and assembles the
//! reply fragments.

use std::io::Write as _;
use std::sync::atomic::Ordering;

use bodega::{DeltaError, DeltaOp, StoreError, StoreOutcome, StoreVerb};
use bodega_proto::text::{self, ParseError, StoreKind, TextCommand, reply};
use bytes::Bytes;
use tracing::debug;

use crate::conn::{Conn, Ctx, PendingStore, State};

/// Tries to carve one complete command line off the read buffer.
/// Returns false when no full line has arrived yet.
pub(crate) fn try_dispatch(conn: &mut Conn, ctx: &Ctx) -> bool {
    let Some((line, consumed)) = text::find_line(conn.rbuf.remaining()) else {
        return false;
    };
    let line = line.to_vec();
    conn.rbuf.consume(consumed);
    execute(conn, ctx, &line);
    true
}

fn execute(conn: &mut Conn, ctx: &Ctx, line: &[u8]) {
    match text::parse_command(line) {
        Ok(TextCommand::Get { keys, with_cas }) => process_get(conn, ctx, &keys, with_cas),
        Ok(TextCommand::Store { kind, key, flags, exptime, bytes, cas_id, noreply }) => {
            conn.noreply = noreply;
            process_update(conn, ctx, kind, key, flags, exptime, bytes, cas_id);
        }
        Ok(TextCommand::Delete { key, noreply }) => {
            conn.noreply = noreply;
            process_delete(conn, ctx, key);
        }
        Ok(TextCommand::Arith { key, delta, incr, noreply }) => {
            conn.noreply = noreply;
            process_arith(conn, ctx, key, delta, incr);
        }
        Ok(TextCommand::Stats { args }) => process_stats(conn, ctx, &args),
        Ok(TextCommand::FlushAll { delay, noreply }) => {
            conn.noreply = noreply;
            process_flush_all(conn, ctx, delay);
        }
        Ok(TextCommand::Verbosity { level, noreply }) => {
            conn.noreply = noreply;
            ctx.shared.verbosity.store(level, Ordering::Relaxed);
            out_static(conn, reply::OK);
        }
        Ok(TextCommand::Version) => {
            out_owned(conn, format!("VERSION {}\r\n", crate::server::VERSION));
        }
        Ok(TextCommand::Quit) => conn.state = State::Closing,
        Err(ParseError::BadFormat) => {
            out_error_static(conn, b"CLIENT_ERROR bad command line format\r\n");
        }
        Err(ParseError::BadDelta) => {
            out_error_static(conn, b"CLIENT_ERROR invalid numeric delta argument\r\n");
        }
        Err(ParseError::Unknown) => out_error_static(conn, reply::ERROR),
    }
}

fn process_get(conn: &mut Conn, ctx: &Ctx, keys: &[&[u8]], with_cas: bool) {
    for &key in keys {
        let found = ctx.shared.store.get(key);
        match found {
            Some(item) => {
                ctx.shared.stats.with_worker(ctx.worker, |w| {
                    w.get_cmds += 1;
                    w.classes[item.class() as usize].get_hits += 1;
                });
                let mut head = ctx.shared.suffix_pool.acquire();
                head.extend_from_slice(reply::VALUE);
                head.extend_from_slice(key);
                if with_cas {
                    let _ = write!(
                        head,
                        " {} {} {}\r\n",
                        item.flags(),
                        item.data().len().saturating_sub(2),
                        item.cas()
                    );
                } else {
                    head.extend_from_slice(item.suffix());
                }
                conn.reply.add_suffix(head);
                conn.reply.add_shared(item.data().clone());
                conn.reply.hold_item(item);
            }
            None => ctx.shared.stats.with_worker(ctx.worker, |w| {
                w.get_cmds += 1;
                w.get_misses += 1;
            }),
        }
    }
    conn.reply.add_static(reply::END);
    conn.state = State::Write;
    conn.write_and_go = State::NewCmd;
}

#[allow(clippy::too_many_arguments)]
fn process_update(
    conn: &mut Conn,
    ctx: &Ctx,
    kind: StoreKind,
    key: &[u8],
    flags: u32,
    exptime: i64,
    bytes: usize,
    cas_id: u64,
) {
    let verb = match kind {
        StoreKind::Set => StoreVerb::Set,
        StoreKind::Add => StoreVerb::Add,
        StoreKind::Replace => StoreVerb::Replace,
        StoreKind::Append => StoreVerb::Append,
        StoreKind::Prepend => StoreVerb::Prepend,
        StoreKind::Cas => StoreVerb::Cas(cas_id),
    };
    let wire_len = bytes + 2;
    match ctx.shared.store.classify(key, wire_len) {
        Ok(class) => {
            conn.pending = Some(PendingStore {
                verb,
                key: key.to_vec(),
                flags,
                exptime: ctx.shared.clock.realtime(exptime),
                data: Vec::with_capacity(wire_len),
                class,
                append_crlf: false,
                quiet: false,
            });
            conn.rlbytes = wire_len;
            conn.state = State::Nread;
        }
        Err(err) => {
            // Payload still has to come off the wire before the next
            // command; discard it after the error reply.
            conn.swallow_bytes = wire_len;
            if conn.noreply {
                conn.state = State::Swallow;
            } else {
                out_store_error(conn, err);
                conn.write_and_go = State::Swallow;
            }
        }
    }
}

/// Payload fully ingested: check the trailer, run the store verb, reply.
pub(crate) fn complete_store(conn: &mut Conn, ctx: &Ctx) {
    let pending = conn.pending.take().expect("complete without a pending store");
    if !pending.data.ends_with(b"\r\n") {
        out_static(conn, b"CLIENT_ERROR bad data chunk\r\n");
        return;
    }
    ctx.shared
        .stats
        .with_worker(ctx.worker, |w| w.classes[pending.class as usize].set_cmds += 1);
    let result = ctx.shared.store.store(
        &pending.key,
        pending.flags,
        pending.exptime,
        Bytes::from(pending.data),
        pending.verb,
    );
    match result {
        Ok((StoreOutcome::Stored, _)) => out_static(conn, reply::STORED),
        Ok((StoreOutcome::NotStored, _)) => out_static(conn, reply::NOT_STORED),
        Ok((StoreOutcome::Exists, _)) => out_static(conn, reply::EXISTS),
        Ok((StoreOutcome::NotFound, _)) => out_static(conn, reply::NOT_FOUND),
        Err(err) => out_store_error(conn, err),
    }
}

fn process_delete(conn: &mut Conn, ctx: &Ctx, key: &[u8]) {
    match ctx.shared.store.delete(key) {
        Some(item) => {
            ctx.shared
                .stats
                .with_worker(ctx.worker, |w| w.classes[item.class() as usize].delete_hits += 1);
            out_static(conn, reply::DELETED);
        }
        None => {
            ctx.shared.stats.with_worker(ctx.worker, |w| w.delete_misses += 1);
            out_static(conn, reply::NOT_FOUND);
        }
    }
}

fn process_arith(conn: &mut Conn, ctx: &Ctx, key: &[u8], delta: u64, incr: bool) {
    let op = if incr { DeltaOp::Incr } else { DeltaOp::Decr };
    match ctx.shared.store.add_delta(key, delta, op) {
        Ok((value, item)) => {
            ctx.shared.stats.with_worker(ctx.worker, |w| {
                let class = &mut w.classes[item.class() as usize];
                if incr {
                    class.incr_hits += 1;
                } else {
                    class.decr_hits += 1;
                }
            });
            out_owned(conn, format!("{value}\r\n"));
        }
        Err(DeltaError::NotFound) => {
            ctx.shared.stats.with_worker(ctx.worker, |w| {
                if incr {
                    w.incr_misses += 1;
                } else {
                    w.decr_misses += 1;
                }
            });
            out_static(conn, reply::NOT_FOUND);
        }
        Err(DeltaError::NonNumeric) => {
            out_static(conn, b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n");
        }
        Err(DeltaError::Store(err)) => out_store_error(conn, err),
    }
}

fn process_stats(conn: &mut Conn, ctx: &Ctx, args: &[&[u8]]) {
    match args {
        [] => {
            let mut out = String::new();
            for (k, v) in crate::server::stat_pairs(ctx.shared) {
                out.push_str(&format!("STAT {k} {v}\r\n"));
            }
            out.push_str("END\r\n");
            out_owned(conn, out);
        }
        [sub] if *sub == b"reset".as_slice() => {
            ctx.shared.stats.reset();
            out_static(conn, reply::RESET);
        }
        [sub, what] if *sub == b"detail".as_slice() => match *what {
            b"on" => {
                ctx.shared.detail_enabled.store(true, Ordering::Relaxed);
                out_static(conn, reply::OK);
            }
            b"off" => {
                ctx.shared.detail_enabled.store(false, Ordering::Relaxed);
                out_static(conn, reply::OK);
            }
            b"dump" => {
                if ctx.shared.detail_enabled.load(Ordering::Relaxed) {
                    out_static(conn, reply::END);
                } else {
                    out_error_static(conn, b"CLIENT_ERROR stats detail not enabled\r\n");
                }
            }
            _ => out_error_static(conn, b"CLIENT_ERROR usage: stats detail on|off|dump\r\n"),
        },
        [sub, class, limit] if *sub == b"cachedump".as_slice() => {
            let parsed = parse_usize(class).zip(parse_usize(limit));
            let Some((class, limit)) = parsed else {
                out_error_static(conn, b"CLIENT_ERROR bad command line format\r\n");
                return;
            };
            let mut out = String::new();
            for (key, size, exp) in ctx.shared.store.cachedump(class as u8, limit) {
                out.push_str(&format!(
                    "ITEM {} [{} b; {} s]\r\n",
                    String::from_utf8_lossy(&key),
                    size,
                    exp
                ));
            }
            out.push_str("END\r\n");
            out_owned(conn, out);
        }
        _ => out_error_static(conn, reply::ERROR),
    }
}

fn process_flush_all(conn: &mut Conn, ctx: &Ctx, delay: Option<i64>) {
    let now = ctx.shared.clock.refresh_now();
    // A zero delay means "now": realtime(0) is the never-expires sentinel
    // and would disable the marker instead.
    let marker = match delay {
        Some(d) if d != 0 => ctx.shared.clock.realtime(d).saturating_sub(1),
        _ => now.saturating_sub(1),
    };
    ctx.shared.store.set_oldest_live(marker);
    ctx.shared.store.flush_expired();
    debug!(marker, "flush_all");
    out_static(conn, reply::OK);
}

fn out_store_error(conn: &mut Conn, err: StoreError) {
    match err {
        StoreError::TooLarge => out_static(conn, b"SERVER_ERROR object too large for cache\r\n"),
        StoreError::OutOfMemory => {
            out_static(conn, b"SERVER_ERROR out of memory storing object\r\n");
        }
    }
}

/// Queues a canned reply, honoring `noreply`.
fn out_static(conn: &mut Conn, token: &'static [u8]) {
    if conn.noreply {
        conn.state = State::NewCmd;
        return;
    }
    out_error_static(conn, token);
}

/// Queues a canned reply unconditionally (parse and framing errors reply
/// even before `noreply` could have been read).
pub(crate) fn out_error_static(conn: &mut Conn, token: &'static [u8]) {
    conn.reply.add_static(token);
    conn.state = State::Write;
    conn.write_and_go = State::NewCmd;
}

fn out_owned(conn: &mut Conn, body: String) {
    if conn.noreply {
        conn.state = State::NewCmd;
        return;
    }
    conn.reply.add_shared(Bytes::from(body));
    conn.state = State::Write;
    conn.write_and_go = State::NewCmd;
}

fn parse_usize(token: &[u8]) -> Option<usize> {
    std::str::from_utf8(token).ok().and_then(|s| s.parse().ok())
}
