//! Binary-protocol command execution. The fixed header and the
//! extras+key prefix of the body are consumed straight from the read
//! buffer; only storage values stream through the nread path.

use bodega::{DeltaError, DeltaOp, StoreError, StoreOutcome, StoreVerb};
use bodega_proto::binary::{
    self, DELTA_NO_CREATE, FrameError, HEADER_LEN, Opcode, RequestHeader, ResponseHeader, Status,
};
use bytes::Bytes;
use tracing::debug;

use crate::conn::{Conn, Ctx, PendingStore, State};

/// Tries to carve one complete binary request off the read buffer.
/// Returns false when more bytes are needed.
pub(crate) fn try_dispatch(conn: &mut Conn, ctx: &Ctx) -> bool {
    let avail = conn.rbuf.remaining();
    if avail.len() < HEADER_LEN {
        return false;
    }
    let header = match RequestHeader::parse(avail) {
        Ok(header) => header,
        Err(FrameError::BadMagic(magic)) => {
            debug!(magic, "bad request magic, closing");
            conn.state = State::Closing;
            return true;
        }
        Err(FrameError::UnknownOpcode(opcode)) => {
            let (bodylen, opaque) = raw_body_opaque(avail);
            conn.rbuf.consume(HEADER_LEN);
            conn.swallow_bytes = bodylen;
            emit_raw_error(conn, opcode, opaque, Status::UnknownCommand);
            conn.write_and_go = State::Swallow;
            return true;
        }
        Err(FrameError::Schema) => {
            // Framing is untrustworthy from here on: reply, then close.
            let (_, opaque) = raw_body_opaque(avail);
            let opcode = avail[1];
            conn.rbuf.consume(HEADER_LEN);
            emit_raw_error(conn, opcode, opaque, Status::InvalidArgs);
            conn.write_and_go = State::Closing;
            return true;
        }
    };

    // Extras and key always ride in the read buffer; values stream.
    let prefix = header.extlen as usize + header.keylen as usize;
    if conn.rbuf.remaining().len() < HEADER_LEN + prefix {
        return false;
    }
    conn.rbuf.consume(HEADER_LEN);
    let body = conn.rbuf.remaining()[..prefix].to_vec();
    conn.rbuf.consume(prefix);
    conn.bin_header = Some(header);
    execute(conn, ctx, &header, &body);
    true
}

fn raw_body_opaque(raw: &[u8]) -> (usize, u32) {
    let bodylen = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]) as usize;
    let opaque = u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]);
    (bodylen, opaque)
}

fn execute(conn: &mut Conn, ctx: &Ctx, header: &RequestHeader, body: &[u8]) {
    let extras = &body[..header.extlen as usize];
    let key = &body[header.extlen as usize..];
    match header.opcode.base() {
        Opcode::Get | Opcode::GetK => process_get(conn, ctx, header, key),
        Opcode::Set | Opcode::Add | Opcode::Replace | Opcode::Append | Opcode::Prepend => {
            process_update(conn, ctx, header, extras, key);
        }
        Opcode::Delete => process_delete(conn, ctx, header, key),
        Opcode::Increment | Opcode::Decrement => process_arith(conn, ctx, header, extras, key),
        Opcode::Quit => {
            if header.opcode.is_quiet() {
                conn.state = State::Closing;
            } else {
                emit(conn, Response::ok(header));
                conn.write_and_go = State::Closing;
            }
        }
        Opcode::Flush => process_flush(conn, ctx, header, extras),
        Opcode::Noop => emit(conn, Response::ok(header)),
        Opcode::Version => {
            let mut res = Response::ok(header);
            res.value = Some(Bytes::from_static(crate::server::VERSION.as_bytes()));
            emit(conn, res);
        }
        Opcode::Stat => process_stat(conn, ctx, header, key),
        quiet => unreachable!("base() returned quiet opcode {quiet:?}"),
    }
}

fn process_get(conn: &mut Conn, ctx: &Ctx, header: &RequestHeader, key: &[u8]) {
    let quiet = header.opcode.is_quiet();
    let with_key = matches!(header.opcode.base(), Opcode::GetK);
    match ctx.shared.store.get(key) {
        Some(item) => {
            ctx.shared.stats.with_worker(ctx.worker, |w| {
                w.get_cmds += 1;
                w.classes[item.class() as usize].get_hits += 1;
            });
            let mut res = Response::ok(header);
            res.cas = item.cas();
            res.extras = item.flags().to_be_bytes().to_vec();
            if with_key {
                res.key = key.to_vec();
            }
            res.value = Some(item.value());
            let keep_going = quiet;
            emit(conn, res);
            conn.reply.hold_item(item);
            if keep_going {
                // Quiet hits accumulate; a later non-quiet reply (NOOP,
                // usually) flushes the batch.
                conn.state = State::NewCmd;
            }
        }
        None => {
            ctx.shared.stats.with_worker(ctx.worker, |w| {
                w.get_cmds += 1;
                w.get_misses += 1;
            });
            if quiet {
                // Quiet misses are silence, nothing else.
                conn.state = State::NewCmd;
            } else {
                emit(conn, Response::error(header, Status::KeyNotFound));
            }
        }
    }
}

fn process_update(
    conn: &mut Conn,
    ctx: &Ctx,
    header: &RequestHeader,
    extras: &[u8],
    key: &[u8],
) {
    let (flags, exptime) =
        if extras.len() == 8 { binary::parse_store_extras(extras) } else { (0, 0) };
    let verb = match header.opcode.base() {
        Opcode::Set => {
            if header.cas != 0 {
                StoreVerb::Cas(header.cas)
            } else {
                StoreVerb::Set
            }
        }
        Opcode::Add => StoreVerb::Add,
        Opcode::Replace => StoreVerb::Replace,
        Opcode::Append => StoreVerb::Append,
        Opcode::Prepend => StoreVerb::Prepend,
        other => unreachable!("not a store opcode: {other:?}"),
    };
    let value_len = header.value_len();
    match ctx.shared.store.classify(key, value_len + 2) {
        Ok(class) => {
            conn.pending = Some(PendingStore {
                verb,
                key: key.to_vec(),
                flags,
                exptime: ctx.shared.clock.realtime(exptime as i64),
                data: Vec::with_capacity(value_len + 2),
                class,
                append_crlf: true,
                quiet: header.opcode.is_quiet(),
            });
            conn.rlbytes = value_len;
            conn.state = State::Nread;
        }
        Err(err) => {
            conn.swallow_bytes = value_len;
            emit(conn, Response::error(header, store_status(err)));
            conn.write_and_go = State::Swallow;
        }
    }
}

/// Value fully ingested: append the trailer, run the verb, reply (or stay
/// silent for quiet variants).
pub(crate) fn complete_store(conn: &mut Conn, ctx: &Ctx) {
    let mut pending = conn.pending.take().expect("complete without a pending store");
    let header = conn.bin_header.expect("binary store without a header");
    if pending.append_crlf {
        pending.data.extend_from_slice(b"\r\n");
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
        Ok((StoreOutcome::Stored, item)) => {
            if pending.quiet {
                conn.state = State::NewCmd;
            } else {
                let mut res = Response::ok(&header);
                res.cas = item.map_or(0, |it| it.cas());
                emit(conn, res);
            }
        }
        Ok((StoreOutcome::NotStored, _)) => emit(conn, Response::error(&header, Status::NotStored)),
        Ok((StoreOutcome::Exists, _)) => emit(conn, Response::error(&header, Status::KeyExists)),
        Ok((StoreOutcome::NotFound, _)) => {
            emit(conn, Response::error(&header, Status::KeyNotFound));
        }
        Err(err) => emit(conn, Response::error(&header, store_status(err))),
    }
}

fn process_delete(conn: &mut Conn, ctx: &Ctx, header: &RequestHeader, key: &[u8]) {
    match ctx.shared.store.delete(key) {
        Some(item) => {
            ctx.shared
                .stats
                .with_worker(ctx.worker, |w| w.classes[item.class() as usize].delete_hits += 1);
            if header.opcode.is_quiet() {
                conn.state = State::NewCmd;
            } else {
                emit(conn, Response::ok(header));
            }
        }
        None => {
            ctx.shared.stats.with_worker(ctx.worker, |w| w.delete_misses += 1);
            emit(conn, Response::error(header, Status::KeyNotFound));
        }
    }
}

fn process_arith(conn: &mut Conn, ctx: &Ctx, header: &RequestHeader, extras: &[u8], key: &[u8]) {
    let (delta, initial, exptime) = binary::parse_delta_extras(extras);
    let incr = matches!(header.opcode.base(), Opcode::Increment);
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
            respond_counter(conn, header, value, item.cas());
        }
        Err(DeltaError::NotFound) => {
            if exptime == DELTA_NO_CREATE {
                ctx.shared.stats.with_worker(ctx.worker, |w| {
                    if incr {
                        w.incr_misses += 1;
                    } else {
                        w.decr_misses += 1;
                    }
                });
                emit(conn, Response::error(header, Status::KeyNotFound));
            } else {
                seed_counter(conn, ctx, header, key, initial, exptime);
            }
        }
        Err(DeltaError::NonNumeric) => {
            emit(conn, Response::error(header, Status::InvalidArgs));
        }
        Err(DeltaError::Store(err)) => emit(conn, Response::error(header, store_status(err))),
    }
}

/// Miss with auto-create allowed: link the initial value.
fn seed_counter(
    conn: &mut Conn,
    ctx: &Ctx,
    header: &RequestHeader,
    key: &[u8],
    initial: u64,
    exptime: u32,
) {
    let mut data = initial.to_string().into_bytes();
    data.extend_from_slice(b"\r\n");
    let rel = ctx.shared.clock.realtime(exptime as i64);
    match ctx.shared.store.store(key, 0, rel, Bytes::from(data), StoreVerb::Set) {
        Ok((StoreOutcome::Stored, item)) => {
            respond_counter(conn, header, initial, item.map_or(0, |it| it.cas()));
        }
        Ok(_) | Err(_) => emit(conn, Response::error(header, Status::OutOfMemory)),
    }
}

fn respond_counter(conn: &mut Conn, header: &RequestHeader, value: u64, cas: u64) {
    if header.opcode.is_quiet() {
        conn.state = State::NewCmd;
        return;
    }
    let mut res = Response::ok(header);
    res.cas = cas;
    res.value = Some(Bytes::from(value.to_be_bytes().to_vec()));
    emit(conn, res);
}

fn process_flush(conn: &mut Conn, ctx: &Ctx, header: &RequestHeader, extras: &[u8]) {
    let now = ctx.shared.clock.refresh_now();
    let delay = if extras.len() == 4 {
        u32::from_be_bytes(extras.try_into().expect("4 byte extras"))
    } else {
        0
    };
    let marker = if delay == 0 {
        now.saturating_sub(1)
    } else {
        ctx.shared.clock.realtime(delay as i64).saturating_sub(1)
    };
    ctx.shared.store.set_oldest_live(marker);
    ctx.shared.store.flush_expired();
    if header.opcode.is_quiet() {
        conn.state = State::NewCmd;
    } else {
        emit(conn, Response::ok(header));
    }
}

fn process_stat(conn: &mut Conn, ctx: &Ctx, header: &RequestHeader, key: &[u8]) {
    match key {
        b"" => {
            for (k, v) in crate::server::stat_pairs(ctx.shared) {
                let mut res = Response::ok(header);
                res.key = k.into_bytes();
                res.value = Some(Bytes::from(v.into_bytes()));
                push_response(conn, res);
            }
            // Empty key/value response terminates the stat stream.
            emit(conn, Response::ok(header));
        }
        b"reset" => {
            ctx.shared.stats.reset();
            emit(conn, Response::ok(header));
        }
        _ => emit(conn, Response::error(header, Status::KeyNotFound)),
    }
}

fn store_status(err: StoreError) -> Status {
    match err {
        StoreError::TooLarge => Status::TooBig,
        StoreError::OutOfMemory => Status::OutOfMemory,
    }
}

/// One response under construction; `emit` frames it onto the reply.
struct Response {
    opcode: u8,
    status: Status,
    opaque: u32,
    cas: u64,
    extras: Vec<u8>,
    key: Vec<u8>,
    value: Option<Bytes>,
}

impl Response {
    fn ok(header: &RequestHeader) -> Self {
        Self {
            opcode: header.opcode as u8,
            status: Status::Ok,
            opaque: header.opaque,
            cas: 0,
            extras: Vec::new(),
            key: Vec::new(),
            value: None,
        }
    }

    fn error(header: &RequestHeader, status: Status) -> Self {
        Self { status, ..Self::ok(header) }
    }
}

/// Appends the framed response and schedules the write.
fn emit(conn: &mut Conn, res: Response) {
    push_response(conn, res);
    conn.state = State::Write;
    conn.write_and_go = State::NewCmd;
}

/// Appends the framed response without scheduling a write (stat streams,
/// quiet-hit accumulation).
fn push_response(conn: &mut Conn, res: Response) {
    let value_len = res.value.as_ref().map_or(0, Bytes::len);
    let header = ResponseHeader {
        opcode: res.opcode,
        keylen: res.key.len() as u16,
        extlen: res.extras.len() as u8,
        status: res.status,
        bodylen: (res.extras.len() + res.key.len() + value_len) as u32,
        opaque: res.opaque,
        cas: res.cas,
    };
    let mut head = Vec::with_capacity(HEADER_LEN + res.extras.len() + res.key.len());
    head.extend_from_slice(&header.encode());
    head.extend_from_slice(&res.extras);
    head.extend_from_slice(&res.key);
    conn.reply.add_shared(Bytes::from(head));
    if let Some(value) = res.value {
        conn.reply.add_shared(value);
    }
}

fn emit_raw_error(conn: &mut Conn, opcode: u8, opaque: u32, status: Status) {
    let header = ResponseHeader {
        opcode,
        keylen: 0,
        extlen: 0,
        status,
        bodylen: 0,
        opaque,
        cas: 0,
    };
    conn.reply.add_shared(Bytes::from(header.encode().to_vec()));
    conn.state = State::Write;
    conn.write_and_go = State::NewCmd;
}
