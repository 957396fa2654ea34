use std::{
    io::{self, Read, Write},
    mem,
    net::SocketAddr,
};

use bodega::{RelTime, StoreVerb};
use bodega_proto::{BINARY_REQ_MAGIC, binary::RequestHeader, udp};
use mio::{Interest, Registry, Token, net::TcpStream, net::UdpSocket, net::UnixStream};
use tracing::{debug, trace};

use crate::{
    DATA_BUFFER_SIZE, READ_BUFFER_HIGHWAT, binary, buffer::ReadBuf, reply::Reply,
    server::Shared, text,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    NewCmd,
    Waiting,
    Read,
    ParseCmd,
    Nread,
    Swallow,
    Write,
    Mwrite,
    Closing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Protocol {
    /// First byte not seen yet; 0x80 latches binary, anything else text.
    Negotiating,
    Text,
    Binary,
}

pub(crate) enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
    Udp(UdpSocket),
}

impl Transport {
    pub fn is_udp(&self) -> bool {
        matches!(self, Transport::Udp(_))
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            Transport::Unix(s) => s.read(buf),
            Transport::Udp(_) => unreachable!("stream read on a datagram socket"),
        }
    }

    fn write_vectored(&mut self, slices: &[io::IoSlice<'_>]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write_vectored(slices),
            Transport::Unix(s) => s.write_vectored(slices),
            Transport::Udp(_) => unreachable!("stream write on a datagram socket"),
        }
    }

    pub fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => registry.register(s, token, interest),
            Transport::Unix(s) => registry.register(s, token, interest),
            Transport::Udp(s) => registry.register(s, token, interest),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => registry.reregister(s, token, interest),
            Transport::Unix(s) => registry.reregister(s, token, interest),
            Transport::Udp(s) => registry.reregister(s, token, interest),
        }
    }

    pub fn deregister(&mut self, registry: &Registry) {
        let _ = match self {
            Transport::Tcp(s) => registry.deregister(s),
            Transport::Unix(s) => registry.deregister(s),
            Transport::Udp(s) => registry.deregister(s),
        };
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Transport::read(self, buf)
    }
}

/// A storage payload mid-ingest: value bytes stream into `data` until the
/// connection's `rlbytes` counter hits zero.
pub(crate) struct PendingStore {
    pub verb: StoreVerb,
    pub key: Vec<u8>,
    pub flags: u32,
    pub exptime: RelTime,
    pub data: Vec<u8>,
    pub class: u8,
    /// Binary values arrive without the text trailer; it is appended at
    /// completion so stored items always carry one.
    pub append_crlf: bool,
    /// Suppress the success reply (binary quiet variants).
    pub quiet: bool,
}

/// What one drive pass asks of the worker.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Action {
    Keep,
    Close,
    /// Per-event request budget ran out with work still buffered; run the
    /// connection again after its siblings have had a turn.
    Requeue,
}

enum Step {
    Continue,
    Yield,
    Close,
}

enum ReadOutcome {
    Data,
    NoData,
    /// The read path already dispatched a reply (UDP framing errors).
    Dispatched,
    Closed,
}

/// Everything a state function needs besides the connection itself.
pub(crate) struct Ctx<'a> {
    pub shared: &'a Shared,
    pub registry: &'a Registry,
    pub worker: usize,
}

pub(crate) struct Conn {
    pub token: Token,
    pub transport: Transport,
    pub state: State,
    pub write_and_go: State,
    pub protocol: Protocol,
    pub rbuf: ReadBuf,
    pub reply: Reply,
    pub pending: Option<PendingStore>,
    /// Wire bytes still owed to the pending value.
    pub rlbytes: usize,
    pub swallow_bytes: usize,
    pub noreply: bool,
    pub bin_header: Option<RequestHeader>,
    pub udp_peer: Option<SocketAddr>,
    pub udp_request_id: u16,
    interest: Option<Interest>,
    reqs_left: u32,
}

impl Conn {
    pub fn new(
        token: Token,
        mut transport: Transport,
        init_state: State,
        rbuf: ReadBuf,
        registry: &Registry,
    ) -> io::Result<Self> {
        transport.register(registry, token, Interest::READABLE)?;
        let udp_framed = transport.is_udp();
        let mut reply = Reply::new(crate::MSG_LIST_INITIAL, crate::ITEM_LIST_INITIAL);
        reply.set_udp_framed(udp_framed);
        Ok(Self {
            token,
            transport,
            state: init_state,
            write_and_go: State::NewCmd,
            protocol: Protocol::Negotiating,
            rbuf,
            reply,
            pending: None,
            rlbytes: 0,
            swallow_bytes: 0,
            noreply: false,
            bin_header: None,
            udp_peer: None,
            udp_request_id: 0,
            interest: Some(Interest::READABLE),
            reqs_left: 0,
        })
    }

    /// Readiness arrived: translate it into a state-machine entry point.
    pub fn on_ready(&mut self, readable: bool) {
        if readable && matches!(self.state, State::Waiting) {
            self.state = State::Read;
        }
    }

    /// Runs the state machine until a state yields. Level-triggered: the
    /// worker re-enters on the next readiness event.
    pub fn drive(&mut self, ctx: &Ctx) -> Action {
        self.reqs_left = ctx.shared.settings.reqs_per_event;
        loop {
            trace!(state = ?self.state, "drive");
            match self.state {
                State::NewCmd => {
                    self.reset_for_next();
                    if self.rbuf.is_empty() {
                        self.state = State::Waiting;
                    } else if self.reqs_left == 0 {
                        // Pipelined commands still buffered; yield fairly.
                        return Action::Requeue;
                    } else {
                        self.state = State::ParseCmd;
                    }
                }
                State::Waiting => {
                    if !self.arm(ctx, Interest::READABLE) {
                        self.state = State::Closing;
                        continue;
                    }
                    return Action::Keep;
                }
                State::Read => {
                    let outcome = if self.transport.is_udp() {
                        self.try_read_udp(ctx)
                    } else {
                        self.try_read_network(ctx)
                    };
                    match outcome {
                        ReadOutcome::Data => self.state = State::ParseCmd,
                        ReadOutcome::NoData => self.state = State::Waiting,
                        ReadOutcome::Dispatched => {}
                        ReadOutcome::Closed => self.state = State::Closing,
                    }
                }
                State::ParseCmd => {
                    if matches!(self.protocol, Protocol::Negotiating) {
                        let first = self.rbuf.remaining()[0];
                        self.protocol = if first == BINARY_REQ_MAGIC {
                            Protocol::Binary
                        } else {
                            Protocol::Text
                        };
                        debug!(protocol = ?self.protocol, "negotiated");
                    }
                    let progressed = match self.protocol {
                        Protocol::Text => text::try_dispatch(self, ctx),
                        Protocol::Binary => binary::try_dispatch(self, ctx),
                        Protocol::Negotiating => unreachable!("latched above"),
                    };
                    if progressed {
                        self.reqs_left = self.reqs_left.saturating_sub(1);
                    } else if self.transport.is_udp() {
                        // A datagram either holds a whole request or none.
                        let pending = self.rbuf.len();
                        self.rbuf.consume(pending);
                        self.state = State::Waiting;
                    } else {
                        self.state = State::Waiting;
                    }
                }
                State::Nread => match self.handle_nread(ctx) {
                    Step::Continue => {}
                    Step::Yield => return Action::Keep,
                    Step::Close => self.state = State::Closing,
                },
                State::Swallow => match self.handle_swallow(ctx) {
                    Step::Continue => {}
                    Step::Yield => return Action::Keep,
                    Step::Close => self.state = State::Closing,
                },
                // Single-shot replies share the scatter/gather drain.
                State::Write => self.state = State::Mwrite,
                State::Mwrite => match self.handle_mwrite(ctx) {
                    Step::Continue => {}
                    Step::Yield => return Action::Keep,
                    Step::Close => self.state = State::Closing,
                },
                State::Closing => {
                    if self.transport.is_udp() {
                        // Datagram pseudo-connections outlive request errors;
                        // drop the request state and wait for the next one.
                        self.reply.reset(&ctx.shared.suffix_pool);
                        self.write_and_go = State::NewCmd;
                        self.reset_for_next();
                        let stale = self.rbuf.len();
                        self.rbuf.consume(stale);
                        self.state = State::Waiting;
                        continue;
                    }
                    return Action::Close;
                }
            }
        }
    }

    /// One cleanup point per command boundary.
    fn reset_for_next(&mut self) {
        self.noreply = false;
        self.bin_header = None;
        self.pending = None;
        self.rlbytes = 0;
        self.swallow_bytes = 0;
        self.rbuf.shrink(DATA_BUFFER_SIZE, READ_BUFFER_HIGHWAT);
    }

    fn try_read_network(&mut self, ctx: &Ctx) -> ReadOutcome {
        let mut got = 0usize;
        loop {
            match self.rbuf.fill_from(&mut self.transport) {
                Ok(0) => return ReadOutcome::Closed,
                Ok(n) => got += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, "read failed");
                    return ReadOutcome::Closed;
                }
            }
        }
        if got > 0 {
            ctx.shared.stats.with_worker(ctx.worker, |w| w.bytes_read += got as u64);
            ReadOutcome::Data
        } else {
            ReadOutcome::NoData
        }
    }

    fn try_read_udp(&mut self, ctx: &Ctx) -> ReadOutcome {
        let Transport::Udp(socket) = &self.transport else {
            unreachable!("udp read on stream transport")
        };
        let mut scratch = [0u8; 65536];
        match socket.recv_from(&mut scratch) {
            Ok((n, peer)) => {
                ctx.shared.stats.with_worker(ctx.worker, |w| w.bytes_read += n as u64);
                let Some((frame, payload)) = udp::FrameHeader::parse(&scratch[..n]) else {
                    return ReadOutcome::NoData;
                };
                self.udp_peer = Some(peer);
                self.udp_request_id = frame.request_id;
                let stale = self.rbuf.len();
                self.rbuf.consume(stale);
                if !frame.is_single_packet() {
                    text::out_error_static(
                        self,
                        b"SERVER_ERROR multi-packet request not supported\r\n",
                    );
                    return ReadOutcome::Dispatched;
                }
                if payload.is_empty() {
                    return ReadOutcome::NoData;
                }
                self.rbuf.push_slice(payload);
                ReadOutcome::Data
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::NoData,
            Err(err) => {
                // Datagram sockets shrug transport errors off.
                debug!(?err, "udp recv failed");
                ReadOutcome::NoData
            }
        }
    }

    fn handle_nread(&mut self, ctx: &Ctx) -> Step {
        {
            let Self { pending, rbuf, rlbytes, .. } = self;
            let pending = pending.as_mut().expect("nread without a pending store");
            if *rlbytes > 0 && !rbuf.is_empty() {
                let take = (*rlbytes).min(rbuf.len());
                pending.data.extend_from_slice(&rbuf.remaining()[..take]);
                rbuf.consume(take);
                *rlbytes -= take;
            }
        }
        if self.rlbytes == 0 {
            match self.protocol {
                Protocol::Text => text::complete_store(self, ctx),
                Protocol::Binary => binary::complete_store(self, ctx),
                Protocol::Negotiating => unreachable!("payload before negotiation"),
            }
            return Step::Continue;
        }
        if self.transport.is_udp() {
            // The lone datagram ended short of its advertised payload.
            self.pending = None;
            self.rlbytes = 0;
            text::out_error_static(self, b"CLIENT_ERROR bad data chunk\r\n");
            return Step::Continue;
        }

        let Self { pending, transport, rlbytes, .. } = self;
        let pending = pending.as_mut().expect("nread without a pending store");
        let old = pending.data.len();
        pending.data.resize(old + *rlbytes, 0);
        match transport.read(&mut pending.data[old..]) {
            Ok(0) => {
                pending.data.truncate(old);
                Step::Close
            }
            Ok(n) => {
                pending.data.truncate(old + n);
                *rlbytes -= n;
                ctx.shared.stats.with_worker(ctx.worker, |w| w.bytes_read += n as u64);
                Step::Continue
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                pending.data.truncate(old);
                if self.arm(ctx, Interest::READABLE) { Step::Yield } else { Step::Close }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                pending.data.truncate(old);
                Step::Continue
            }
            Err(err) => {
                pending.data.truncate(old);
                debug!(?err, "payload read failed");
                Step::Close
            }
        }
    }

    fn handle_swallow(&mut self, ctx: &Ctx) -> Step {
        let take = self.swallow_bytes.min(self.rbuf.len());
        self.rbuf.consume(take);
        self.swallow_bytes -= take;
        if self.swallow_bytes == 0 {
            self.state = State::NewCmd;
            return Step::Continue;
        }
        if self.transport.is_udp() {
            self.swallow_bytes = 0;
            self.state = State::NewCmd;
            return Step::Continue;
        }
        let mut scratch = [0u8; 4096];
        let want = self.swallow_bytes.min(scratch.len());
        match self.transport.read(&mut scratch[..want]) {
            Ok(0) => Step::Close,
            Ok(n) => {
                self.swallow_bytes -= n;
                ctx.shared.stats.with_worker(ctx.worker, |w| w.bytes_read += n as u64);
                Step::Continue
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if self.arm(ctx, Interest::READABLE) { Step::Yield } else { Step::Close }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Step::Continue,
            Err(err) => {
                debug!(?err, "swallow read failed");
                Step::Close
            }
        }
    }

    fn handle_mwrite(&mut self, ctx: &Ctx) -> Step {
        if self.transport.is_udp() {
            return self.handle_mwrite_udp(ctx);
        }
        loop {
            if self.reply.fully_drained() {
                break;
            }
            let written = {
                let Self { transport, reply, .. } = self;
                let mut slices = Vec::with_capacity(64);
                reply.gather(&mut slices);
                if slices.is_empty() {
                    break;
                }
                match transport.write_vectored(&slices) {
                    Ok(0) => return Step::Close,
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        drop(slices);
                        return if self.arm(ctx, Interest::WRITABLE) {
                            Step::Yield
                        } else {
                            Step::Close
                        };
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(?err, "vectored send failed");
                        return Step::Close;
                    }
                }
            };
            ctx.shared.stats.with_worker(ctx.worker, |w| w.bytes_written += written as u64);
            if self.reply.advance(written) {
                break;
            }
        }
        self.finish_reply(ctx);
        Step::Continue
    }

    fn handle_mwrite_udp(&mut self, ctx: &Ctx) -> Step {
        let peer = self.udp_peer.expect("udp reply without a peer");
        loop {
            let Some(dgram) = self.reply.next_datagram(self.udp_request_id) else { break };
            let Transport::Udp(socket) = &self.transport else {
                unreachable!("udp drain on stream transport")
            };
            match socket.send_to(&dgram, peer) {
                Ok(n) => {
                    ctx.shared.stats.with_worker(ctx.worker, |w| w.bytes_written += n as u64);
                    self.reply.skip_datagram();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return if self.arm(ctx, Interest::WRITABLE) { Step::Yield } else { Step::Close };
                }
                Err(err) => {
                    // Unreachable peers just lose their reply.
                    debug!(?err, "udp send failed");
                    break;
                }
            }
        }
        self.finish_reply(ctx);
        Step::Continue
    }

    /// Reply drained: release item handles and suffix buffers, take the
    /// deferred next state.
    fn finish_reply(&mut self, ctx: &Ctx) {
        self.reply.reset(&ctx.shared.suffix_pool);
        self.state = mem::replace(&mut self.write_and_go, State::NewCmd);
    }

    fn arm(&mut self, ctx: &Ctx, interest: Interest) -> bool {
        if self.interest == Some(interest) {
            return true;
        }
        match self.transport.reregister(ctx.registry, self.token, interest) {
            Ok(()) => {
                self.interest = Some(interest);
                true
            }
            Err(err) => {
                debug!(?err, "reregister failed");
                false
            }
        }
    }

    /// Teardown on the worker's close path. Pending state (item handles,
    /// suffix buffers) is released here, whatever path got us here.
    pub fn destroy(mut self, registry: &Registry, shared: &Shared) {
        self.transport.deregister(registry);
        self.reply.reset(&shared.suffix_pool);
        let rbuf = self.rbuf.into_vec();
        if rbuf.capacity() <= READ_BUFFER_HIGHWAT {
            shared.rbuf_pool.release(rbuf);
        }
    }
}
