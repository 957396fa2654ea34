use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::Receiver,
    },
    time::Duration,
};

use mio::{Events, Poll, Token};
use slab::Slab;
use tracing::{debug, info, warn};

use crate::{
    DATA_BUFFER_SIZE,
    buffer::ReadBuf,
    conn::{Action, Conn, Ctx, State, Transport},
    server::Shared,
};

/// Wake-queue token; connection tokens are slab keys and stay far below.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// An accepted socket travelling from the dispatcher to its worker. The
/// queue plus the worker's `Waker` is the wake-pipe: the only cross-thread
/// handoff on the I/O path.
pub(crate) struct Handoff {
    pub transport: Transport,
    pub init_state: State,
}

pub(crate) struct Worker {
    pub index: usize,
    pub poll: Poll,
    pub rx: Receiver<Handoff>,
    pub shared: Arc<Shared>,
    pub shutdown: Arc<AtomicBool>,
    /// Clone of the process-wide UDP socket, if UDP is enabled.
    pub udp: Option<std::net::UdpSocket>,
}

impl Worker {
    pub fn run(mut self) {
        let mut events = Events::with_capacity(1024);
        let mut conns: Slab<Conn> = Slab::with_capacity(64);

        if let Some(udp) = self.udp.take() {
            if let Err(err) = self.add_udp_conn(&mut conns, udp) {
                warn!(?err, worker = self.index, "udp connection setup failed");
            }
        }

        info!(worker = self.index, "worker started");
        loop {
            match self.poll.poll(&mut events, Some(Duration::from_millis(250))) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(?err, worker = self.index, "poll failed");
                    break;
                }
            }
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let mut requeue = Vec::new();
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    while let Ok(handoff) = self.rx.try_recv() {
                        self.install(&mut conns, handoff);
                    }
                } else {
                    self.service(&mut conns, event.token().0, event.is_readable(), &mut requeue);
                }
            }

            // Budget-exhausted connections get another turn once their
            // siblings have been serviced.
            while !requeue.is_empty() {
                let batch = std::mem::take(&mut requeue);
                for key in batch {
                    self.service(&mut conns, key, false, &mut requeue);
                }
            }
        }

        debug!(worker = self.index, conns = conns.len(), "worker stopping");
        for (_, conn) in conns {
            conn.destroy(self.poll.registry(), &self.shared);
        }
    }

    fn add_udp_conn(&self, conns: &mut Slab<Conn>, udp: std::net::UdpSocket) -> io::Result<()> {
        let socket = mio::net::UdpSocket::from_std(udp);
        let entry = conns.vacant_entry();
        let rbuf = ReadBuf::with_capacity(DATA_BUFFER_SIZE);
        let conn = Conn::new(
            Token(entry.key()),
            Transport::Udp(socket),
            State::Waiting,
            rbuf,
            self.poll.registry(),
        )?;
        entry.insert(conn);
        Ok(())
    }

    fn install(&self, conns: &mut Slab<Conn>, handoff: Handoff) {
        let raw = self.shared.rbuf_pool.acquire();
        if raw.capacity() == 0 {
            self.shared.stats.with_global(|g| g.conn_structs += 1);
        }
        let rbuf = ReadBuf::from_vec(raw, DATA_BUFFER_SIZE);
        let entry = conns.vacant_entry();
        let token = Token(entry.key());
        match Conn::new(token, handoff.transport, handoff.init_state, rbuf, self.poll.registry()) {
            Ok(conn) => {
                entry.insert(conn);
                self.shared.stats.with_global(|g| {
                    g.curr_conns += 1;
                    g.total_conns += 1;
                });
                if self.shared.verbosity.load(Ordering::Relaxed) > 1 {
                    debug!(worker = self.index, ?token, "connection installed");
                }
            }
            Err(err) => warn!(?err, worker = self.index, "connection setup failed"),
        }
    }

    fn service(
        &self,
        conns: &mut Slab<Conn>,
        key: usize,
        readable: bool,
        requeue: &mut Vec<usize>,
    ) {
        let Some(conn) = conns.get_mut(key) else { return };
        conn.on_ready(readable);
        let ctx =
            Ctx { shared: &*self.shared, registry: self.poll.registry(), worker: self.index };
        match conn.drive(&ctx) {
            Action::Keep => {}
            Action::Requeue => requeue.push(key),
            Action::Close => self.close(conns, key),
        }
    }

    fn close(&self, conns: &mut Slab<Conn>, key: usize) {
        let conn = conns.remove(key);
        let was_udp = conn.transport.is_udp();
        conn.destroy(self.poll.registry(), &self.shared);
        if !was_udp {
            self.shared.stats.with_global(|g| g.curr_conns = g.curr_conns.saturating_sub(1));
            // A freed descriptor may unblock a paused accept loop.
            self.shared.accept_gate.reopen();
        }
        debug!(worker = self.index, key, "connection closed");
    }
}
