use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    os::fd::{AsRawFd, RawFd},
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, Ordering},
        mpsc::{Sender, channel},
    },
    thread,
    time::Duration,
};

use bodega::{Clock, ItemStore, Settings, Stats};
use mio::{Events, Interest, Poll, Token, Waker, net::TcpListener, net::UnixListener};
use tracing::{debug, error, info, warn};

use crate::{
    SUFFIX_LIST_INITIAL,
    conn::{State, Transport},
    pool::BufPool,
    worker::{Handoff, WAKER_TOKEN, Worker},
};

pub(crate) const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Dispatcher-side waker token; rung by workers when a closed descriptor
/// may unblock a paused accept loop.
const GATE_WAKER_TOKEN: Token = Token(usize::MAX - 2);

/// Accept backpressure under descriptor exhaustion: the dispatcher pauses
/// all listeners on EMFILE and a worker reopens the gate on any close.
pub(crate) struct AcceptGate {
    paused: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl AcceptGate {
    fn new() -> Self {
        Self { paused: AtomicBool::new(false), waker: Mutex::new(None) }
    }

    fn set_waker(&self, waker: Waker) {
        *self.waker.lock().expect("gate waker poisoned") = Some(waker);
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn reopen(&self) {
        if self.paused.swap(false, Ordering::Relaxed) {
            if let Some(waker) = self.waker.lock().expect("gate waker poisoned").as_ref() {
                let _ = waker.wake();
            }
        }
    }
}

/// Process-wide context threaded into every worker: configuration, clock,
/// stats, the store, and the shared freelists.
pub(crate) struct Shared {
    pub settings: Settings,
    pub verbosity: AtomicU8,
    pub detail_enabled: AtomicBool,
    pub clock: Arc<Clock>,
    pub stats: Arc<Stats>,
    pub store: ItemStore,
    pub suffix_pool: BufPool,
    pub rbuf_pool: BufPool,
    pub accept_gate: AcceptGate,
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// The listening process: dispatcher loop plus its worker pool.
///
/// `bind` resolves sockets (port 0 picks an ephemeral port, handy for
/// tests); `run` owns the calling thread until the shutdown flag flips.
pub struct Server {
    shared: Arc<Shared>,
    poll: Poll,
    listeners: Vec<Listener>,
    udp: Option<std::net::UdpSocket>,
    tcp_addr: Option<SocketAddr>,
    udp_addr: Option<SocketAddr>,
    unix_path: Option<PathBuf>,
}

impl Server {
    pub fn bind(settings: Settings) -> io::Result<Self> {
        let clock = Arc::new(Clock::new());
        let stats = Arc::new(Stats::new(settings.num_threads));
        let store = ItemStore::new(&settings, Arc::clone(&clock), Arc::clone(&stats));

        let poll = Poll::new()?;
        let mut listeners = Vec::new();
        let mut tcp_addr = None;
        let mut udp = None;
        let mut udp_addr = None;
        let mut unix_path = None;

        if let Some(path) = &settings.unix_socket {
            // A UNIX socket replaces both network sockets.
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)?;
            set_unix_mode(path, settings.access_mask)?;
            info!(path = %path.display(), "listening on unix socket");
            listeners.push(Listener::Unix(listener));
            unix_path = Some(path.clone());
        } else {
            let addr = settings.bind_addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            if let Some(port) = settings.tcp_port {
                let listener = TcpListener::bind(SocketAddr::new(addr, port))?;
                tcp_addr = Some(listener.local_addr()?);
                info!(addr = ?tcp_addr, "listening on tcp");
                listeners.push(Listener::Tcp(listener));
            }
            if let Some(port) = settings.udp_port {
                let socket = std::net::UdpSocket::bind(SocketAddr::new(addr, port))?;
                socket.set_nonblocking(true)?;
                maximize_sndbuf(socket.as_raw_fd());
                udp_addr = Some(socket.local_addr()?);
                info!(addr = ?udp_addr, "listening on udp");
                udp = Some(socket);
            }
        }

        for (idx, listener) in listeners.iter_mut().enumerate() {
            register_listener(poll.registry(), listener, Token(idx))?;
        }

        let shared = Arc::new(Shared {
            verbosity: AtomicU8::new(settings.verbose),
            detail_enabled: AtomicBool::new(settings.detail_enabled),
            clock,
            stats,
            store,
            suffix_pool: BufPool::new(SUFFIX_LIST_INITIAL),
            rbuf_pool: BufPool::new(settings.maxconns.min(1024)),
            accept_gate: AcceptGate::new(),
            settings,
        });

        Ok(Self { shared, poll, listeners, udp, tcp_addr, udp_addr, unix_path })
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    /// Runs the dispatcher until `shutdown` flips. Spawns the clock ticker
    /// and one thread per worker; joins everything on the way out.
    pub fn run(mut self, shutdown: &Arc<AtomicBool>) -> io::Result<()> {
        let ticker = self.shared.clock.spawn_ticker(Arc::clone(shutdown));

        let worker_count = self.shared.settings.num_threads;
        let mut txs: Vec<Sender<Handoff>> = Vec::with_capacity(worker_count);
        let mut wakers: Vec<Waker> = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let poll = Poll::new()?;
            let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
            let (tx, rx) = channel();
            let udp = match &self.udp {
                Some(socket) => Some(socket.try_clone()?),
                None => None,
            };
            let worker = Worker {
                index,
                poll,
                rx,
                shared: Arc::clone(&self.shared),
                shutdown: Arc::clone(shutdown),
                udp,
            };
            let handle = thread::Builder::new()
                .name(format!("bodega-worker-{index}"))
                .spawn(move || worker.run())?;
            txs.push(tx);
            wakers.push(waker);
            handles.push(handle);
        }

        self.shared.accept_gate.set_waker(Waker::new(self.poll.registry(), GATE_WAKER_TOKEN)?);

        info!(workers = worker_count, "dispatcher running");
        let mut events = Events::with_capacity(64);
        let mut next_worker = 0usize;
        while !shutdown.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(Duration::from_millis(250))) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(?err, "dispatcher poll failed");
                    break;
                }
            }
            for event in events.iter() {
                if event.token() == GATE_WAKER_TOKEN {
                    if !self.shared.accept_gate.is_paused() {
                        debug!("accept gate reopened");
                        for (idx, listener) in self.listeners.iter_mut().enumerate() {
                            let _ =
                                register_listener(self.poll.registry(), listener, Token(idx));
                        }
                    }
                } else {
                    accept_loop(
                        &mut self.listeners,
                        &self.poll,
                        event.token(),
                        &txs,
                        &wakers,
                        &mut next_worker,
                        &self.shared,
                    );
                }
            }
        }

        info!("shutting down");
        drop(txs);
        for waker in &wakers {
            let _ = waker.wake();
        }
        for handle in handles {
            let _ = handle.join();
        }
        let _ = ticker.join();
        if let Some(path) = &self.unix_path {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_loop(
    listeners: &mut [Listener],
    poll: &Poll,
    token: Token,
    txs: &[Sender<Handoff>],
    wakers: &[Waker],
    next_worker: &mut usize,
    shared: &Arc<Shared>,
) {
    let mut pause = false;
    {
        let Some(listener) = listeners.get_mut(token.0) else { return };
        loop {
            let accepted = match listener {
                Listener::Tcp(l) => l.accept().map(|(stream, peer)| {
                    debug!(?peer, "client connected");
                    set_stream_options(stream.as_raw_fd());
                    Transport::Tcp(stream)
                }),
                Listener::Unix(l) => l.accept().map(|(stream, _)| Transport::Unix(stream)),
            };
            match accepted {
                Ok(transport) => {
                    let target = *next_worker % txs.len();
                    *next_worker = next_worker.wrapping_add(1);
                    if txs[target].send(Handoff { transport, init_state: State::Read }).is_ok() {
                        let _ = wakers[target].wake();
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if is_fd_exhaustion(err) => {
                    warn!("out of descriptors, pausing accept");
                    pause = true;
                    break;
                }
                Err(err) => {
                    warn!(?err, "accept failed");
                    break;
                }
            }
        }
    }
    if pause {
        shared.accept_gate.pause();
        for (idx, listener) in listeners.iter_mut().enumerate() {
            let _ = deregister_listener(poll.registry(), listener, Token(idx));
        }
    }
}

fn is_fd_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

fn register_listener(
    registry: &mio::Registry,
    listener: &mut Listener,
    token: Token,
) -> io::Result<()> {
    match listener {
        Listener::Tcp(l) => registry.register(l, token, Interest::READABLE),
        Listener::Unix(l) => registry.register(l, token, Interest::READABLE),
    }
}

fn deregister_listener(
    registry: &mio::Registry,
    listener: &mut Listener,
    _token: Token,
) -> io::Result<()> {
    match listener {
        Listener::Tcp(l) => registry.deregister(l),
        Listener::Unix(l) => registry.deregister(l),
    }
}

fn set_unix_mode(path: &std::path::Path, mask: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mask))
}

/// Per-connection TCP tuning: keepalive on, linger off, Nagle off.
fn set_stream_options(fd: RawFd) {
    let on: libc::c_int = 1;
    let linger = libc::linger { l_onoff: 0, l_linger: 0 };
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            std::ptr::addr_of!(on).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            std::ptr::addr_of!(linger).cast(),
            size_of::<libc::linger>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            std::ptr::addr_of!(on).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Binary-searches SO_SNDBUF up to the kernel ceiling; UDP replies burst
/// datagrams and the default is usually tight.
pub fn maximize_sndbuf(fd: RawFd) {
    let mut old: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    let got = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            std::ptr::addr_of_mut!(old).cast(),
            &mut len,
        )
    };
    if got != 0 {
        return;
    }

    let mut min = old;
    let mut max: libc::c_int = 256 * 1024 * 1024;
    let mut best = old;
    while min <= max {
        let avg = min + (max - min) / 2;
        let ok = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                std::ptr::addr_of!(avg).cast(),
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ok == 0 {
            best = avg;
            min = avg + 1;
        } else {
            max = avg - 1;
        }
    }
    debug!(from = old, to = best, "sndbuf maximized");
}

/// The server-scope `stats` pairs, in their contractual order.
pub(crate) fn stat_pairs(shared: &Shared) -> Vec<(String, String)> {
    let snap = shared.stats.aggregate();
    let now = shared.clock.current_time();
    let (ru_user, ru_system) = rusage_pair();
    vec![
        ("pid".into(), std::process::id().to_string()),
        ("uptime".into(), now.to_string()),
        ("time".into(), shared.clock.to_unix(now).to_string()),
        ("version".into(), VERSION.to_string()),
        ("pointer_size".into(), (8 * size_of::<usize>()).to_string()),
        ("rusage_user".into(), ru_user),
        ("rusage_system".into(), ru_system),
        ("curr_connections".into(), snap.curr_conns.to_string()),
        ("total_connections".into(), snap.total_conns.to_string()),
        ("connection_structures".into(), snap.conn_structs.to_string()),
        ("cmd_get".into(), snap.cmd_get.to_string()),
        ("cmd_set".into(), snap.cmd_set.to_string()),
        ("get_hits".into(), snap.get_hits.to_string()),
        ("get_misses".into(), snap.get_misses.to_string()),
        ("delete_misses".into(), snap.delete_misses.to_string()),
        ("delete_hits".into(), snap.delete_hits.to_string()),
        ("incr_misses".into(), snap.incr_misses.to_string()),
        ("incr_hits".into(), snap.incr_hits.to_string()),
        ("decr_misses".into(), snap.decr_misses.to_string()),
        ("decr_hits".into(), snap.decr_hits.to_string()),
        ("bytes_read".into(), snap.bytes_read.to_string()),
        ("bytes_written".into(), snap.bytes_written.to_string()),
        ("limit_maxbytes".into(), shared.settings.maxbytes.to_string()),
        ("threads".into(), shared.settings.num_threads.to_string()),
        // Engine-scope extras follow the contractual block.
        ("bytes".into(), snap.curr_bytes.to_string()),
        ("curr_items".into(), snap.curr_items.to_string()),
        ("total_items".into(), snap.total_items.to_string()),
        ("evictions".into(), snap.evictions.to_string()),
    ]
}

fn rusage_pair() -> (String, String) {
    let mut usage = unsafe { std::mem::zeroed::<libc::rusage>() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return ("0.000000".into(), "0.000000".into());
    }
    let fmt = |tv: libc::timeval| format!("{}.{:06}", tv.tv_sec, tv.tv_usec);
    (fmt(usage.ru_utime), fmt(usage.ru_stime))
}
