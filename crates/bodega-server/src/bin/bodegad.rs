//! bodegad - in-memory key/value cache daemon.
//!
//! Speaks the memcached text and binary protocols over TCP, UDP and
//! UNIX-domain sockets.

use std::{
    net::IpAddr,
    path::PathBuf,
    process,
    sync::{Arc, atomic::AtomicBool},
};

use bodega::Settings;
use bodega_server::Server;
use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

// sysexits(3) codes init scripts pattern-match on.
const EX_USAGE: i32 = 64;
const EX_OSERR: i32 = 71;

/// In-memory key/value cache daemon.
#[derive(Parser)]
#[command(name = "bodegad", about = "In-memory key/value cache daemon", version)]
struct Args {
    /// TCP port to listen on (0 disables TCP).
    #[arg(short = 'p', default_value = "11211", value_name = "PORT")]
    tcp_port: u16,

    /// UDP port to listen on (0 disables UDP).
    #[arg(short = 'U', default_value = "11211", value_name = "PORT")]
    udp_port: u16,

    /// UNIX socket path to listen on (disables network support).
    #[arg(short = 's', value_name = "PATH")]
    unix_socket: Option<PathBuf>,

    /// Access mask for the UNIX socket, in octal.
    #[arg(short = 'a', default_value = "0700", value_parser = parse_octal, value_name = "MASK")]
    access_mask: u32,

    /// Interface to listen on; default is INADDR_ANY.
    #[arg(short = 'l', value_name = "ADDR")]
    bind_addr: Option<IpAddr>,

    /// Run as a daemon. Not compiled in; accepted for drop-in
    /// compatibility and ignored.
    #[arg(short = 'd')]
    daemonize: bool,

    /// Maximize core file limit.
    #[arg(short = 'r')]
    max_core: bool,

    /// Assume this user's identity when run as root.
    #[arg(short = 'u', value_name = "USER")]
    user: Option<String>,

    /// Max memory for items, in megabytes.
    #[arg(short = 'm', default_value = "64", value_name = "MB")]
    memory_mb: u64,

    /// Return errors on memory exhaustion instead of evicting items.
    #[arg(short = 'M')]
    no_evict: bool,

    /// Max simultaneous connections.
    #[arg(short = 'c', default_value = "1024", value_name = "CONNS")]
    maxconns: usize,

    /// Lock down all paged memory.
    #[arg(short = 'k')]
    lock_memory: bool,

    /// Increase logging verbosity (-v debug, -vv trace).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print license info and exit.
    #[arg(short = 'i')]
    license: bool,

    /// Pidfile path.
    #[arg(short = 'P', value_name = "FILE")]
    pidfile: Option<PathBuf>,

    /// Size-class growth factor.
    #[arg(short = 'f', default_value = "1.25", value_name = "FACTOR")]
    factor: f64,

    /// Minimum space allocated for the smallest item, in bytes.
    #[arg(short = 'n', default_value = "48", value_name = "BYTES")]
    chunk_size: usize,

    /// Number of worker threads.
    #[arg(short = 't', default_value = "4", value_name = "THREADS")]
    threads: usize,

    /// Key prefix delimiter enabling detailed prefix stats.
    #[arg(short = 'D', value_name = "CHAR")]
    prefix_delimiter: Option<char>,

    /// Use large memory pages. Not compiled in; accepted and ignored.
    #[arg(short = 'L')]
    large_pages: bool,

    /// Max requests one connection may run per readiness event.
    #[arg(short = 'R', default_value = "20", value_name = "REQS")]
    reqs_per_event: u32,

    /// Disable CAS ids (saves per-item bookkeeping).
    #[arg(short = 'C')]
    disable_cas: bool,
}

fn parse_octal(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8)
        .map_err(|e| format!("invalid octal mask '{s}': {e}"))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("bodega={level}").parse().expect("static directive"))
        .add_directive(format!("bodega_server={level}").parse().expect("static directive"))
        .add_directive(format!("bodegad={level}").parse().expect("static directive"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err)
            if matches!(
                err.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            let _ = err.print();
            return;
        }
        Err(err) => {
            let _ = err.print();
            process::exit(EX_USAGE);
        }
    };

    if args.license {
        println!("bodegad {}", env!("CARGO_PKG_VERSION"));
        println!("Distributed under the MIT license.");
        return;
    }

    init_logging(args.verbose);

    if args.threads == 0 || args.factor <= 1.0 || args.chunk_size == 0 {
        error!("bad thread count, growth factor or chunk size");
        process::exit(EX_USAGE);
    }
    if args.daemonize {
        warn!("daemon mode is not compiled in, staying in the foreground");
    }
    if args.large_pages {
        warn!("large page support is not compiled in");
    }

    // SIGPIPE would otherwise kill the process on a mid-write disconnect;
    // the send path handles the error return instead.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    if args.max_core {
        maximize_core_limit();
    }
    raise_fd_limit(args.maxconns);
    drop_privileges(args.user.as_deref());
    if args.lock_memory {
        let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
        if rc != 0 {
            warn!("mlockall failed, continuing without locked memory");
        }
    }

    let settings = Settings {
        maxbytes: args.memory_mb * 1024 * 1024,
        maxconns: args.maxconns,
        tcp_port: (args.tcp_port != 0).then_some(args.tcp_port),
        udp_port: (args.udp_port != 0).then_some(args.udp_port),
        unix_socket: args.unix_socket,
        access_mask: args.access_mask,
        bind_addr: args.bind_addr,
        verbose: args.verbose,
        evict_to_free: !args.no_evict,
        factor: args.factor,
        chunk_size: args.chunk_size,
        num_threads: args.threads,
        prefix_delimiter: args.prefix_delimiter.map(|c| c as u8),
        detail_enabled: false,
        reqs_per_event: args.reqs_per_event,
        use_cas: !args.disable_cas,
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            error!(?err, signal, "failed to install signal handler");
            process::exit(1);
        }
    }

    if let Some(pidfile) = &args.pidfile {
        if let Err(err) = std::fs::write(pidfile, format!("{}\n", process::id())) {
            warn!(?err, path = %pidfile.display(), "could not write pidfile");
        }
    }

    info!("bodegad {} starting", env!("CARGO_PKG_VERSION"));
    let server = match Server::bind(settings) {
        Ok(server) => server,
        Err(err) => {
            error!(?err, "failed to set up listening sockets");
            process::exit(1);
        }
    };
    let result = server.run(&shutdown);

    if let Some(pidfile) = &args.pidfile {
        let _ = std::fs::remove_file(pidfile);
    }
    match result {
        Ok(()) => info!("shutdown complete"),
        Err(err) => {
            error!(?err, "server failed");
            process::exit(1);
        }
    }
}

fn maximize_core_limit() {
    unsafe {
        let mut limit = std::mem::zeroed::<libc::rlimit>();
        if libc::getrlimit(libc::RLIMIT_CORE, &mut limit) == 0 {
            limit.rlim_cur = limit.rlim_max;
            if libc::setrlimit(libc::RLIMIT_CORE, &limit) != 0 {
                warn!("failed to raise core file limit");
            }
        }
    }
}

/// Connections need descriptors: listeners, pipes and slack included.
fn raise_fd_limit(maxconns: usize) {
    let want = (maxconns + 64) as libc::rlim_t;
    unsafe {
        let mut limit = std::mem::zeroed::<libc::rlimit>();
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) != 0 {
            warn!("failed to read the open-file limit");
            return;
        }
        if limit.rlim_cur >= want {
            return;
        }
        limit.rlim_cur = want.min(limit.rlim_max);
        if libc::setrlimit(libc::RLIMIT_NOFILE, &limit) != 0 {
            error!(
                maxconns,
                "failed to raise the open-file limit; run as root or lower -c"
            );
            process::exit(EX_OSERR);
        }
    }
}

/// Root refuses to serve traffic directly; `-u` names who does.
fn drop_privileges(user: Option<&str>) {
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        if user.is_some() {
            warn!("-u only makes sense when started as root, ignoring");
        }
        return;
    }
    let Some(user) = user else {
        error!("can't run as root without the -u switch");
        process::exit(EX_USAGE);
    };
    let name = std::ffi::CString::new(user).unwrap_or_default();
    unsafe {
        let pw = libc::getpwnam(name.as_ptr());
        if pw.is_null() {
            error!(user, "can't find that user to switch to");
            process::exit(EX_OSERR);
        }
        if libc::setgid((*pw).pw_gid) != 0 || libc::setuid((*pw).pw_uid) != 0 {
            error!(user, "failed to assume that user's identity");
            process::exit(EX_OSERR);
        }
    }
    info!(user, "dropped root privileges");
}
