use std::{net::IpAddr, path::PathBuf};

/// Server configuration, resolved once at startup and threaded through
/// constructors. `verbose` and `detail_enabled` only seed the runtime
/// toggles the `verbosity` and `stats detail` commands flip.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Memory ceiling for item storage, in bytes.
    pub maxbytes: u64,
    /// Connection ceiling, applied through RLIMIT_NOFILE at startup.
    pub maxconns: usize,
    /// TCP listen port; None disables TCP, Some(0) picks an ephemeral port.
    pub tcp_port: Option<u16>,
    /// UDP port; None disables UDP, Some(0) picks an ephemeral port.
    pub udp_port: Option<u16>,
    /// UNIX-domain socket path; set, it replaces both network sockets.
    pub unix_socket: Option<PathBuf>,
    /// Permission bits for the UNIX socket.
    pub access_mask: u32,
    /// Bind address for the network sockets; None binds the wildcard.
    pub bind_addr: Option<IpAddr>,
    pub verbose: u8,
    /// When false, a full cache fails allocations instead of evicting.
    pub evict_to_free: bool,
    /// Size-class growth factor.
    pub factor: f64,
    /// Smallest size class, bytes.
    pub chunk_size: usize,
    /// Worker thread count (the dispatcher is extra).
    pub num_threads: usize,
    /// Key prefix delimiter for detailed stats; None disables tracking.
    pub prefix_delimiter: Option<u8>,
    pub detail_enabled: bool,
    /// How many requests one connection may run per readiness event before
    /// yielding to its siblings.
    pub reqs_per_event: u32,
    pub use_cas: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            maxbytes: 64 * 1024 * 1024,
            maxconns: 1024,
            tcp_port: Some(11211),
            udp_port: Some(11211),
            unix_socket: None,
            access_mask: 0o700,
            bind_addr: None,
            verbose: 0,
            evict_to_free: true,
            factor: 1.25,
            chunk_size: 48,
            num_threads: 4,
            prefix_delimiter: None,
            detail_enabled: false,
            reqs_per_event: 20,
            use_cas: true,
        }
    }
}
