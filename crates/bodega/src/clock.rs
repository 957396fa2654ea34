use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::debug;

/// Seconds since the server started. 32 bits keeps every item timestamp
/// small; all expiry math happens in this domain.
pub type RelTime = u32;

/// Exptimes above this are absolute Unix timestamps, not deltas.
const REALTIME_MAXDELTA: i64 = 60 * 60 * 24 * 30;

/// Process-wide wall clock, read on every hot path as a single atomic load.
///
/// `process_started` is backdated two seconds so `current_time` is never
/// zero while the server is up; store-level code relies on 0 meaning
/// "never set".
pub struct Clock {
    /// Unix seconds of (start − 2).
    started: u64,
    current: AtomicU32,
}

impl Clock {
    pub fn new() -> Self {
        let started = unix_now().saturating_sub(2);
        let clock = Self { started, current: AtomicU32::new(0) };
        clock.refresh_now();
        clock
    }

    /// Relative seconds since start. Never zero after construction.
    #[inline]
    pub fn current_time(&self) -> RelTime {
        self.current.load(Ordering::Relaxed)
    }

    /// Re-reads the wall clock. Used by the ticker thread and by commands
    /// whose semantics depend on "now" (flush, expiry computations).
    pub fn refresh_now(&self) -> RelTime {
        let now = (unix_now().saturating_sub(self.started)) as RelTime;
        self.current.store(now, Ordering::Relaxed);
        now
    }

    /// Unix seconds of `process_started`.
    #[inline]
    pub fn started(&self) -> u64 {
        self.started
    }

    /// Converts a client exptime into relative seconds.
    ///
    /// 0 stays 0 (never expires). Values within 30 days are deltas from
    /// now; larger values are absolute Unix timestamps. Absolute times in
    /// the past (and negative inputs) land on 1, one second after start,
    /// which is always already expired.
    pub fn realtime(&self, exptime: i64) -> RelTime {
        if exptime == 0 {
            return 0;
        }
        if exptime < 0 {
            return 1;
        }
        if exptime > REALTIME_MAXDELTA {
            if (exptime as u64) <= self.started {
                return 1;
            }
            (exptime as u64 - self.started) as RelTime
        } else {
            exptime as RelTime + self.current_time()
        }
    }

    /// Absolute Unix seconds for a relative timestamp, for client-visible
    /// output (`stats`, cachedump).
    #[inline]
    pub fn to_unix(&self, rel: RelTime) -> u64 {
        self.started + rel as u64
    }

    /// Once-a-second refresh thread. Exits when `stop` flips.
    pub fn spawn_ticker(self: &Arc<Self>, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
        let clock = Arc::clone(self);
        thread::Builder::new()
            .name("bodega-clock".into())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_secs(1));
                    clock.refresh_now();
                }
                debug!("clock ticker stopped");
            })
            .expect("failed to spawn clock thread")
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
