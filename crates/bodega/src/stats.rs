use std::sync::Mutex;

use crate::MAX_SIZE_CLASSES;

/// Counters a single size class accumulates on one worker.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClassStats {
    pub set_cmds: u64,
    pub get_hits: u64,
    pub delete_hits: u64,
    pub incr_hits: u64,
    pub decr_hits: u64,
}

/// One worker's counter block. Mutated only by that worker, under the
/// block's mutex; aggregation reads cross-thread.
#[derive(Clone, Debug)]
pub struct WorkerStats {
    pub get_cmds: u64,
    pub get_misses: u64,
    pub delete_misses: u64,
    pub incr_misses: u64,
    pub decr_misses: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub classes: Box<[ClassStats]>,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            get_cmds: 0,
            get_misses: 0,
            delete_misses: 0,
            incr_misses: 0,
            decr_misses: 0,
            bytes_read: 0,
            bytes_written: 0,
            classes: vec![ClassStats::default(); MAX_SIZE_CLASSES].into_boxed_slice(),
        }
    }
}

impl WorkerStats {
    fn clear(&mut self) {
        self.get_cmds = 0;
        self.get_misses = 0;
        self.delete_misses = 0;
        self.incr_misses = 0;
        self.decr_misses = 0;
        self.bytes_read = 0;
        self.bytes_written = 0;
        for c in &mut self.classes {
            *c = ClassStats::default();
        }
    }
}

/// The small process-wide block. `curr_*` are gauges and survive
/// `stats reset`.
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalStats {
    pub curr_conns: u64,
    pub total_conns: u64,
    pub conn_structs: u64,
    pub curr_bytes: u64,
    pub total_items: u64,
    pub curr_items: u64,
    pub evictions: u64,
}

/// Element-wise sum over every worker block plus the globals, taken one
/// mutex at a time. Consistent per counter, not across counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatsSnapshot {
    pub curr_conns: u64,
    pub total_conns: u64,
    pub conn_structs: u64,
    pub curr_bytes: u64,
    pub total_items: u64,
    pub curr_items: u64,
    pub evictions: u64,
    pub cmd_get: u64,
    pub cmd_set: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub delete_hits: u64,
    pub delete_misses: u64,
    pub incr_hits: u64,
    pub incr_misses: u64,
    pub decr_hits: u64,
    pub decr_misses: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// All counter blocks for the process: one `WorkerStats` per worker thread
/// plus the globals.
pub struct Stats {
    global: Mutex<GlobalStats>,
    workers: Box<[Mutex<WorkerStats>]>,
}

impl Stats {
    pub fn new(num_workers: usize) -> Self {
        let workers =
            (0..num_workers).map(|_| Mutex::new(WorkerStats::default())).collect::<Vec<_>>();
        Self { global: Mutex::new(GlobalStats::default()), workers: workers.into_boxed_slice() }
    }

    /// Runs `f` on worker `idx`'s block under its mutex.
    #[inline]
    pub fn with_worker<R>(&self, idx: usize, f: impl FnOnce(&mut WorkerStats) -> R) -> R {
        let mut guard = self.workers[idx].lock().expect("worker stats poisoned");
        f(&mut guard)
    }

    /// Runs `f` on the global block under the global mutex.
    #[inline]
    pub fn with_global<R>(&self, f: impl FnOnce(&mut GlobalStats) -> R) -> R {
        let mut guard = self.global.lock().expect("global stats poisoned");
        f(&mut guard)
    }

    pub fn aggregate(&self) -> StatsSnapshot {
        let mut snap = {
            let g = self.global.lock().expect("global stats poisoned");
            StatsSnapshot {
                curr_conns: g.curr_conns,
                total_conns: g.total_conns,
                conn_structs: g.conn_structs,
                curr_bytes: g.curr_bytes,
                total_items: g.total_items,
                curr_items: g.curr_items,
                evictions: g.evictions,
                ..StatsSnapshot::default()
            }
        };
        for worker in &self.workers {
            let w = worker.lock().expect("worker stats poisoned");
            snap.cmd_get += w.get_cmds;
            snap.get_misses += w.get_misses;
            snap.delete_misses += w.delete_misses;
            snap.incr_misses += w.incr_misses;
            snap.decr_misses += w.decr_misses;
            snap.bytes_read += w.bytes_read;
            snap.bytes_written += w.bytes_written;
            for c in &w.classes {
                snap.cmd_set += c.set_cmds;
                snap.get_hits += c.get_hits;
                snap.delete_hits += c.delete_hits;
                snap.incr_hits += c.incr_hits;
                snap.decr_hits += c.decr_hits;
            }
        }
        snap
    }

    /// Zeroes cumulative counters. Gauges (`curr_*`, `conn_structs`) keep
    /// their values.
    pub fn reset(&self) {
        {
            let mut g = self.global.lock().expect("global stats poisoned");
            g.total_conns = 0;
            g.total_items = 0;
            g.evictions = 0;
        }
        for worker in &self.workers {
            worker.lock().expect("worker stats poisoned").clear();
        }
    }
}
