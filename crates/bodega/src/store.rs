use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::debug;

use crate::{
    Settings,
    clock::{Clock, RelTime},
    item::{Item, size_class},
    stats::Stats,
};

/// Hard per-item ceiling, independent of `maxbytes`.
const ITEM_SIZE_MAX: u64 = 1024 * 1024;

/// Worst-case bytes a pre-formatted text suffix can take.
const SUFFIX_MAX: u64 = 24;

const NIL: usize = usize::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas(u64),
}

/// What a store attempt observed. Maps 1:1 onto the protocol reply tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    NotStored,
    Exists,
    NotFound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaOp {
    Incr,
    Decr,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("object too large for cache")]
    TooLarge,
    #[error("out of memory storing object")]
    OutOfMemory,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaError {
    #[error("cannot increment or decrement non-numeric value")]
    NonNumeric,
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Node {
    item: Arc<Item>,
    prev: usize,
    next: usize,
}

/// Intrusive LRU over slab-indexed nodes; head is most recently used.
struct Lru {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl Lru {
    fn new() -> Self {
        Self { nodes: Vec::new(), free: Vec::new(), head: NIL, tail: NIL }
    }

    fn insert_head(&mut self, item: Arc<Item>) -> usize {
        let node = Node { item, prev: NIL, next: self.head };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        let old_head = self.head;
        if let Some(old) = self.node_mut(old_head) {
            old.prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
        idx
    }

    fn unlink(&mut self, idx: usize) -> Arc<Item> {
        let node = self.nodes[idx].take().expect("unlink of vacant lru slot");
        match self.node_mut(node.prev) {
            Some(prev) => prev.next = node.next,
            None => self.head = node.next,
        }
        match self.node_mut(node.next) {
            Some(next) => next.prev = node.prev,
            None => self.tail = node.prev,
        }
        self.free.push(idx);
        node.item
    }

    fn move_to_head(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        let item = self.unlink(idx);
        let new_idx = self.insert_head(item);
        debug_assert_eq!(new_idx, idx);
    }

    fn item(&self, idx: usize) -> &Arc<Item> {
        &self.nodes[idx].as_ref().expect("vacant lru slot").item
    }

    fn next_of(&self, idx: usize) -> usize {
        self.nodes[idx].as_ref().expect("vacant lru slot").next
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node> {
        if idx == NIL { None } else { self.nodes[idx].as_mut() }
    }
}

struct Inner {
    map: HashMap<Box<[u8]>, usize>,
    lru: Lru,
    bytes: u64,
}

/// What one locked operation did to the item population; folded into the
/// global gauges after the lock drops.
#[derive(Default)]
struct Delta {
    linked: u64,
    evicted: u64,
}

/// The item hash + LRU behind one cache mutex. Public operations take the
/// lock once; the `do_*` methods assume it is held.
pub struct ItemStore {
    inner: Mutex<Inner>,
    cas_source: AtomicU64,
    oldest_live: AtomicU32,
    maxbytes: u64,
    evict_to_free: bool,
    chunk_size: usize,
    factor: f64,
    use_cas: bool,
    clock: Arc<Clock>,
    stats: Arc<Stats>,
}

impl ItemStore {
    pub fn new(settings: &Settings, clock: Arc<Clock>, stats: Arc<Stats>) -> Self {
        Self {
            inner: Mutex::new(Inner { map: HashMap::new(), lru: Lru::new(), bytes: 0 }),
            cas_source: AtomicU64::new(0),
            oldest_live: AtomicU32::new(0),
            maxbytes: settings.maxbytes,
            evict_to_free: settings.evict_to_free,
            chunk_size: settings.chunk_size,
            factor: settings.factor,
            use_cas: settings.use_cas,
            clock,
            stats,
        }
    }

    /// Size class an item with this key and data length would land in.
    /// Also the pre-ingest acceptance check: `Err(TooLarge)` means the
    /// payload should be swallowed, not stored.
    pub fn classify(&self, key: &[u8], data_len: usize) -> Result<u8, StoreError> {
        let projected =
            Item::OVERHEAD + key.len() as u64 + SUFFIX_MAX + data_len as u64;
        if projected > ITEM_SIZE_MAX || projected > self.maxbytes {
            return Err(StoreError::TooLarge);
        }
        Ok(size_class(projected as usize, self.chunk_size, self.factor))
    }

    /// Fetch with LRU promotion; expired items are unlinked on the way.
    pub fn get(&self, key: &[u8]) -> Option<Arc<Item>> {
        let now = self.clock.current_time();
        let oldest = self.oldest_live();
        let found = {
            let mut inner = self.lock();
            inner.do_get(key, now, oldest).map(|item| {
                item.touch(now);
                Arc::clone(item)
            })
        };
        self.publish_gauges(Delta::default());
        found
    }

    pub fn delete(&self, key: &[u8]) -> Option<Arc<Item>> {
        let now = self.clock.current_time();
        let oldest = self.oldest_live();
        let removed = {
            let mut inner = self.lock();
            if inner.do_get(key, now, oldest).is_some() { inner.do_unlink(key) } else { None }
        };
        self.publish_gauges(Delta::default());
        removed
    }

    /// The storage contract: one verb, one outcome. On `Stored` the handle
    /// of the freshly linked item rides along (its CAS goes into binary
    /// responses).
    pub fn store(
        &self,
        key: &[u8],
        flags: u32,
        exptime: RelTime,
        data: Bytes,
        verb: StoreVerb,
    ) -> Result<(StoreOutcome, Option<Arc<Item>>), StoreError> {
        let now = self.clock.current_time();
        let oldest = self.oldest_live();
        let mut delta = Delta::default();
        let result = {
            let mut inner = self.lock();
            self.do_store(&mut inner, key, flags, exptime, data, verb, now, oldest, &mut delta)
        };
        self.publish_gauges(delta);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn do_store(
        &self,
        inner: &mut Inner,
        key: &[u8],
        flags: u32,
        exptime: RelTime,
        data: Bytes,
        verb: StoreVerb,
        now: RelTime,
        oldest: RelTime,
        delta: &mut Delta,
    ) -> Result<(StoreOutcome, Option<Arc<Item>>), StoreError> {
        let existing = inner.do_get(key, now, oldest).map(Arc::clone);
        let replacement = match verb {
            StoreVerb::Add => match existing {
                Some(_) => {
                    // The old item is promoted even though nothing is stored.
                    inner.do_touch(key, now);
                    return Ok((StoreOutcome::NotStored, None));
                }
                None => (flags, exptime, data),
            },
            StoreVerb::Replace => match existing {
                Some(_) => (flags, exptime, data),
                None => return Ok((StoreOutcome::NotFound, None)),
            },
            StoreVerb::Append | StoreVerb::Prepend => match existing {
                Some(old) => {
                    let merged = splice(&old, &data, verb == StoreVerb::Append);
                    (old.flags(), old.exptime(), merged)
                }
                None => return Ok((StoreOutcome::NotFound, None)),
            },
            StoreVerb::Cas(id) => match existing {
                Some(old) if old.cas() == id => (flags, exptime, data),
                Some(_) => return Ok((StoreOutcome::Exists, None)),
                None => return Ok((StoreOutcome::NotFound, None)),
            },
            StoreVerb::Set => (flags, exptime, data),
        };

        let (flags, exptime, data) = replacement;
        let item = self.new_item(key, flags, exptime, data, now)?;
        let handle = Arc::clone(&item);
        inner.do_link(item, self.maxbytes, self.evict_to_free, delta)?;
        Ok((StoreOutcome::Stored, Some(handle)))
    }

    /// Strict unsigned-decimal arithmetic on a stored value. The updated
    /// item replaces the old one and receives a fresh CAS.
    pub fn add_delta(
        &self,
        key: &[u8],
        delta_arg: u64,
        op: DeltaOp,
    ) -> Result<(u64, Arc<Item>), DeltaError> {
        let now = self.clock.current_time();
        let oldest = self.oldest_live();
        let mut delta = Delta::default();
        let result = {
            let mut inner = self.lock();
            self.do_add_delta(&mut inner, key, delta_arg, op, now, oldest, &mut delta)
        };
        self.publish_gauges(delta);
        result
    }

    fn do_add_delta(
        &self,
        inner: &mut Inner,
        key: &[u8],
        delta_arg: u64,
        op: DeltaOp,
        now: RelTime,
        oldest: RelTime,
        delta: &mut Delta,
    ) -> Result<(u64, Arc<Item>), DeltaError> {
        let old = inner.do_get(key, now, oldest).map(Arc::clone).ok_or(DeltaError::NotFound)?;
        let current = parse_u64(&old.value()).ok_or(DeltaError::NonNumeric)?;
        let updated = match op {
            DeltaOp::Incr => current.wrapping_add(delta_arg),
            DeltaOp::Decr => current.saturating_sub(delta_arg),
        };

        let mut data = BytesMut::from(updated.to_string().as_bytes());
        data.extend_from_slice(b"\r\n");
        let item = self
            .new_item(key, old.flags(), old.exptime(), data.freeze(), now)
            .map_err(DeltaError::from)?;
        let handle = Arc::clone(&item);
        inner.do_link(item, self.maxbytes, self.evict_to_free, delta).map_err(DeltaError::from)?;
        Ok((updated, handle))
    }

    /// `flush_all` marker: items last touched at or before this are dead.
    pub fn set_oldest_live(&self, t: RelTime) {
        self.oldest_live.store(t, Ordering::Relaxed);
    }

    pub fn oldest_live(&self) -> RelTime {
        self.oldest_live.load(Ordering::Relaxed)
    }

    /// Batch-unlink everything the flush marker or exptime has killed.
    pub fn flush_expired(&self) {
        let now = self.clock.current_time();
        let oldest = self.oldest_live();
        let count = {
            let mut inner = self.lock();
            let dead: Vec<Box<[u8]>> = inner
                .map
                .iter()
                .filter(|&(_, &idx)| inner.lru.item(idx).expired(now, oldest))
                .map(|(key, _)| key.clone())
                .collect();
            let count = dead.len();
            for key in dead {
                inner.do_unlink(&key);
            }
            count
        };
        if count > 0 {
            debug!(count, "flushed expired items");
        }
        self.publish_gauges(Delta::default());
    }

    /// LRU-ordered dump of one size class, newest first.
    /// Returns (key, value length sans trailer, absolute expiry seconds).
    pub fn cachedump(&self, class: u8, limit: usize) -> Vec<(Box<[u8]>, usize, u64)> {
        let inner = self.lock();
        let cap = if limit == 0 { inner.map.len() } else { limit };
        let mut out = Vec::new();
        let mut idx = inner.lru.head;
        while idx != NIL && out.len() < cap {
            let item = inner.lru.item(idx);
            if item.class() == class {
                let exp = if item.exptime() == 0 { 0 } else { self.clock.to_unix(item.exptime()) };
                out.push((item.key().into(), item.data().len().saturating_sub(2), exp));
            }
            idx = inner.lru.next_of(idx);
        }
        out
    }

    pub fn curr_items(&self) -> usize {
        self.lock().map.len()
    }

    pub fn bytes_used(&self) -> u64 {
        self.lock().bytes
    }

    fn new_item(
        &self,
        key: &[u8],
        flags: u32,
        exptime: RelTime,
        data: Bytes,
        now: RelTime,
    ) -> Result<Arc<Item>, StoreError> {
        let class = self.classify(key, data.len())?;
        let cas = if self.use_cas { self.cas_source.fetch_add(1, Ordering::Relaxed) + 1 } else { 0 };
        Ok(Arc::new(Item::build(key, flags, exptime, data, cas, class, now)))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("item store poisoned")
    }

    fn publish_gauges(&self, delta: Delta) {
        let (bytes, items) = {
            let inner = self.lock();
            (inner.bytes, inner.map.len() as u64)
        };
        self.stats.with_global(|g| {
            g.curr_bytes = bytes;
            g.curr_items = items;
            g.total_items += delta.linked;
            g.evictions += delta.evicted;
        });
    }
}

impl Inner {
    /// Lookup with lazy expiry; the lock is held by the caller.
    fn do_get(&mut self, key: &[u8], now: RelTime, oldest: RelTime) -> Option<&Arc<Item>> {
        let idx = *self.map.get(key)?;
        if self.lru.item(idx).expired(now, oldest) {
            self.do_unlink(key);
            return None;
        }
        self.lru.move_to_head(idx);
        Some(self.lru.item(idx))
    }

    fn do_touch(&mut self, key: &[u8], now: RelTime) {
        if let Some(&idx) = self.map.get(key) {
            self.lru.item(idx).touch(now);
            self.lru.move_to_head(idx);
        }
    }

    fn do_unlink(&mut self, key: &[u8]) -> Option<Arc<Item>> {
        let idx = self.map.remove(key)?;
        let item = self.lru.unlink(idx);
        self.bytes = self.bytes.saturating_sub(item.footprint());
        Some(item)
    }

    fn do_relink(&mut self, item: Arc<Item>) {
        self.bytes += item.footprint();
        let idx = self.lru.insert_head(Arc::clone(&item));
        self.map.insert(item.key().into(), idx);
    }

    /// Link-or-replace, evicting from the tail while over budget. A failed
    /// link restores the displaced item; the store never loses the old
    /// value to a rejected new one.
    fn do_link(
        &mut self,
        item: Arc<Item>,
        maxbytes: u64,
        evict: bool,
        delta: &mut Delta,
    ) -> Result<(), StoreError> {
        let displaced = self.do_unlink(item.key());
        let need = item.footprint();
        while self.bytes + need > maxbytes {
            if !evict || self.lru.tail == NIL {
                if let Some(old) = displaced {
                    self.do_relink(old);
                }
                return Err(StoreError::OutOfMemory);
            }
            let victim = Arc::clone(self.lru.item(self.lru.tail));
            self.do_unlink(victim.key());
            delta.evicted += 1;
        }
        self.do_relink(item);
        delta.linked += 1;
        Ok(())
    }
}

/// Concatenation for append/prepend: one CRLF survives, so the merged
/// length is `old + new − 2`.
fn splice(old: &Item, new_data: &Bytes, append: bool) -> Bytes {
    let old_value = old.value();
    let mut merged =
        BytesMut::with_capacity(old.data().len() + new_data.len().saturating_sub(2));
    if append {
        merged.extend_from_slice(&old_value);
        merged.extend_from_slice(new_data);
    } else {
        merged.extend_from_slice(&new_data[..new_data.len().saturating_sub(2)]);
        merged.extend_from_slice(old.data());
    }
    merged.freeze()
}

fn parse_u64(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }
    let text = std::str::from_utf8(bytes).ok()?;
    text.parse::<u64>().ok()
}
