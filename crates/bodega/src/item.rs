use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;

use crate::{MAX_SIZE_CLASSES, clock::RelTime};

/// A stored value. Immutable once linked: every mutation (set, append,
/// incr, …) replaces the item wholesale, so replies already streaming the
/// old bytes keep a consistent view through their handle.
#[derive(Debug)]
pub struct Item {
    key: Box<[u8]>,
    flags: u32,
    exptime: RelTime,
    /// Value bytes, trailing `\r\n` included.
    data: Bytes,
    cas: u64,
    class: u8,
    /// Pre-formatted `" <flags> <length>\r\n"` for text-protocol VALUE
    /// lines; length excludes the trailer.
    suffix: Bytes,
    /// Relative time of the last link or LRU touch; flush_all compares
    /// against this. Atomic because touches happen through shared handles.
    time: AtomicU32,
}

impl Item {
    pub(crate) fn build(
        key: &[u8],
        flags: u32,
        exptime: RelTime,
        data: Bytes,
        cas: u64,
        class: u8,
        now: RelTime,
    ) -> Self {
        let suffix = format!(" {} {}\r\n", flags, data.len().saturating_sub(2));
        Self {
            key: key.into(),
            flags,
            exptime,
            data,
            cas,
            class,
            suffix: Bytes::from(suffix),
            time: AtomicU32::new(now),
        }
    }

    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    #[inline]
    pub fn exptime(&self) -> RelTime {
        self.exptime
    }

    /// Value bytes including the trailing `\r\n`.
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Value bytes without the trailer.
    #[inline]
    pub fn value(&self) -> Bytes {
        self.data.slice(..self.data.len().saturating_sub(2))
    }

    #[inline]
    pub fn cas(&self) -> u64 {
        self.cas
    }

    #[inline]
    pub fn class(&self) -> u8 {
        self.class
    }

    #[inline]
    pub fn suffix(&self) -> &Bytes {
        &self.suffix
    }

    #[inline]
    pub fn last_touched(&self) -> RelTime {
        self.time.load(Ordering::Relaxed)
    }

    /// Fixed overhead approximating the header + map slot cost.
    pub const OVERHEAD: u64 = 48;

    /// Bytes this item accounts against the memory ceiling.
    pub fn footprint(&self) -> u64 {
        Self::OVERHEAD + self.key.len() as u64 + self.suffix.len() as u64 + self.data.len() as u64
    }

    pub(crate) fn expired(&self, now: RelTime, oldest_live: RelTime) -> bool {
        if oldest_live != 0 && self.last_touched() <= oldest_live {
            return true;
        }
        self.exptime != 0 && self.exptime <= now
    }

    pub(crate) fn touch(&self, now: RelTime) {
        self.time.store(now, Ordering::Relaxed);
    }
}

/// Coarse geometric size classifier standing in for slab class ids: class 1
/// holds items up to `chunk_size` bytes, each next class grows by `factor`.
/// Feeds the per-class stats and `stats cachedump`.
pub fn size_class(total_bytes: usize, chunk_size: usize, factor: f64) -> u8 {
    let mut size = chunk_size.max(1) as f64;
    let factor = if factor > 1.0 { factor } else { 1.25 };
    let mut class = 1usize;
    while (size as usize) < total_bytes && class < MAX_SIZE_CLASSES - 1 {
        size *= factor;
        class += 1;
    }
    class as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_excludes_trailer() {
        let it = Item::build(b"k", 5, 0, Bytes::from_static(b"abc\r\n"), 1, 1, 10);
        assert_eq!(it.suffix().as_ref(), b" 5 3\r\n");
        assert_eq!(it.value().as_ref(), b"abc");
    }

    #[test]
    fn classes_grow_geometrically() {
        assert_eq!(size_class(1, 48, 1.25), 1);
        assert_eq!(size_class(48, 48, 1.25), 1);
        assert!(size_class(49, 48, 1.25) > 1);
        let big = size_class(usize::MAX, 48, 1.25);
        assert_eq!(big as usize, MAX_SIZE_CLASSES - 1);
    }

    #[test]
    fn flush_marker_beats_exptime() {
        let it = Item::build(b"k", 0, 0, Bytes::from_static(b"v\r\n"), 0, 1, 10);
        assert!(!it.expired(100, 0));
        assert!(it.expired(100, 10));
        assert!(!it.expired(100, 9));
    }
}
