use std::io::{self, Read};

/// Growable read buffer with an independent consume cursor: the window
/// `[start, start + len)` holds bytes received but not yet parsed.
///
/// Invariant at every state boundary: `start + len <= buf.len()`.
pub(crate) struct ReadBuf {
    buf: Vec<u8>,
    start: usize,
    len: usize,
}

impl ReadBuf {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: vec![0; capacity.max(64)], start: 0, len: 0 }
    }

    /// Rebuilds a buffer around a recycled allocation.
    pub fn from_vec(mut buf: Vec<u8>, baseline: usize) -> Self {
        if buf.len() < baseline {
            buf.resize(baseline, 0);
        }
        Self { buf, start: 0, len: 0 }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    #[inline]
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.start..self.start + self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Marks `n` bytes as parsed. The cursor snaps back to the front once
    /// the window empties.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len, "consume past the valid window");
        self.start += n;
        self.len -= n;
        if self.len == 0 {
            self.start = 0;
        }
    }

    /// Appends bytes directly (UDP payload ingest).
    pub fn push_slice(&mut self, data: &[u8]) {
        self.make_room(data.len());
        let at = self.start + self.len;
        self.buf[at..at + data.len()].copy_from_slice(data);
        self.len += data.len();
    }

    /// One non-blocking read into the spare tail, compacting or doubling
    /// first when the window is flush against the end.
    pub fn fill_from<R: Read>(&mut self, r: &mut R) -> io::Result<usize> {
        self.make_room(1);
        let at = self.start + self.len;
        let n = r.read(&mut self.buf[at..])?;
        self.len += n;
        Ok(n)
    }

    /// Between requests: a buffer that ballooned past `highwat` while the
    /// window is small gets reallocated back to `baseline`. Skipped while
    /// pending bytes would not fit the baseline.
    pub fn shrink(&mut self, baseline: usize, highwat: usize) {
        if self.buf.len() <= highwat || self.len > baseline {
            return;
        }
        let mut fresh = vec![0; baseline];
        fresh[..self.len].copy_from_slice(self.remaining());
        self.buf = fresh;
        self.start = 0;
    }

    fn make_room(&mut self, want: usize) {
        let tail = self.buf.len() - (self.start + self.len);
        if tail >= want {
            return;
        }
        if self.start > 0 {
            // Slide the window home before growing.
            self.buf.copy_within(self.start..self.start + self.len, 0);
            self.start = 0;
        }
        while self.buf.len() - self.len < want {
            let doubled = (self.buf.len() * 2).max(64);
            self.buf.resize(doubled, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn fill_consume_window() {
        let mut rb = ReadBuf::with_capacity(8);
        let mut src = Cursor::new(b"hello world".to_vec());
        let n = rb.fill_from(&mut src).unwrap();
        assert_eq!(&rb.remaining()[..n], &b"hello world"[..n]);

        rb.consume(5);
        assert!(rb.remaining().starts_with(&b" wor"[..1]));
        rb.consume(rb.len());
        assert!(rb.is_empty());
        // Cursor snaps home when drained.
        assert_eq!(rb.remaining().len(), 0);
    }

    #[test]
    fn grows_by_doubling() {
        let mut rb = ReadBuf::with_capacity(64);
        let payload = vec![b'x'; 1000];
        let mut src = Cursor::new(payload.clone());
        let mut total = 0;
        while total < 1000 {
            total += rb.fill_from(&mut src).unwrap();
        }
        assert_eq!(rb.remaining(), &payload[..]);
        assert!(rb.capacity() >= 1000);
    }

    #[test]
    fn shrink_respects_pending_bytes() {
        let mut rb = ReadBuf::with_capacity(64);
        rb.push_slice(&vec![b'a'; 20_000]);
        rb.consume(19_990);
        let tail = rb.remaining().to_vec();
        rb.shrink(2048, 8192);
        assert_eq!(rb.capacity(), 2048);
        assert_eq!(rb.remaining(), &tail[..]);

        // Too much pending: the big buffer stays.
        let mut rb = ReadBuf::with_capacity(64);
        rb.push_slice(&vec![b'a'; 20_000]);
        rb.shrink(2048, 8192);
        assert!(rb.capacity() >= 20_000);
    }

    #[test]
    fn push_slice_appends() {
        let mut rb = ReadBuf::with_capacity(4);
        rb.push_slice(b"abc");
        rb.push_slice(b"defgh");
        assert_eq!(rb.remaining(), b"abcdefgh");
    }
}
