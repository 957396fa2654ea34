use std::sync::Mutex;

/// Shared freelist of byte buffers; suffix scratch and recycled connection
/// read buffers both ride on this. Retains at most `retain` idle entries.
pub(crate) struct BufPool {
    inner: Mutex<Vec<Vec<u8>>>,
    retain: usize,
}

impl BufPool {
    pub fn new(retain: usize) -> Self {
        Self { inner: Mutex::new(Vec::with_capacity(retain)), retain }
    }

    pub fn acquire(&self) -> Vec<u8> {
        self.inner.lock().expect("buf pool poisoned").pop().unwrap_or_default()
    }

    pub fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut inner = self.inner.lock().expect("buf pool poisoned");
        if inner.len() < self.retain {
            inner.push(buf);
        }
    }

    #[cfg(test)]
    pub fn idle(&self) -> usize {
        self.inner.lock().expect("buf pool poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycles_up_to_cap() {
        let pool = BufPool::new(2);
        let mut a = pool.acquire();
        a.extend_from_slice(b"junk");
        pool.release(a);
        pool.release(pool.acquire());

        let b = pool.acquire();
        assert!(b.is_empty(), "recycled buffers come back cleared");
        assert!(b.capacity() >= 4);

        pool.release(Vec::new());
        pool.release(Vec::new());
        pool.release(Vec::new());
        assert_eq!(pool.idle(), 2);
    }
}
