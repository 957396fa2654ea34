use std::{io::IoSlice, sync::Arc};

use bodega::Item;
use bodega_proto::udp;
use bytes::Bytes;

use crate::pool::BufPool;

/// Vector-count ceiling per outbound message.
pub(crate) const IOV_MAX: usize = 1024;

/// One scatter/gather fragment. The owner tag tells the drain path what to
/// do once the reply completes: shared handles just drop, pooled suffix
/// buffers go back to the freelist.
pub(crate) enum Chunk {
    Shared(Bytes),
    Suffix(Vec<u8>),
}

impl Chunk {
    #[inline]
    fn as_slice(&self) -> &[u8] {
        match self {
            Chunk::Shared(b) => b,
            Chunk::Suffix(v) => v,
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.as_slice().len()
    }
}

/// One outbound message: a TCP write batch, or exactly one UDP datagram.
pub(crate) struct Msg {
    chunks: Vec<Chunk>,
    bytes: usize,
}

impl Msg {
    fn new() -> Self {
        Self { chunks: Vec::new(), bytes: 0 }
    }
}

/// A reply under assembly, and its drain cursor. Append-only while the
/// protocol engine runs; the state machine then drains it with vectored
/// sends and releases everything in one place.
pub(crate) struct Reply {
    msgs: Vec<Msg>,
    /// Items whose bytes this reply references; handles held until drained.
    items: Vec<Arc<Item>>,
    /// Datagram payload budget applies to every message (UDP), or only to
    /// the first (TCP, which keeps its opening burst under one MTU).
    udp_framed: bool,
    cursor_msg: usize,
    cursor_off: usize,
}

impl Reply {
    pub fn new(msg_capacity: usize, item_capacity: usize) -> Self {
        Self {
            msgs: Vec::with_capacity(msg_capacity),
            items: Vec::with_capacity(item_capacity),
            udp_framed: false,
            cursor_msg: 0,
            cursor_off: 0,
        }
    }

    pub fn set_udp_framed(&mut self, on: bool) {
        self.udp_framed = on;
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.iter().all(|m| m.bytes == 0)
    }

    pub fn msg_count(&self) -> usize {
        self.msgs.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.msgs.iter().map(|m| m.bytes).sum()
    }

    /// Keeps `item` alive until this reply is drained or abandoned.
    pub fn hold_item(&mut self, item: Arc<Item>) {
        self.items.push(item);
    }

    pub fn add_static(&mut self, data: &'static [u8]) {
        self.add_shared(Bytes::from_static(data));
    }

    /// Appends bytes, starting a new message at the vector-count limit and
    /// splitting across messages at the datagram payload boundary.
    pub fn add_shared(&mut self, mut data: Bytes) {
        loop {
            let room = self.make_space();
            if data.len() <= room {
                if !data.is_empty() {
                    self.push_chunk(Chunk::Shared(data));
                }
                return;
            }
            let head = data.split_to(room);
            self.push_chunk(Chunk::Shared(head));
        }
    }

    /// Appends a pooled suffix buffer. Never split: a suffix always fits a
    /// fresh message, so at worst it opens one.
    pub fn add_suffix(&mut self, buf: Vec<u8>) {
        let room = self.make_space();
        if buf.len() > room {
            self.msgs.push(Msg::new());
        }
        self.push_chunk(Chunk::Suffix(buf));
    }

    /// Ensures the current message can take at least one more byte and
    /// one more chunk; returns the byte room left in it.
    fn make_space(&mut self) -> usize {
        loop {
            if self.msgs.is_empty() {
                self.msgs.push(Msg::new());
            }
            let limit = self.payload_limit(self.msgs.len() - 1);
            let cur = self.msgs.last().expect("just ensured");
            if cur.chunks.len() >= IOV_MAX || cur.bytes >= limit {
                self.msgs.push(Msg::new());
                continue;
            }
            return limit - cur.bytes;
        }
    }

    /// UDP datagrams are always budgeted; a TCP reply keeps only its first
    /// message under the same cap so short replies fit one packet.
    fn payload_limit(&self, msg_idx: usize) -> usize {
        if self.udp_framed || msg_idx == 0 { udp::MAX_PAYLOAD } else { usize::MAX }
    }

    fn push_chunk(&mut self, chunk: Chunk) {
        let cur = self.msgs.last_mut().expect("make_space ran");
        cur.bytes += chunk.len();
        cur.chunks.push(chunk);
    }

    /// Collects unwritten slices from the cursor for a TCP vectored send.
    pub fn gather<'a>(&'a self, out: &mut Vec<IoSlice<'a>>) {
        out.clear();
        let mut skip = self.cursor_off;
        for msg in &self.msgs[self.cursor_msg.min(self.msgs.len())..] {
            for chunk in &msg.chunks {
                if out.len() >= IOV_MAX {
                    return;
                }
                let slice = chunk.as_slice();
                if skip >= slice.len() {
                    skip -= slice.len();
                    continue;
                }
                out.push(IoSlice::new(&slice[skip..]));
                skip = 0;
            }
        }
    }

    /// Advances the drain cursor by `written` bytes; true once everything
    /// is out the door.
    pub fn advance(&mut self, mut written: usize) -> bool {
        while self.cursor_msg < self.msgs.len() {
            let msg_left = self.msgs[self.cursor_msg].bytes - self.cursor_off;
            if written < msg_left {
                self.cursor_off += written;
                return false;
            }
            written -= msg_left;
            self.cursor_msg += 1;
            self.cursor_off = 0;
        }
        true
    }

    pub fn fully_drained(&self) -> bool {
        self.cursor_msg >= self.msgs.len()
    }

    /// Next undrained UDP message rendered as one datagram:
    /// 8-byte frame header plus the message payload.
    pub fn next_datagram(&self, request_id: u16) -> Option<Vec<u8>> {
        let msg = self.msgs.get(self.cursor_msg)?;
        let header = udp::FrameHeader {
            request_id,
            seq: self.cursor_msg as u16,
            total: self.msgs.len() as u16,
        };
        let mut dgram = Vec::with_capacity(udp::HEADER_LEN + msg.bytes);
        dgram.extend_from_slice(&header.encode());
        for chunk in &msg.chunks {
            dgram.extend_from_slice(chunk.as_slice());
        }
        Some(dgram)
    }

    pub fn skip_datagram(&mut self) {
        self.cursor_msg += 1;
        self.cursor_off = 0;
    }

    /// The single cleanup point: returns suffix buffers to the pool, drops
    /// item handles, rewinds the cursor.
    pub fn reset(&mut self, suffix_pool: &BufPool) {
        for msg in &mut self.msgs {
            for chunk in msg.chunks.drain(..) {
                if let Chunk::Suffix(buf) = chunk {
                    suffix_pool.release(buf);
                }
            }
        }
        self.msgs.clear();
        self.items.clear();
        self.cursor_msg = 0;
        self.cursor_off = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(reply: &Reply) -> Vec<u8> {
        let mut out = Vec::new();
        for msg in &reply.msgs {
            for chunk in &msg.chunks {
                out.extend_from_slice(chunk.as_slice());
            }
        }
        out
    }

    #[test]
    fn single_message_assembly() {
        let mut reply = Reply::new(4, 4);
        reply.add_static(b"VALUE foo 0 3\r\n");
        reply.add_shared(Bytes::from_static(b"bar\r\n"));
        reply.add_static(b"END\r\n");
        assert_eq!(reply.msg_count(), 1);
        assert_eq!(flat(&reply), b"VALUE foo 0 3\r\nbar\r\nEND\r\n");
    }

    #[test]
    fn splits_at_datagram_payload() {
        let mut reply = Reply::new(4, 4);
        reply.set_udp_framed(true);
        let big = Bytes::from(vec![b'x'; udp::MAX_PAYLOAD * 2 + 100]);
        reply.add_shared(big.clone());
        assert_eq!(reply.msg_count(), 3);
        assert_eq!(reply.total_bytes(), big.len());
        assert!(reply.msgs.iter().all(|m| m.bytes <= udp::MAX_PAYLOAD));
        assert_eq!(flat(&reply), big.as_ref());
    }

    #[test]
    fn tcp_caps_only_first_message() {
        let mut reply = Reply::new(4, 4);
        let big = Bytes::from(vec![b'y'; udp::MAX_PAYLOAD * 3]);
        reply.add_shared(big);
        assert_eq!(reply.msg_count(), 2);
        assert_eq!(reply.msgs[0].bytes, udp::MAX_PAYLOAD);
        assert_eq!(reply.msgs[1].bytes, udp::MAX_PAYLOAD * 2);
    }

    #[test]
    fn vector_count_limit_rolls_over() {
        let mut reply = Reply::new(4, 4);
        for _ in 0..IOV_MAX + 1 {
            reply.add_suffix(b"a".to_vec());
        }
        assert_eq!(reply.msg_count(), 2);
    }

    #[test]
    fn advance_tracks_partial_writes() {
        let mut reply = Reply::new(4, 4);
        reply.add_static(b"0123456789");
        assert!(!reply.advance(4));
        let mut slices = Vec::new();
        reply.gather(&mut slices);
        assert_eq!(&*slices[0], b"456789");
        assert!(reply.advance(6));
        assert!(reply.fully_drained());
    }

    #[test]
    fn datagrams_carry_sequence() {
        let mut reply = Reply::new(4, 4);
        reply.set_udp_framed(true);
        reply.add_shared(Bytes::from(vec![b'z'; udp::MAX_PAYLOAD + 1]));
        let first = reply.next_datagram(0xbeef).unwrap();
        assert_eq!(&first[..2], &0xbeefu16.to_be_bytes());
        assert_eq!(&first[2..4], &0u16.to_be_bytes());
        assert_eq!(&first[4..6], &2u16.to_be_bytes());
        assert_eq!(first.len(), udp::HEADER_LEN + udp::MAX_PAYLOAD);
        reply.skip_datagram();
        let second = reply.next_datagram(0xbeef).unwrap();
        assert_eq!(second.len(), udp::HEADER_LEN + 1);
        reply.skip_datagram();
        assert!(reply.next_datagram(0xbeef).is_none());
    }

    #[test]
    fn reset_returns_suffixes_to_pool() {
        let pool = BufPool::new(8);
        let mut reply = Reply::new(4, 4);
        reply.add_suffix(pool.acquire());
        reply.add_suffix(pool.acquire());
        reply.reset(&pool);
        assert_eq!(pool.idle(), 2);
        assert!(reply.is_empty());
        assert_eq!(reply.msg_count(), 0);
    }
}
