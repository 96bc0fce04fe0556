//! Growable read/write byte buffer used for protocol framing.
//!
//! One contiguous allocation with independent read (`r`) and write (`w`)
//! cursors. `buf[r..w]` is unread data, `buf[w..]` is free space. The
//! allocation only ever grows; `reset` rewinds both cursors.

const MIN_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ByteQueue {
    buf: Vec<u8>,
    r: usize,
    w: usize,
}

impl Default for ByteQueue {
    fn default() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }
}

impl ByteQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity.max(1)],
            r: 0,
            w: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.w - self.r
    }

    pub fn is_empty(&self) -> bool {
        self.r == self.w
    }

    /// Free bytes after the write cursor.
    pub fn free(&self) -> usize {
        self.buf.len() - self.w
    }

    pub fn read_pos(&self) -> usize {
        self.r
    }

    pub fn write_pos(&self) -> usize {
        self.w
    }

    pub fn readable(&self) -> &[u8] {
        &self.buf[self.r..self.w]
    }

    pub fn writable(&mut self) -> &mut [u8] {
        &mut self.buf[self.w..]
    }

    /// Marks `n` bytes of the writable region as filled.
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.free(), "commit past the end of the buffer");
        self.w += n;
    }

    /// Drops `n` unread bytes.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consume past the write cursor");
        self.r += n;
        if self.r == self.w {
            self.reset();
        }
    }

    /// Ensures at least `additional` bytes are writable.
    ///
    /// Unread bytes are kept: first by sliding them to the front of the
    /// allocation, then by growing it (doubling, or more if asked for).
    pub fn enlarge(&mut self, additional: usize) {
        if self.free() >= additional {
            return;
        }
        if self.r > 0 {
            self.buf.copy_within(self.r..self.w, 0);
            self.w -= self.r;
            self.r = 0;
            if self.free() >= additional {
                return;
            }
        }
        let needed = self.w + additional;
        let grown = (self.buf.len() * 2).max(needed);
        self.buf.resize(grown, 0);
    }

    pub fn push(&mut self, data: &[u8]) {
        self.enlarge(data.len());
        self.buf[self.w..self.w + data.len()].copy_from_slice(data);
        self.w += data.len();
    }

    /// Moves up to `out.len()` unread bytes into `out`.
    pub fn take_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len());
        out[..n].copy_from_slice(&self.buf[self.r..self.r + n]);
        self.consume(n);
        n
    }

    /// Offset (relative to the read cursor) of the first occurrence of `needle`.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() || self.len() < needle.len() {
            return None;
        }
        self.readable()
            .windows(needle.len())
            .position(|window| window == needle)
    }

    /// Rewinds both cursors to the start; capacity is unchanged.
    pub fn reset(&mut self) {
        self.r = 0;
        self.w = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enlarge_keeps_unread_bytes() {
        let mut bq = ByteQueue::with_capacity(8);
        bq.push(b"abcdef");
        bq.consume(2);
        bq.enlarge(64);
        assert!(bq.free() >= 64);
        assert_eq!(bq.readable(), b"cdef");
        bq.push(b"ghij");
        assert_eq!(bq.readable(), b"cdefghij");
    }

    #[test]
    fn enlarge_compacts_before_growing() {
        let mut bq = ByteQueue::with_capacity(16);
        bq.push(&[1u8; 12]);
        bq.consume(10);
        bq.enlarge(8);
        assert_eq!(bq.capacity(), 16);
        assert_eq!(bq.read_pos(), 0);
        assert_eq!(bq.readable(), &[1u8; 2]);
    }

    #[test]
    fn growth_is_geometric() {
        let mut bq = ByteQueue::with_capacity(100);
        bq.push(&[0u8; 100]);
        bq.enlarge(1);
        assert_eq!(bq.capacity(), 200);
        bq.enlarge(1000);
        assert_eq!(bq.capacity(), 1100);
    }

    #[test]
    fn reset_keeps_capacity() {
        let mut bq = ByteQueue::with_capacity(32);
        bq.push(&[7u8; 100]);
        let cap = bq.capacity();
        bq.consume(5);
        bq.reset();
        assert_eq!(bq.read_pos(), 0);
        assert_eq!(bq.write_pos(), 0);
        assert_eq!(bq.capacity(), cap);
        assert!(bq.is_empty());
    }

    #[test]
    fn commit_after_external_write() {
        let mut bq = ByteQueue::with_capacity(4);
        bq.enlarge(5);
        bq.writable()[..5].copy_from_slice(b"hello");
        bq.commit(5);
        assert_eq!(bq.find(b"llo"), Some(2));
        let mut out = [0u8; 3];
        assert_eq!(bq.take_into(&mut out), 3);
        assert_eq!(&out, b"hel");
        assert_eq!(bq.readable(), b"lo");
    }

    #[test]
    fn find_respects_read_cursor() {
        let mut bq = ByteQueue::default();
        bq.push(b"\r\n\r\nbody\r\n\r\n");
        bq.consume(4);
        assert_eq!(bq.find(b"\r\n\r\n"), Some(4));
        assert_eq!(bq.find(b"missing"), None);
    }
}
