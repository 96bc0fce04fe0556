use serde::Serialize;

/// Smallest chunk handed to a single connection.
pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;

/// A contiguous byte range `[start_pos, end_pos)` of the remote resource.
///
/// `cur_pos` is the next offset to be written; the chunk is complete once
/// `cur_pos == end_pos`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DataChunk {
    pub start_pos: u64,
    pub cur_pos: u64,
    pub end_pos: u64,
}

impl DataChunk {
    pub fn new(start_pos: u64, end_pos: u64) -> Self {
        Self {
            start_pos,
            cur_pos: start_pos,
            end_pos,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.cur_pos >= self.end_pos
    }

    pub fn len(&self) -> u64 {
        self.end_pos - self.start_pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn received(&self) -> u64 {
        self.cur_pos.saturating_sub(self.start_pos)
    }

    pub fn remaining(&self) -> u64 {
        self.end_pos.saturating_sub(self.cur_pos)
    }

    /// Moves `cur_pos` forward by `n`, never past `end_pos`.
    pub fn advance(&mut self, n: u64) {
        self.cur_pos = (self.cur_pos + n).min(self.end_pos);
    }

    pub fn rewind(&mut self) {
        self.cur_pos = self.start_pos;
    }

    pub fn is_well_formed(&self) -> bool {
        self.start_pos <= self.cur_pos && self.cur_pos <= self.end_pos
    }
}

/// Chunk size the splitter picks for `total_size` bytes over `requested`
/// connections: the minimum, or the next power-of-two multiple of it.
pub fn chunk_size_for(total_size: u64, requested: u32) -> u64 {
    let n = u64::from(requested.max(1));
    let raw = total_size / n;
    if raw <= MIN_CHUNK_SIZE {
        return MIN_CHUNK_SIZE;
    }
    let k = (raw / MIN_CHUNK_SIZE).ilog2() + 1;
    MIN_CHUNK_SIZE << k
}

/// Splits `[0, total_size)` into at most `requested` chunks.
///
/// Every chunk spans the chunk size except the last, which ends at
/// `total_size`: it is shorter, or longer when the remainder would
/// otherwise need a chunk beyond `requested`.
///
/// Deterministic: resumed metadata trusts a previously split table, so the
/// same inputs must always produce the same boundaries. Returns an empty
/// table when `total_size` is zero.
pub fn split(total_size: u64, requested: u32) -> Vec<DataChunk> {
    if total_size == 0 {
        return Vec::new();
    }
    let n = requested.max(1);
    let cs = chunk_size_for(total_size, n);

    let mut chunks = Vec::with_capacity(n as usize);
    let mut start = 0u64;
    for i in 0..n {
        let end = start.saturating_add(cs);
        if end >= total_size || i + 1 == n {
            chunks.push(DataChunk::new(start, total_size));
            break;
        }
        chunks.push(DataChunk::new(start, end));
        start = end;
    }
    chunks
}

/// Bytes outstanding across a chunk table.
pub fn remaining(chunks: &[DataChunk]) -> u64 {
    chunks.iter().map(DataChunk::remaining).sum()
}

pub fn received(chunks: &[DataChunk]) -> u64 {
    chunks.iter().map(DataChunk::received).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_size_yields_nothing() {
        assert!(split(0, 4).is_empty());
    }

    #[test]
    fn zero_connections_is_one() {
        let chunks = split(10, 0);
        assert_eq!(chunks, vec![DataChunk::new(0, 10)]);
    }

    #[test]
    fn small_resource_uses_minimum_chunk() {
        let chunks = split(100_000, 8);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], DataChunk::new(0, MIN_CHUNK_SIZE));
        assert_eq!(chunks[1], DataChunk::new(MIN_CHUNK_SIZE, 100_000));
    }

    #[test]
    fn million_bytes_over_four() {
        let chunks = split(1_000_000, 4);
        assert_eq!(chunk_size_for(1_000_000, 4), 262_144);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].end_pos, 1_000_000);
        let covered: u64 = chunks.iter().map(DataChunk::len).sum();
        assert_eq!(covered, 1_000_000);
    }

    #[test]
    fn ten_million_over_four() {
        // 10_000_000 / 4 = 2_500_000 -> 38 * 64K -> next pow2 multiple is 64 * 64K.
        assert_eq!(chunk_size_for(10_000_000, 4), 4 * 1024 * 1024);
        let chunks = split(10_000_000, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].end_pos, 10_000_000);
    }

    #[test]
    fn remainder_never_adds_a_chunk() {
        let total = 2 * MIN_CHUNK_SIZE + 1;
        let chunks = split(total, 2);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].end_pos, total);
        assert_eq!(chunks[1].len(), MIN_CHUNK_SIZE + 1);
    }

    #[test]
    fn advance_is_clamped() {
        let mut chunk = DataChunk::new(10, 20);
        chunk.advance(4);
        assert_eq!(chunk.cur_pos, 14);
        chunk.advance(100);
        assert!(chunk.is_complete());
        assert_eq!(chunk.cur_pos, 20);
        chunk.rewind();
        assert_eq!(chunk.received(), 0);
    }

    proptest! {
        #[test]
        fn chunks_partition_the_resource(total in 1u64..(1u64 << 34), n in 1u32..=40) {
            prop_assume!(u64::from(n) <= total);
            let chunks = split(total, n);
            let cs = chunk_size_for(total, n);

            prop_assert!(!chunks.is_empty());
            prop_assert!(chunks.len() <= n as usize);
            prop_assert_eq!(chunks[0].start_pos, 0);
            prop_assert_eq!(chunks.last().unwrap().end_pos, total);
            prop_assert_eq!(cs % MIN_CHUNK_SIZE, 0);
            prop_assert!((cs / MIN_CHUNK_SIZE).is_power_of_two());
            for pair in chunks.windows(2) {
                prop_assert_eq!(pair[0].end_pos, pair[1].start_pos);
                prop_assert_eq!(pair[0].len(), cs);
            }
            for chunk in &chunks {
                prop_assert_eq!(chunk.cur_pos, chunk.start_pos);
            }
        }

        #[test]
        fn split_is_deterministic(total in 1u64..(1u64 << 40), n in 1u32..=40) {
            prop_assert_eq!(split(total, n), split(total, n));
        }
    }
}
