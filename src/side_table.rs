//! Fixed-capacity string map stored inside the sidecar file.
//!
//! Open addressing with linear probing. When an insert finds the table
//! full, the least recently accessed entry is evicted first. Serialised as
//! `u32 version | u32 capacity | u32 count | count x (u32 klen | key | u32 vlen | val)`,
//! all little-endian.

use thiserror::Error;

pub const SIDE_TABLE_VERSION: u32 = 1;
pub const DEFAULT_CAPACITY: usize = 16;

pub const KEY_URL: &str = "url";
pub const KEY_FILE_NAME: &str = "fn";
pub const KEY_USER: &str = "user";
pub const KEY_PASSWORD: &str = "passwd";

const HEADER_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SideTableError {
    #[error("side-table truncated at offset {0}")]
    Truncated(usize),
    #[error("unsupported side-table version {0}")]
    UnsupportedVersion(u32),
    #[error("side-table holds {count} entries but capacity is {capacity}")]
    Overfull { count: u32, capacity: u32 },
    #[error("side-table entry is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone)]
struct Slot {
    key: String,
    value: String,
    last_access: u64,
}

#[derive(Debug, Clone)]
pub struct SideTable {
    slots: Vec<Option<Slot>>,
    count: usize,
    clock: u64,
}

impl Default for SideTable {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

fn fnv1a(key: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

impl SideTable {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            count: 0,
            clock: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn home(&self, key: &str) -> usize {
        (fnv1a(key) % self.slots.len() as u64) as usize
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn position(&self, key: &str) -> Option<usize> {
        let cap = self.slots.len();
        let mut idx = self.home(key);
        for _ in 0..cap {
            match &self.slots[idx] {
                None => return None,
                Some(slot) if slot.key == key => return Some(idx),
                Some(_) => idx = (idx + 1) % cap,
            }
        }
        None
    }

    /// Looks a key up and marks it as recently used.
    pub fn get(&mut self, key: &str) -> Option<&str> {
        let idx = self.position(key)?;
        let now = self.tick();
        let slot = self.slots[idx].as_mut()?;
        slot.last_access = now;
        Some(slot.value.as_str())
    }

    /// Looks a key up without touching its access time.
    pub fn peek(&self, key: &str) -> Option<&str> {
        let idx = self.position(key)?;
        self.slots[idx].as_ref().map(|slot| slot.value.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    /// Inserts or updates `key`. Returns the evicted key when the table was full.
    pub fn insert(&mut self, key: &str, value: &str) -> Option<String> {
        let now = self.tick();
        if let Some(idx) = self.position(key) {
            if let Some(slot) = self.slots[idx].as_mut() {
                slot.value = value.to_string();
                slot.last_access = now;
            }
            return None;
        }

        let evicted = if self.count == self.slots.len() {
            self.evict_lru()
        } else {
            None
        };

        let cap = self.slots.len();
        let mut idx = self.home(key);
        while self.slots[idx].is_some() {
            idx = (idx + 1) % cap;
        }
        self.slots[idx] = Some(Slot {
            key: key.to_string(),
            value: value.to_string(),
            last_access: now,
        });
        self.count += 1;
        evicted
    }

    fn evict_lru(&mut self) -> Option<String> {
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|s| (i, s.last_access)))
            .min_by_key(|&(_, access)| access)
            .map(|(i, _)| i)?;
        let removed = self.remove_at(victim);
        removed.map(|slot| slot.key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.position(key)?;
        self.remove_at(idx).map(|slot| slot.value)
    }

    /// Removes the slot at `hole` and shifts later members of its probe run
    /// back so every remaining key stays reachable from its home slot.
    fn remove_at(&mut self, mut hole: usize) -> Option<Slot> {
        let removed = self.slots[hole].take()?;
        self.count -= 1;

        let cap = self.slots.len();
        let mut next = (hole + 1) % cap;
        while let Some(slot) = &self.slots[next] {
            let home = self.home(&slot.key);
            let movable = if hole <= next {
                home <= hole || home > next
            } else {
                home <= hole && home > next
            };
            if movable {
                self.slots[hole] = self.slots[next].take();
                hole = next;
            }
            next = (next + 1) % cap;
            if next == hole {
                break;
            }
        }
        Some(removed)
    }

    /// Entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.slots
            .iter()
            .flatten()
            .map(|slot| (slot.key.as_str(), slot.value.as_str()))
    }

    pub fn serialized_len(&self) -> usize {
        HEADER_LEN
            + self
                .iter()
                .map(|(k, v)| 8 + k.len() + v.len())
                .sum::<usize>()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_len());
        out.extend_from_slice(&SIDE_TABLE_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.slots.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.count as u32).to_le_bytes());
        for (key, value) in self.iter() {
            out.extend_from_slice(&(key.len() as u32).to_le_bytes());
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(value.as_bytes());
        }
        out
    }

    /// Rebuilds a table from `buf`. Trailing bytes after the last record
    /// (the unused part of the reserved area) are ignored.
    pub fn deserialize(buf: &[u8]) -> Result<Self, SideTableError> {
        let mut reader = Reader { buf, pos: 0 };
        let version = reader.u32()?;
        if version != SIDE_TABLE_VERSION {
            return Err(SideTableError::UnsupportedVersion(version));
        }
        let capacity = reader.u32()?;
        let count = reader.u32()?;
        if capacity == 0 || count > capacity {
            return Err(SideTableError::Overfull { count, capacity });
        }

        let mut table = SideTable::with_capacity(capacity as usize);
        for _ in 0..count {
            let key = reader.string()?;
            let value = reader.string()?;
            table.insert(&key, &value);
        }
        Ok(table)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], SideTableError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(SideTableError::Truncated(self.pos))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u32(&mut self) -> Result<u32, SideTableError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn string(&mut self) -> Result<String, SideTableError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| SideTableError::InvalidUtf8)
    }
}
