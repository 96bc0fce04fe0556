//! Memory-mapped sidecar (`<dest>.tmd`) holding the resumable transfer state.
//!
//! Layout: a 64-byte header, `nr_user` chunk entries of 24 bytes
//! (`start_pos`, `cur_pos`, `end_pos`), then `eb_length` bytes reserved for
//! the serialised side-table. Everything is little-endian. The mapping is
//! the source of truth on disk; the decoded header and chunk table are kept
//! in memory and written back through typed accessors.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use mmap_io::MemoryMappedFile;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::chunk::{self, DataChunk};
use crate::error::{MgetError, Result};
use crate::side_table::{SideTable, KEY_FILE_NAME, KEY_PASSWORD, KEY_URL, KEY_USER};
use crate::state::{DownloadState, DownloadStatus, PartState};

pub const MAGIC: [u8; 4] = *b"TMD\0";
pub const HEADER_LEN: usize = 64;
pub const CHUNK_ENTRY_LEN: usize = 24;
pub const EB_UNIT: usize = 1024;
pub const SIDECAR_SUFFIX: &str = "tmd";

pub const CURRENT_VERSION: Version = Version {
    major: 1,
    minor: 0,
    patch: 0,
};

const FLAG_UPDATE_NAME: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub fn to_u32(self) -> u32 {
        (u32::from(self.major) << 24) | (u32::from(self.minor) << 16) | (u32::from(self.patch) << 8)
    }

    pub fn from_u32(raw: u32) -> Self {
        Self {
            major: (raw >> 24) as u8,
            minor: (raw >> 16) as u8,
            patch: (raw >> 8) as u8,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataHeader {
    pub version: Version,
    pub package_size: u64,
    pub chunk_size: u64,
    pub current_size: u64,
    pub last_time: u64,
    pub acc_time: u32,
    pub status: DownloadStatus,
    pub nr_user: u8,
    pub nr_effective: u8,
    pub acon: u8,
    pub eb_length: u16,
    pub update_name: bool,
}

impl MetadataHeader {
    fn fresh(nr_user: u8, eb_length: u16) -> Self {
        Self {
            version: CURRENT_VERSION,
            package_size: 0,
            chunk_size: 0,
            current_size: 0,
            last_time: now_unix(),
            acc_time: 0,
            status: DownloadStatus::Init,
            nr_user,
            nr_effective: 0,
            acon: 0,
            eb_length,
            update_name: false,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC);
        out[4..8].copy_from_slice(&self.version.to_u32().to_le_bytes());
        out[8..16].copy_from_slice(&self.package_size.to_le_bytes());
        out[16..24].copy_from_slice(&self.chunk_size.to_le_bytes());
        out[24..32].copy_from_slice(&self.current_size.to_le_bytes());
        out[32..40].copy_from_slice(&self.last_time.to_le_bytes());
        out[40..44].copy_from_slice(&self.acc_time.to_le_bytes());
        out[44] = self.status.as_u8();
        out[45] = self.nr_user;
        out[46] = self.nr_effective;
        out[47] = self.acon;
        out[48..50].copy_from_slice(&self.eb_length.to_le_bytes());
        out[50] = if self.update_name { FLAG_UPDATE_NAME } else { 0 };
        out
    }

    /// Decodes a header without judging its version.
    pub fn decode(buf: &[u8]) -> std::result::Result<Self, String> {
        if buf.len() < HEADER_LEN {
            return Err(format!("header is {} bytes, expected {HEADER_LEN}", buf.len()));
        }
        if buf[0..4] != MAGIC {
            return Err("bad magic".to_string());
        }
        let status = DownloadStatus::from_u8(buf[44])
            .ok_or_else(|| format!("unknown status byte {}", buf[44]))?;
        Ok(Self {
            version: Version::from_u32(le_u32(&buf[4..8])),
            package_size: le_u64(&buf[8..16]),
            chunk_size: le_u64(&buf[16..24]),
            current_size: le_u64(&buf[24..32]),
            last_time: le_u64(&buf[32..40]),
            acc_time: le_u32(&buf[40..44]),
            status,
            nr_user: buf[45],
            nr_effective: buf[46],
            acon: buf[47],
            eb_length: u16::from_le_bytes([buf[48], buf[49]]),
            update_name: buf[50] & FLAG_UPDATE_NAME != 0,
        })
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

fn encode_chunk(chunk: &DataChunk) -> [u8; CHUNK_ENTRY_LEN] {
    let mut out = [0u8; CHUNK_ENTRY_LEN];
    out[0..8].copy_from_slice(&chunk.start_pos.to_le_bytes());
    out[8..16].copy_from_slice(&chunk.cur_pos.to_le_bytes());
    out[16..24].copy_from_slice(&chunk.end_pos.to_le_bytes());
    out
}

fn decode_chunk(bytes: &[u8]) -> DataChunk {
    DataChunk {
        start_pos: le_u64(&bytes[0..8]),
        cur_pos: le_u64(&bytes[8..16]),
        end_pos: le_u64(&bytes[16..24]),
    }
}

pub fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Reserved side-table bytes needed for `needed` serialised bytes.
fn eb_length_for(needed: usize) -> usize {
    needed.max(1).div_ceil(EB_UNIT) * EB_UNIT
}

/// `<dest>.tmd` next to the destination file.
pub fn sidecar_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".");
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Strings stored in the side-table when a sidecar is first created.
#[derive(Debug, Clone, Default)]
pub struct SideEntries<'a> {
    pub url: &'a str,
    pub file_name: &'a str,
    pub user: Option<&'a str>,
    pub password: Option<&'a str>,
}

pub struct MetadataStore {
    path: PathBuf,
    mmap: MemoryMappedFile,
    header: MetadataHeader,
    chunks: Vec<DataChunk>,
    table: SideTable,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("chunks", &self.chunks)
            .finish()
    }
}

impl MetadataStore {
    /// Creates a zero-filled sidecar sized for `nr_user` chunks, replacing
    /// any file already at `path`.
    pub fn create_fresh(path: &Path, entries: SideEntries<'_>, nr_user: u8) -> Result<Self> {
        let nr_user = nr_user.max(1);
        let mut table = SideTable::default();
        table.insert(KEY_URL, entries.url);
        table.insert(KEY_FILE_NAME, entries.file_name);
        if let Some(user) = entries.user {
            table.insert(KEY_USER, user);
        }
        if let Some(password) = entries.password {
            table.insert(KEY_PASSWORD, password);
        }

        let eb_length = eb_length_for(table.serialized_len());
        let eb_length = u16::try_from(eb_length)
            .map_err(|_| MgetError::resource(path, "side-table does not fit the header field"))?;
        let header = MetadataHeader::fresh(nr_user, eb_length);
        let total_len = layout_len(nr_user, eb_length);

        match std::fs::remove_file(path) {
            Ok(()) => debug!("replaced stale metadata file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(MgetError::resource(path, e)),
        }
        let mmap = MemoryMappedFile::create_rw(path, total_len as u64)
            .map_err(|e| MgetError::resource(path, e.to_string()))?;

        let mut store = Self {
            path: path.to_path_buf(),
            mmap,
            header,
            chunks: Vec::new(),
            table,
        };
        store.store_header()?;
        store.store_table()?;
        store.sync()?;
        debug!(
            "created metadata {} ({} bytes, {} connection slots)",
            path.display(),
            total_len,
            nr_user
        );
        Ok(store)
    }

    /// Maps an existing sidecar. `Ok(None)` when there is no file at `path`.
    pub fn load_existing(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let mmap = MemoryMappedFile::open_rw(path)
            .map_err(|e| MgetError::resource(path, e.to_string()))?;
        let file_len = mmap.len() as usize;
        if file_len < HEADER_LEN {
            return Err(MgetError::corrupt(path, format!("only {file_len} bytes")));
        }

        let mut raw = [0u8; HEADER_LEN];
        mmap.read_into(0, &mut raw)
            .map_err(|e| MgetError::resource(path, e.to_string()))?;
        let header = MetadataHeader::decode(&raw).map_err(|reason| MgetError::corrupt(path, reason))?;

        check_version(path, header.version)?;

        if header.nr_user == 0 || header.nr_effective > header.nr_user {
            return Err(MgetError::corrupt(
                path,
                format!(
                    "nr_effective {} exceeds nr_user {}",
                    header.nr_effective, header.nr_user
                ),
            ));
        }
        let expected = layout_len(header.nr_user, header.eb_length);
        if header.eb_length == 0 || file_len < expected {
            return Err(MgetError::corrupt(
                path,
                format!("file is {file_len} bytes, layout needs {expected}"),
            ));
        }

        let mut table_bytes = vec![0u8; CHUNK_ENTRY_LEN * usize::from(header.nr_effective)];
        mmap.read_into(HEADER_LEN as u64, &mut table_bytes)
            .map_err(|e| MgetError::resource(path, e.to_string()))?;
        let chunks: Vec<DataChunk> = table_bytes.chunks_exact(CHUNK_ENTRY_LEN).map(decode_chunk).collect();
        validate_chunks(&chunks, header.package_size).map_err(|reason| MgetError::corrupt(path, reason))?;

        let mut eb = vec![0u8; usize::from(header.eb_length)];
        mmap.read_into(side_table_offset(header.nr_user) as u64, &mut eb)
            .map_err(|e| MgetError::resource(path, e.to_string()))?;
        let table = SideTable::deserialize(&eb).map_err(|e| MgetError::corrupt(path, e))?;

        debug!(
            "loaded metadata {}: status {:?}, {} of {} chunks populated",
            path.display(),
            header.status,
            header.nr_effective,
            header.nr_user
        );
        Ok(Some(Self {
            path: path.to_path_buf(),
            mmap,
            header,
            chunks,
            table,
        }))
    }

    /// Splits a freshly sized resource and writes the chunk table.
    ///
    /// `can_split == false` forces a single chunk covering the whole body.
    pub fn update_after_size_known(&mut self, total_size: u64, can_split: bool) -> Result<()> {
        let requested = if can_split { u32::from(self.header.nr_user) } else { 1 };
        self.chunks = chunk::split(total_size, requested);
        self.header.package_size = total_size;
        self.header.chunk_size = if can_split {
            chunk::chunk_size_for(total_size, requested)
        } else {
            total_size
        };
        self.header.current_size = 0;
        self.header.nr_effective = self.chunks.len() as u8;

        for (i, chunk) in self.chunks.iter().enumerate() {
            self.mmap
                .update_region(chunk_offset(i) as u64, &encode_chunk(chunk))
                .map_err(|e| MgetError::resource(&self.path, e.to_string()))?;
        }
        self.store_header()?;
        debug!(
            "{}: {} bytes in {} chunks of {}",
            self.path.display(),
            total_size,
            self.chunks.len(),
            self.header.chunk_size
        );
        Ok(())
    }

    /// Records a total learnt only after an unframed body was streamed.
    pub fn set_streamed_size(&mut self, total_size: u64) -> Result<()> {
        self.header.package_size = total_size;
        self.header.current_size = total_size;
        self.header.chunk_size = total_size;
        self.header.nr_effective = 0;
        self.chunks.clear();
        self.store_header()
    }

    pub fn set_chunk(&mut self, index: usize, chunk: DataChunk) -> Result<()> {
        let slot = self
            .chunks
            .get_mut(index)
            .ok_or_else(|| MgetError::Internal(format!("chunk index {index} out of range")))?;
        *slot = chunk;
        self.mmap
            .update_region(chunk_offset(index) as u64, &encode_chunk(&chunk))
            .map_err(|e| MgetError::resource(&self.path, e.to_string()))?;
        self.header.current_size = chunk::received(&self.chunks);
        Ok(())
    }

    /// Puts every chunk back to its start offset.
    pub fn rewind_chunks(&mut self) -> Result<()> {
        for i in 0..self.chunks.len() {
            let mut chunk = self.chunks[i];
            chunk.rewind();
            self.set_chunk(i, chunk)?;
        }
        self.store_header()
    }

    pub fn store_header(&mut self) -> Result<()> {
        self.mmap
            .update_region(0, &self.header.encode())
            .map_err(|e| MgetError::resource(&self.path, e.to_string()))
    }

    fn store_table(&mut self) -> Result<()> {
        let bytes = self.table.serialize();
        if bytes.len() > usize::from(self.header.eb_length) {
            self.grow_side_table(bytes.len())?;
        }
        self.mmap
            .update_region(side_table_offset(self.header.nr_user) as u64, &bytes)
            .map_err(|e| MgetError::resource(&self.path, e.to_string()))
    }

    fn grow_side_table(&mut self, needed: usize) -> Result<()> {
        let eb_length = u16::try_from(eb_length_for(needed))
            .map_err(|_| MgetError::resource(&self.path, "side-table exceeds 64 KiB"))?;
        let new_len = layout_len(self.header.nr_user, eb_length);

        self.mmap
            .flush()
            .map_err(|e| MgetError::resource(&self.path, e.to_string()))?;
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| MgetError::resource(&self.path, e))?;
        file.set_len(new_len as u64)
            .map_err(|e| MgetError::resource(&self.path, e))?;
        drop(file);
        self.mmap = MemoryMappedFile::open_rw(&self.path)
            .map_err(|e| MgetError::resource(&self.path, e.to_string()))?;

        debug!(
            "{}: side-table area grown {} -> {} bytes",
            self.path.display(),
            self.header.eb_length,
            eb_length
        );
        self.header.eb_length = eb_length;
        self.store_header()
    }

    /// Writes the header and flushes the mapping to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.header.last_time = now_unix();
        self.store_header()?;
        self.mmap
            .flush()
            .map_err(|e| MgetError::resource(&self.path, e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &MetadataHeader {
        &self.header
    }

    /// Mutable header; call [`store_header`](Self::store_header) or
    /// [`sync`](Self::sync) to persist.
    pub fn header_mut(&mut self) -> &mut MetadataHeader {
        &mut self.header
    }

    pub fn chunks(&self) -> &[DataChunk] {
        &self.chunks
    }

    pub fn remaining(&self) -> u64 {
        chunk::remaining(&self.chunks)
    }

    pub fn is_complete(&self) -> bool {
        self.header.package_size > 0 && self.remaining() == 0 && !self.chunks.is_empty()
    }

    pub fn url(&self) -> Option<&str> {
        self.table.peek(KEY_URL)
    }

    pub fn file_name(&self) -> Option<&str> {
        self.table.peek(KEY_FILE_NAME)
    }

    pub fn user(&self) -> Option<&str> {
        self.table.peek(KEY_USER)
    }

    pub fn password(&self) -> Option<&str> {
        self.table.peek(KEY_PASSWORD)
    }

    pub fn side_entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.table.iter()
    }

    pub fn set_url(&mut self, url: &str) -> Result<()> {
        self.table.insert(KEY_URL, url);
        self.store_table()
    }

    pub fn set_file_name(&mut self, name: &str) -> Result<()> {
        self.table.insert(KEY_FILE_NAME, name);
        self.store_table()
    }

    pub fn set_credentials(&mut self, user: &str, password: &str) -> Result<()> {
        self.table.insert(KEY_USER, user);
        self.table.insert(KEY_PASSWORD, password);
        self.store_table()
    }

    /// Moves the sidecar after the destination was renamed.
    pub fn relocate(&mut self, new_path: &Path) -> Result<()> {
        self.mmap
            .flush()
            .map_err(|e| MgetError::resource(&self.path, e.to_string()))?;
        std::fs::rename(&self.path, new_path).map_err(|e| MgetError::resource(new_path, e))?;
        self.path = new_path.to_path_buf();
        Ok(())
    }

    pub fn snapshot(&self) -> DownloadState {
        DownloadState {
            url: self.url().unwrap_or_default().to_string(),
            file_name: self.file_name().unwrap_or_default().to_string(),
            status: self.header.status,
            total_size: self.header.package_size,
            chunk_size: self.header.chunk_size,
            current_size: self.header.current_size,
            last_time: self.header.last_time,
            acc_time: self.header.acc_time,
            nr_user: self.header.nr_user,
            nr_effective: self.header.nr_effective,
            acon: self.header.acon,
            parts: self
                .chunks
                .iter()
                .enumerate()
                .map(|(i, c)| PartState::from_chunk(i, c))
                .collect(),
        }
    }
}

fn chunk_offset(index: usize) -> usize {
    HEADER_LEN + index * CHUNK_ENTRY_LEN
}

fn side_table_offset(nr_user: u8) -> usize {
    chunk_offset(usize::from(nr_user))
}

fn layout_len(nr_user: u8, eb_length: u16) -> usize {
    side_table_offset(nr_user) + usize::from(eb_length)
}

fn check_version(path: &Path, found: Version) -> Result<()> {
    if found == CURRENT_VERSION {
        return Ok(());
    }
    if found.major != CURRENT_VERSION.major {
        error!(
            "{} was written by version {found}, this build reads {}",
            path.display(),
            CURRENT_VERSION
        );
        return Err(MgetError::VersionIncompatible {
            path: path.to_path_buf(),
            found: found.to_string(),
        });
    }
    warn!(
        "{} was written by version {found} (current {}), continuing",
        path.display(),
        CURRENT_VERSION
    );
    Ok(())
}

fn validate_chunks(chunks: &[DataChunk], package_size: u64) -> std::result::Result<(), String> {
    let Some(first) = chunks.first() else {
        return Ok(());
    };
    if first.start_pos != 0 {
        return Err(format!("first chunk starts at {}", first.start_pos));
    }
    for (i, chunk) in chunks.iter().enumerate() {
        if !chunk.is_well_formed() {
            return Err(format!("chunk {i} is malformed: {chunk:?}"));
        }
    }
    for pair in chunks.windows(2) {
        if pair[0].end_pos != pair[1].start_pos {
            return Err(format!(
                "gap between {} and {}",
                pair[0].end_pos, pair[1].start_pos
            ));
        }
    }
    let last = chunks[chunks.len() - 1];
    if last.end_pos != package_size {
        return Err(format!(
            "chunks end at {}, package size is {package_size}",
            last.end_pos
        ));
    }
    Ok(())
}
