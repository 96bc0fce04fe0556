//! Memory-mapped destination file written by every chunk connection.

use std::path::{Path, PathBuf};

use mmap_io::MemoryMappedFile;
use tracing::debug;

use crate::error::{MgetError, Result};

pub struct OutputFile {
    path: PathBuf,
    mmap: MemoryMappedFile,
    len: u64,
}

impl std::fmt::Debug for OutputFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputFile")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

impl OutputFile {
    /// Creates (or truncates) `path` to exactly `len` bytes and maps it.
    pub fn create(path: &Path, len: u64) -> Result<Self> {
        if len == 0 {
            return Err(MgetError::resource(path, "cannot map an empty file"));
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!("replacing {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(MgetError::resource(path, e)),
        }
        let mmap = MemoryMappedFile::create_rw(path, len)
            .map_err(|e| MgetError::resource(path, e.to_string()))?;
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            len,
        })
    }

    /// Maps an existing file; `Ok(None)` when it is missing or not `len` bytes.
    pub fn open_existing(path: &Path, len: u64) -> Result<Option<Self>> {
        let on_disk = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MgetError::resource(path, e)),
        };
        if len == 0 || on_disk != len {
            debug!(
                "{} is {} bytes, expected {}; not reusing it",
                path.display(),
                on_disk,
                len
            );
            return Ok(None);
        }
        let mmap = MemoryMappedFile::open_rw(path)
            .map_err(|e| MgetError::resource(path, e.to_string()))?;
        Ok(Some(Self {
            path: path.to_path_buf(),
            mmap,
            len,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `data` to `offset`; the range must lie inside the file.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let fits = offset
            .checked_add(data.len() as u64)
            .is_some_and(|end| end <= self.len);
        if !fits {
            return Err(MgetError::Internal(format!(
                "write of {} bytes at {offset} exceeds {} ({} bytes)",
                data.len(),
                self.path.display(),
                self.len
            )));
        }
        self.mmap
            .update_region(offset, data)
            .map_err(|e| MgetError::resource(&self.path, e.to_string()))
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.mmap
            .read_into(offset, buf)
            .map_err(|e| MgetError::resource(&self.path, e.to_string()))
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap
            .flush()
            .map_err(|e| MgetError::resource(&self.path, e.to_string()))
    }
}
