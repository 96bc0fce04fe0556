//! One download session's live state: target URL, sidecar metadata and the
//! mapped destination file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{MgetError, Result};
use crate::metadata::{sidecar_path, MetadataStore, SideEntries};
use crate::output::OutputFile;
use crate::state::DownloadStatus;
use crate::url_info::UrlInfo;
use crate::utils::sanitize_filename;

/// Where and how a session is opened.
#[derive(Debug, Clone)]
pub struct OpenRequest<'a> {
    /// URL from the command line, if any.
    pub url: Option<&'a UrlInfo>,
    pub dest: PathBuf,
    /// The user picked the file name; server suggestions are ignored.
    pub name_given: bool,
    pub connections: u8,
    pub user: Option<&'a str>,
    pub password: Option<&'a str>,
}

#[derive(Debug)]
pub struct DownloadInfo {
    pub url: UrlInfo,
    pub metadata: MetadataStore,
    output: Option<Arc<OutputFile>>,
    dest: PathBuf,
    name_given: bool,
}

impl DownloadInfo {
    /// Resumes from `<dest>.tmd` when it holds usable state, otherwise
    /// starts a fresh sidecar.
    pub fn open(req: OpenRequest<'_>) -> Result<Self> {
        let sidecar = sidecar_path(&req.dest);
        let loaded = match MetadataStore::load_existing(&sidecar) {
            Ok(found) => found,
            Err(e @ (MgetError::Corrupt { .. } | MgetError::VersionIncompatible { .. })) => {
                warn!("discarding metadata: {e}");
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(metadata) = loaded {
            let stored = metadata.url().map(UrlInfo::parse);
            let url = match (stored, req.url) {
                (Some(Ok(stored)), _) => stored,
                (Some(Err(e)), Some(given)) => {
                    warn!("stored url is unusable ({e}), using {given}");
                    given.clone()
                }
                (None, Some(given)) => given.clone(),
                (Some(Err(e)), None) => return Err(e),
                (None, None) => {
                    return Err(MgetError::corrupt(&sidecar, "no url stored and none given"))
                }
            };
            info!(
                "resuming {} from {} ({} bytes done)",
                url,
                sidecar.display(),
                metadata.header().current_size
            );
            return Ok(Self {
                url,
                metadata,
                output: None,
                dest: req.dest,
                name_given: req.name_given,
            });
        }

        let url = req.url.cloned().ok_or_else(|| {
            MgetError::resource(&sidecar, "no metadata to resume and no url given")
        })?;
        let file_name = req
            .dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| url.basename.clone());
        let user = req.user.or(url.user.as_deref());
        let password = req.password.or(url.password.as_deref());
        let metadata = MetadataStore::create_fresh(
            &sidecar,
            SideEntries {
                url: url.as_str(),
                file_name: &file_name,
                user,
                password,
            },
            req.connections,
        )?;
        Ok(Self {
            url,
            metadata,
            output: None,
            dest: req.dest,
            name_given: req.name_given,
        })
    }

    pub fn dest_path(&self) -> &Path {
        &self.dest
    }

    pub fn sidecar_path(&self) -> &Path {
        self.metadata.path()
    }

    pub fn output(&self) -> Option<&Arc<OutputFile>> {
        self.output.as_ref()
    }

    /// Whether the sidecar already holds a chunk table for `total_size`.
    pub fn can_resume(&self, total_size: u64) -> bool {
        let header = self.metadata.header();
        header.package_size == total_size && !self.metadata.chunks().is_empty()
    }

    /// Applies a server-suggested file name, unless the user chose one or a
    /// rename already happened for this sidecar.
    pub fn apply_suggested_name(&mut self, suggested: &str) -> Result<()> {
        if self.name_given || self.metadata.header().update_name {
            return Ok(());
        }
        let name = sanitize_filename(suggested);
        let current = self.dest.file_name().map(|n| n.to_string_lossy().into_owned());
        if name.is_empty() || current.as_deref() == Some(name.as_str()) {
            return Ok(());
        }
        let new_dest = self.dest.with_file_name(&name);
        let new_sidecar = sidecar_path(&new_dest);
        info!("server suggests file name {name}");
        if new_sidecar.exists() {
            return self.adopt_renamed(new_dest, &new_sidecar);
        }
        self.metadata.relocate(&new_sidecar)?;
        self.dest = new_dest;
        self.metadata.set_file_name(&name)?;
        self.metadata.header_mut().update_name = true;
        self.metadata.store_header()
    }

    /// An earlier run already moved to the suggested name. Continue from its
    /// sidecar when it records the same URL and ours holds no progress;
    /// otherwise keep the current name and leave that sidecar alone.
    fn adopt_renamed(&mut self, new_dest: PathBuf, new_sidecar: &Path) -> Result<()> {
        let existing = match MetadataStore::load_existing(new_sidecar) {
            Ok(found) => found,
            Err(e @ (MgetError::Corrupt { .. } | MgetError::VersionIncompatible { .. })) => {
                warn!("ignoring {}: {e}", new_sidecar.display());
                None
            }
            Err(e) => return Err(e),
        };
        let fresh = self.metadata.header().package_size == 0;
        let existing = match existing {
            Some(existing) if fresh && existing.url() == Some(self.url.as_str()) => existing,
            _ => {
                warn!(
                    "{} belongs to another download, keeping {}",
                    new_sidecar.display(),
                    self.dest.display()
                );
                return Ok(());
            }
        };

        info!(
            "resuming {} from {} ({} bytes done)",
            self.url,
            new_sidecar.display(),
            existing.header().current_size
        );
        let abandoned = std::mem::replace(&mut self.metadata, existing);
        let abandoned_path = abandoned.path().to_path_buf();
        drop(abandoned);
        remove_if_present(&abandoned_path)?;
        self.dest = new_dest;
        if !self.metadata.header().update_name {
            self.metadata.header_mut().update_name = true;
            self.metadata.store_header()?;
        }
        Ok(())
    }

    /// First size-known response: split the resource and (re)create the
    /// destination at `total_size` bytes.
    pub fn update_after_size_known(&mut self, total_size: u64, can_split: bool) -> Result<()> {
        self.metadata.update_after_size_known(total_size, can_split)?;
        self.output = if total_size > 0 {
            Some(Arc::new(OutputFile::create(&self.dest, total_size)?))
        } else {
            None
        };
        Ok(())
    }

    /// Maps the destination for a resumed chunk table. A missing or
    /// wrong-sized destination invalidates all recorded progress.
    pub fn attach_output(&mut self) -> Result<()> {
        let total = self.metadata.header().package_size;
        match OutputFile::open_existing(&self.dest, total)? {
            Some(output) => self.output = Some(Arc::new(output)),
            None => {
                if self.metadata.header().current_size > 0 {
                    warn!(
                        "{} is missing or resized, restarting all chunks",
                        self.dest.display()
                    );
                }
                self.metadata.rewind_chunks()?;
                self.output = Some(Arc::new(OutputFile::create(&self.dest, total)?));
            }
        }
        Ok(())
    }

    /// Opens the destination for a body whose size is unknown up front.
    pub async fn create_stream_file(&mut self) -> Result<tokio::fs::File> {
        self.output = None;
        tokio::fs::File::create(&self.dest)
            .await
            .map_err(|e| MgetError::resource(&self.dest, e))
    }

    pub fn set_status(&mut self, status: DownloadStatus) -> Result<()> {
        self.metadata.header_mut().status = status;
        self.metadata.store_header()
    }

    /// Flushes sidecar and destination.
    pub fn sync(&mut self) -> Result<()> {
        self.metadata.sync()?;
        if let Some(output) = &self.output {
            output.flush()?;
        }
        Ok(())
    }

    /// Ends the session. The sidecar is removed once the download finished;
    /// when nothing was ever sized it goes too, along with an empty
    /// destination.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.sync()?;
        let remove_package = self.metadata.header().package_size == 0;
        let remove_metadata =
            remove_package || self.metadata.header().status == DownloadStatus::Finished;
        let sidecar = self.metadata.path().to_path_buf();
        let dest = self.dest.clone();
        drop(self.output.take());
        drop(self.metadata);

        if remove_metadata {
            remove_if_present(&sidecar)?;
            debug!("removed {}", sidecar.display());
        }
        // Only an empty destination is ours to delete.
        let dest_empty = std::fs::metadata(&dest).map(|m| m.len() == 0).unwrap_or(false);
        if remove_package && dest_empty {
            remove_if_present(&dest)?;
            debug!("removed empty download {}", dest.display());
        }
        Ok(dest)
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MgetError::resource(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request<'a>(url: Option<&'a UrlInfo>, dest: PathBuf) -> OpenRequest<'a> {
        OpenRequest {
            url,
            dest,
            name_given: false,
            connections: 4,
            user: None,
            password: None,
        }
    }

    #[test]
    fn fresh_session_then_resume_uses_stored_url() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("f.bin");
        let url = UrlInfo::parse("http://origin.example/f.bin").unwrap();
        {
            let mut info = DownloadInfo::open(request(Some(&url), dest.clone())).unwrap();
            info.update_after_size_known(1_000_000, true).unwrap();
            info.set_status(DownloadStatus::Paused).unwrap();
            info.finish().unwrap();
        }
        assert!(dir.path().join("f.bin.tmd").exists());
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 1_000_000);

        let other = UrlInfo::parse("http://elsewhere.example/f.bin").unwrap();
        let mut info = DownloadInfo::open(request(Some(&other), dest.clone())).unwrap();
        assert_eq!(info.url, url);
        assert!(info.can_resume(1_000_000));
        info.attach_output().unwrap();
        assert!(info.output().is_some());
    }

    #[test]
    fn resize_of_destination_rewinds_chunks() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("g.bin");
        let url = UrlInfo::parse("http://h/g.bin").unwrap();
        {
            let mut info = DownloadInfo::open(request(Some(&url), dest.clone())).unwrap();
            info.update_after_size_known(300_000, true).unwrap();
            let mut first = info.metadata.chunks()[0];
            first.advance(first.len());
            info.metadata.set_chunk(0, first).unwrap();
            info.set_status(DownloadStatus::Paused).unwrap();
            info.finish().unwrap();
        }
        std::fs::write(&dest, b"truncated").unwrap();

        let mut info = DownloadInfo::open(request(None, dest.clone())).unwrap();
        info.attach_output().unwrap();
        assert!(info.metadata.chunks().iter().all(|c| c.cur_pos == c.start_pos));
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 300_000);
    }

    #[test]
    fn finished_download_drops_sidecar() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("done.bin");
        let url = UrlInfo::parse("http://h/done.bin").unwrap();
        let mut info = DownloadInfo::open(request(Some(&url), dest.clone())).unwrap();
        info.update_after_size_known(100, false).unwrap();
        info.set_status(DownloadStatus::Finished).unwrap();
        let path = info.finish().unwrap();
        assert_eq!(path, dest);
        assert!(dest.exists());
        assert!(!dir.path().join("done.bin.tmd").exists());
    }

    #[test]
    fn unsized_session_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("empty.bin");
        let url = UrlInfo::parse("http://h/empty.bin").unwrap();
        let info = DownloadInfo::open(request(Some(&url), dest.clone())).unwrap();
        std::fs::write(&dest, b"").unwrap();
        info.finish().unwrap();
        assert!(!dest.exists());
        assert!(!dir.path().join("empty.bin.tmd").exists());
    }

    #[test]
    fn suggested_name_moves_sidecar() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("download");
        let url = UrlInfo::parse("http://h/download").unwrap();
        let mut info = DownloadInfo::open(request(Some(&url), dest)).unwrap();
        info.apply_suggested_name("report.pdf").unwrap();
        assert_eq!(info.dest_path(), dir.path().join("report.pdf"));
        assert!(dir.path().join("report.pdf.tmd").exists());
        assert!(!dir.path().join("download.tmd").exists());
        assert_eq!(info.metadata.file_name(), Some("report.pdf"));

        // A second suggestion for the same sidecar is ignored.
        info.apply_suggested_name("other.pdf").unwrap();
        assert_eq!(info.dest_path(), dir.path().join("report.pdf"));
    }

    #[test]
    fn suggested_name_adopts_earlier_sidecar() {
        let dir = TempDir::new().unwrap();
        let url = UrlInfo::parse("http://h/download").unwrap();
        {
            let mut info = DownloadInfo::open(request(Some(&url), dir.path().join("download"))).unwrap();
            info.apply_suggested_name("report.bin").unwrap();
            info.update_after_size_known(300_000, true).unwrap();
            let mut first = info.metadata.chunks()[0];
            first.advance(first.len());
            info.metadata.set_chunk(0, first).unwrap();
            info.set_status(DownloadStatus::Paused).unwrap();
            info.finish().unwrap();
        }

        let mut info = DownloadInfo::open(request(Some(&url), dir.path().join("download"))).unwrap();
        info.apply_suggested_name("report.bin").unwrap();
        assert_eq!(info.dest_path(), dir.path().join("report.bin"));
        assert!(info.can_resume(300_000));
        assert!(info.metadata.chunks()[0].is_complete());
        assert!(!dir.path().join("download.tmd").exists());
    }

    #[test]
    fn suggested_name_never_clobbers_foreign_sidecar() {
        let dir = TempDir::new().unwrap();
        let theirs = UrlInfo::parse("http://other/report.bin").unwrap();
        {
            let mut info = DownloadInfo::open(request(Some(&theirs), dir.path().join("report.bin"))).unwrap();
            info.update_after_size_known(100_000, true).unwrap();
            info.set_status(DownloadStatus::Paused).unwrap();
            info.finish().unwrap();
        }

        let ours = UrlInfo::parse("http://h/download").unwrap();
        let mut info = DownloadInfo::open(request(Some(&ours), dir.path().join("download"))).unwrap();
        info.apply_suggested_name("report.bin").unwrap();
        assert_eq!(info.dest_path(), dir.path().join("download"));
        let kept = MetadataStore::load_existing(&dir.path().join("report.bin.tmd"))
            .unwrap()
            .unwrap();
        assert_eq!(kept.url(), Some(theirs.as_str()));
        assert_eq!(kept.header().package_size, 100_000);
    }

    #[test]
    fn corrupt_sidecar_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("c.bin");
        std::fs::write(dir.path().join("c.bin.tmd"), b"garbage").unwrap();
        let url = UrlInfo::parse("http://h/c.bin").unwrap();
        let info = DownloadInfo::open(request(Some(&url), dest)).unwrap();
        assert_eq!(info.metadata.header().status, DownloadStatus::Init);
    }

    #[test]
    fn nothing_to_resume_without_url() {
        let dir = TempDir::new().unwrap();
        let err = DownloadInfo::open(request(None, dir.path().join("x"))).unwrap_err();
        assert!(!err.is_retryable());
    }
}
