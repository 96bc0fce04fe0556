//! Download orchestration: open or resume a session, probe the size, run
//! the protocol engine, and persist the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::byte_queue::ByteQueue;
use crate::cli::HostCacheMode;
use crate::connection::{Connection, Connector, ProxyConfig};
use crate::download_info::{DownloadInfo, OpenRequest};
use crate::error::{MgetError, Result};
use crate::ftp::engine::{self as ftp, Credentials};
use crate::host_cache::HostCache;
use crate::http::engine::{self as http, OpenBody};
use crate::metadata::SIDECAR_SUFFIX;
use crate::state::{DownloadState, DownloadStatus};
use crate::throttle::Throttle;
use crate::url_info::{Protocol, UrlInfo};

pub const MAX_CONNECTIONS: u8 = 40;
pub const DEFAULT_HTTP_CONNECTIONS: u8 = 5;
pub const DEFAULT_FTP_CONNECTIONS: u8 = 3;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub output_dir: PathBuf,
    /// File name chosen by the user; server suggestions are ignored when set.
    pub output_name: Option<String>,
    /// Requested connection count, clamped to [`MAX_CONNECTIONS`].
    pub connections: Option<u8>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub proxy: Option<ProxyConfig>,
    pub host_cache: HostCacheMode,
    /// Bytes per second across all connections; 0 is unlimited.
    pub limit_bytes_per_sec: u64,
    pub idle_timeout: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            output_name: None,
            connections: None,
            user: None,
            password: None,
            proxy: None,
            host_cache: HostCacheMode::Default,
            limit_bytes_per_sec: 0,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// What the engines share for one transfer.
pub struct Session<'a> {
    pub connector: &'a Connector,
    pub cancel: &'a CancellationToken,
    pub idle_timeout: Duration,
}

impl Session<'_> {
    /// One read into `bq`, bounded by the idle timeout and cancellation.
    pub async fn read(&self, conn: &mut Connection, bq: &mut ByteQueue, reserve: usize) -> Result<usize> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(MgetError::Aborted),
            read = tokio::time::timeout(self.idle_timeout, conn.fill(bq, reserve)) => match read {
                Ok(n) => Ok(n?),
                Err(_) => Err(MgetError::IdleTimeout(self.idle_timeout.as_secs())),
            },
        }
    }
}

/// What the size probe learned about the resource.
#[derive(Debug)]
pub struct SizeProbe {
    /// Final location after redirects.
    pub target: UrlInfo,
    /// `None` when the body length is only known at its end.
    pub total_size: Option<u64>,
    pub can_split: bool,
    pub suggested_name: Option<String>,
    /// Unread body of a probe the server answered in full.
    pub body: Option<OpenBody>,
}

#[derive(Debug, Clone)]
enum Engine {
    Http,
    Ftp(Credentials),
}

impl Engine {
    async fn probe_size(&self, session: &Session<'_>, target: &UrlInfo) -> Result<SizeProbe> {
        match self {
            Engine::Http => http::probe(session.connector, target).await,
            Engine::Ftp(creds) => ftp::probe(session.connector, target, creds, session.idle_timeout).await,
        }
    }

    async fn transfer(
        &self,
        session: &Session<'_>,
        info: &mut DownloadInfo,
        probe: SizeProbe,
        progress: &mut dyn FnMut(&DownloadState),
    ) -> Result<()> {
        match self {
            Engine::Http => match probe.body {
                Some(body) if !probe.can_split => http::transfer_stream(session, info, body, progress).await,
                _ => http::transfer_ranges(session, info, &probe.target, progress).await,
            },
            Engine::Ftp(creds) => ftp::transfer_chunks(session, info, &probe.target, creds, progress).await,
        }
    }
}

fn default_connections(protocol: Option<Protocol>) -> u8 {
    match protocol {
        Some(Protocol::Ftp) => DEFAULT_FTP_CONNECTIONS,
        _ => DEFAULT_HTTP_CONNECTIONS,
    }
}

/// Destination named by a resume argument: either the file or its sidecar.
pub fn resume_target(path: &Path) -> PathBuf {
    match path.extension() {
        Some(ext) if ext == SIDECAR_SUFFIX => path.with_extension(""),
        _ => path.to_path_buf(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub path: PathBuf,
    /// Bytes fetched by this run, excluding resumed progress.
    pub bytes: u64,
    pub elapsed: Duration,
}

pub struct Downloader {
    options: DownloadOptions,
    connector: Connector,
    cancel: CancellationToken,
}

impl Downloader {
    pub fn new(options: DownloadOptions) -> Result<Self> {
        let hosts = Arc::new(HostCache::new(options.host_cache));
        let throttle = Throttle::new(options.limit_bytes_per_sec).map(Arc::new);
        if let Some(throttle) = &throttle {
            info!("limiting bandwidth to {} bytes/s", throttle.bytes_per_sec());
        }
        let connector = Connector::new(hosts)?
            .with_proxy(options.proxy.clone())
            .with_throttle(throttle);
        Ok(Self {
            options,
            connector,
            cancel: CancellationToken::new(),
        })
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Token that stops every running transfer when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn destination(&self, url: &UrlInfo) -> (PathBuf, bool) {
        match &self.options.output_name {
            Some(name) => (self.options.output_dir.join(name), true),
            None => (self.options.output_dir.join(&url.basename), false),
        }
    }

    fn engine_for(&self, info: &mut DownloadInfo) -> Result<Engine> {
        if info.url.protocol != Protocol::Ftp {
            return Ok(Engine::Http);
        }
        let user = self
            .options
            .user
            .clone()
            .or_else(|| info.metadata.user().map(str::to_string))
            .unwrap_or_else(|| ftp::DEFAULT_USER.to_string());
        let password = self
            .options
            .password
            .clone()
            .or_else(|| info.metadata.password().map(str::to_string))
            .unwrap_or_else(|| ftp::DEFAULT_PASSWORD.to_string());
        if info.metadata.user() != Some(user.as_str())
            || info.metadata.password() != Some(password.as_str())
        {
            info.metadata.set_credentials(&user, &password)?;
        }
        Ok(Engine::Ftp(Credentials { user, password }))
    }

    /// Downloads `url`, or resumes the session recorded next to
    /// `resume_from`. `progress` sees every state change of the session.
    pub async fn download(
        &self,
        url: Option<&str>,
        resume_from: Option<&Path>,
        progress: &mut dyn FnMut(&DownloadState),
    ) -> Result<DownloadReport> {
        let given = url.map(UrlInfo::parse).transpose()?;
        let (dest, name_given) = match (resume_from, &given) {
            (Some(path), _) => (resume_target(path), true),
            (None, Some(url)) => self.destination(url),
            (None, None) => {
                return Err(MgetError::Url {
                    url: String::new(),
                    reason: "nothing to download: no url and no file to resume".into(),
                })
            }
        };
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MgetError::resource(parent, e))?;
        }

        let connections = self
            .options
            .connections
            .unwrap_or_else(|| default_connections(given.as_ref().map(|u| u.protocol)))
            .clamp(1, MAX_CONNECTIONS);
        let mut info = DownloadInfo::open(OpenRequest {
            url: given.as_ref(),
            dest,
            name_given,
            connections,
            user: self.options.user.as_deref(),
            password: self.options.password.as_deref(),
        })?;
        let engine = self.engine_for(&mut info)?;
        let session = Session {
            connector: &self.connector,
            cancel: &self.cancel,
            idle_timeout: self.options.idle_timeout,
        };

        let started = Instant::now();
        let target = info.url.clone();
        let probe = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(MgetError::Aborted),
            probe = engine.probe_size(&session, &target) => probe,
        };
        let probe = match probe {
            Ok(probe) => probe,
            Err(e) => {
                // Nothing about the resource is known; drop a fresh sidecar.
                info.finish()?;
                return Err(e);
            }
        };
        debug!(
            "probe: size {:?}, splittable {}, final url {}",
            probe.total_size, probe.can_split, probe.target
        );

        if let Some(name) = &probe.suggested_name {
            info.apply_suggested_name(name)?;
        }
        match probe.total_size {
            Some(total) if total > 0 && probe.can_split && info.can_resume(total) => {
                info.attach_output()?
            }
            Some(total) => {
                if info.metadata.header().package_size != 0 && info.metadata.header().package_size != total {
                    warn!(
                        "remote size changed from {} to {total}, starting over",
                        info.metadata.header().package_size
                    );
                }
                info.update_after_size_known(total, probe.can_split)?
            }
            None => {}
        }
        // Counted after renaming and splitting, which may adopt or reset progress.
        let resumed_bytes = info.metadata.header().current_size;

        info.metadata.header_mut().acon = 0;
        info.set_status(DownloadStatus::Started)?;
        progress(&info.metadata.snapshot());
        info.sync()?;

        let result = if probe.total_size == Some(0) {
            info!("{} is empty, nothing to fetch", probe.target);
            Ok(())
        } else {
            engine.transfer(&session, &mut info, probe, progress).await
        };

        let status = match &result {
            Ok(()) => DownloadStatus::Finished,
            Err(e) if e.is_retryable() || matches!(e, MgetError::Aborted) => DownloadStatus::Paused,
            Err(_) => DownloadStatus::Failed,
        };
        let elapsed = started.elapsed();
        {
            let header = info.metadata.header_mut();
            header.acc_time = header.acc_time.saturating_add(elapsed.as_secs() as u32);
            header.acon = 0;
        }
        info.set_status(status)?;
        progress(&info.metadata.snapshot());
        let bytes = info.metadata.header().current_size.saturating_sub(resumed_bytes);
        let path = info.finish()?;
        if let Err(e) = &result {
            debug!("session ended {}: {e}", status.label());
        }
        result?;
        Ok(DownloadReport {
            path,
            bytes,
            elapsed,
        })
    }
}
