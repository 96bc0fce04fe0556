//! FTP size probe and multi-connection transfer.
//!
//! Every incomplete chunk gets a worker task with its own control and data
//! connection. Workers only report positions; the coordinator is the one
//! place that touches the sidecar and the progress callback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::DataChunk;
use crate::connection::{Connection, Connector};
use crate::download_info::DownloadInfo;
use crate::downloader::{Session, SizeProbe};
use crate::error::{FtpFailure, MgetError, Result};
use crate::group::TICK;
use crate::output::OutputFile;
use crate::state::DownloadState;
use crate::url_info::UrlInfo;

use super::control::{remote_path, ControlChannel};

pub const DEFAULT_USER: &str = "anonymous";
pub const DEFAULT_PASSWORD: &str = "anonymous";
const READ_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            user: DEFAULT_USER.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
        }
    }
}

/// Logs in and prepares a binary transfer; returns the remote path too.
async fn open_control(
    connector: &Connector,
    target: &UrlInfo,
    creds: &Credentials,
    idle: Duration,
) -> Result<(ControlChannel, String)> {
    let conn = connector.connect(target).await?;
    let mut ctrl = ControlChannel::new(conn, idle);
    ctrl.login(&creds.user, &creds.password).await?;
    if let Some(system) = ctrl.syst().await? {
        debug!("{} runs {system}", target.host);
    }
    let pwd = ctrl.pwd().await?;
    ctrl.type_binary().await?;
    Ok((ctrl, remote_path(&pwd, &target.ftp_path())))
}

async fn open_data(
    connector: &Connector,
    target: &UrlInfo,
    ctrl: &mut ControlChannel,
) -> Result<Connection> {
    let (ip, port) = ctrl.pasv().await?;
    // Some servers answer 0.0.0.0; the control host is meant.
    if ip.is_unspecified() {
        connector.connect_host(&target.host, port, false).await
    } else {
        connector.connect_addr(SocketAddr::new(ip.into(), port)).await
    }
}

/// Learns the size with `SIZE` and whether `REST` works.
pub async fn probe(connector: &Connector, target: &UrlInfo, creds: &Credentials, idle: Duration) -> Result<SizeProbe> {
    let (mut ctrl, path) = open_control(connector, target, creds, idle).await?;
    let size = ctrl.size(&path).await?;
    if size == 0 {
        ctrl.quit().await;
        return Err(FtpFailure::NoSize.into());
    }
    let can_split = match ctrl.rest(16).await {
        Ok(()) => true,
        Err(MgetError::Ftp(FtpFailure::RestFailed)) => {
            info!("{} does not support REST, using one connection", target.host);
            false
        }
        Err(e) => return Err(e),
    };
    ctrl.quit().await;
    Ok(SizeProbe {
        target: target.clone(),
        total_size: Some(size),
        can_split,
        suggested_name: None,
        body: None,
    })
}

#[derive(Debug)]
enum FtpEvent {
    Progress {
        index: usize,
        chunk: DataChunk,
    },
    End {
        index: usize,
        chunk: DataChunk,
        result: Result<()>,
    },
}

struct Worker {
    connector: Connector,
    target: UrlInfo,
    creds: Credentials,
    output: Arc<OutputFile>,
    total_size: u64,
    idle: Duration,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<FtpEvent>,
}

impl Worker {
    async fn run(self: Arc<Self>, index: usize, mut chunk: DataChunk) {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(MgetError::Aborted),
            result = self.fetch(index, &mut chunk) => result,
        };
        let _ = self.events.send(FtpEvent::End {
            index,
            chunk,
            result,
        });
    }

    async fn fetch(&self, index: usize, chunk: &mut DataChunk) -> Result<()> {
        let (mut ctrl, path) =
            open_control(&self.connector, &self.target, &self.creds, self.idle).await?;
        let size = ctrl.size(&path).await?;
        if size != 0 && size != self.total_size {
            warn!("remote size is now {size}, expected {}", self.total_size);
            return Err(FtpFailure::SizeMismatch.into());
        }

        if chunk.cur_pos > 0 {
            match ctrl.rest(chunk.cur_pos).await {
                Ok(()) => {}
                Err(MgetError::Ftp(FtpFailure::RestFailed)) if chunk.start_pos == 0 => {
                    warn!("REST refused, chunk {index} restarts from 0");
                    chunk.rewind();
                    self.report(index, *chunk);
                }
                Err(e) => return Err(e),
            }
        }

        let mut data = open_data(&self.connector, &self.target, &mut ctrl).await?;
        ctrl.retr(&path).await?;
        debug!("chunk {index}: RETR {path} from offset {}", chunk.cur_pos);

        let mut buf = vec![0u8; READ_SIZE];
        while !chunk.is_complete() {
            let n = tokio::time::timeout(self.idle, data.read(&mut buf))
                .await
                .map_err(|_| MgetError::IdleTimeout(self.idle.as_secs()))??;
            if n == 0 {
                break;
            }
            let take = (n as u64).min(chunk.remaining());
            self.output.write_at(chunk.cur_pos, &buf[..take as usize])?;
            chunk.advance(take);
            self.report(index, *chunk);
        }

        // Chunks that end before EOF abort the transfer; the 426 that follows
        // is not waited for.
        data.shutdown().await;
        ctrl.quit().await;
        if chunk.is_complete() {
            Ok(())
        } else {
            Err(MgetError::Incomplete {
                remaining: chunk.remaining(),
            })
        }
    }

    fn report(&self, index: usize, chunk: DataChunk) {
        let _ = self.events.send(FtpEvent::Progress { index, chunk });
    }
}

/// Fetches every incomplete chunk, one worker task per chunk.
pub async fn transfer_chunks(
    session: &Session<'_>,
    info: &mut DownloadInfo,
    target: &UrlInfo,
    creds: &Credentials,
    progress: &mut dyn FnMut(&DownloadState),
) -> Result<()> {
    let output = info
        .output()
        .cloned()
        .ok_or_else(|| MgetError::Internal("destination is not mapped".into()))?;
    let pending: Vec<(usize, DataChunk)> = info
        .metadata
        .chunks()
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, chunk)| !chunk.is_complete())
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    let (events, mut rx) = mpsc::unbounded_channel();
    let cancel = session.cancel.child_token();
    let worker = Arc::new(Worker {
        connector: session.connector.clone(),
        target: target.clone(),
        creds: creds.clone(),
        output,
        total_size: info.metadata.header().package_size,
        idle: session.idle_timeout,
        cancel: cancel.clone(),
        events,
    });

    let mut live = pending.len();
    info!("fetching {live} chunks from {target}");
    let mut workers = JoinSet::new();
    for (index, chunk) in pending {
        workers.spawn(worker.clone().run(index, chunk));
    }
    // Only workers hold a sender now; the channel closes when they are done.
    drop(worker);
    info.metadata.header_mut().acon = live as u8;

    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut first_error: Option<MgetError> = None;
    let mut cancelled = false;
    let mut apply = |info: &mut DownloadInfo, event: FtpEvent, live: &mut usize| -> Result<()> {
        match event {
            FtpEvent::Progress { index, chunk } => info.metadata.set_chunk(index, chunk)?,
            FtpEvent::End {
                index,
                chunk,
                result,
            } => {
                info.metadata.set_chunk(index, chunk)?;
                *live -= 1;
                info.metadata.header_mut().acon = *live as u8;
                if let Err(error) = result {
                    if !matches!(error, MgetError::Aborted) {
                        warn!("chunk {index} failed: {error}");
                    }
                    first_error.get_or_insert(error);
                }
            }
        }
        Ok(())
    };

    loop {
        tokio::select! {
            biased;
            _ = session.cancel.cancelled(), if !cancelled => {
                debug!("cancelling {live} ftp workers");
                cancel.cancel();
                cancelled = true;
            }
            event = rx.recv() => match event {
                Some(event) => {
                    apply(info, event, &mut live)?;
                    progress(&info.metadata.snapshot());
                }
                None => break,
            },
            _ = ticker.tick() => {
                info.sync()?;
                progress(&info.metadata.snapshot());
            }
        }
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            warn!("ftp worker ended abnormally: {e}");
        }
    }

    if cancelled {
        return Err(MgetError::Aborted);
    }
    let remaining = info.metadata.remaining();
    if remaining > 0 {
        return Err(first_error.unwrap_or(MgetError::Incomplete { remaining }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_by_default() {
        let creds = Credentials::default();
        assert_eq!(creds.user, "anonymous");
        assert_eq!(creds.password, "anonymous");
    }
}
