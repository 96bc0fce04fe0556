//! HTTP(S) size probe and transfers.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::byte_queue::ByteQueue;
use crate::chunk::DataChunk;
use crate::connection::{Connection, Connector};
use crate::download_info::DownloadInfo;
use crate::downloader::{Session, SizeProbe};
use crate::error::{MgetError, Result};
use crate::group::{self, Flow, GroupEvent, Member, TICK};
use crate::output::OutputFile;
use crate::state::DownloadState;
use crate::url_info::UrlInfo;
use crate::utils::filename_from_content_disposition;

use super::body::Framing;
use super::request::{chunk_request, probe_request};
use super::response::{read_header, take_header, ResponseHeader};

pub const MAX_REDIRECTS: usize = 10;
const READ_RESERVE: usize = 64 * 1024;

/// A response whose body has not been read yet.
#[derive(Debug)]
pub struct OpenBody {
    pub conn: Connection,
    /// Body bytes that arrived together with the header.
    pub bq: ByteQueue,
    pub framing: Framing,
}

fn write_err(conn: &Connection, source: std::io::Error) -> MgetError {
    MgetError::Connection {
        host: conn.peer().to_string(),
        source,
    }
}

fn suggested_name(header: &ResponseHeader) -> Option<String> {
    header
        .content_disposition()
        .and_then(filename_from_content_disposition)
}

/// Asks for the first two bytes to learn the size and whether ranges work.
///
/// Follows redirects (at most [`MAX_REDIRECTS`]). A `200` keeps the
/// connection so the body can be streamed without a second request.
pub async fn probe(connector: &Connector, target: &UrlInfo) -> Result<SizeProbe> {
    let mut target = target.clone();
    for hop in 0..=MAX_REDIRECTS {
        let mut conn = connector.connect(&target).await?;
        let request = probe_request(&target, connector.absolute_form(&target));
        conn.write_all(request.as_bytes())
            .await
            .map_err(|e| write_err(&conn, e))?;

        let mut bq = ByteQueue::default();
        let header = read_header(&mut conn, &mut bq).await?;
        debug!("probe {} -> {} {}", target, header.status, header.reason);

        match header.status {
            206 => {
                let range = header.content_range().ok_or_else(|| {
                    MgetError::MalformedResponse("206 without a usable Content-Range".into())
                })?;
                let total = range.total.ok_or_else(|| {
                    MgetError::MalformedResponse("206 without a total size".into())
                })?;
                return Ok(SizeProbe {
                    suggested_name: suggested_name(&header),
                    target,
                    total_size: Some(total),
                    can_split: true,
                    body: None,
                });
            }
            200 => {
                let framing = Framing::for_response(&header);
                return Ok(SizeProbe {
                    suggested_name: suggested_name(&header),
                    target,
                    total_size: framing.known_length(),
                    can_split: false,
                    body: Some(OpenBody { conn, bq, framing }),
                });
            }
            416 if unsatisfiable_total(&header) == Some(0) => {
                return Ok(SizeProbe {
                    suggested_name: suggested_name(&header),
                    target,
                    total_size: Some(0),
                    can_split: false,
                    body: None,
                });
            }
            _ if header.is_redirect() => {
                let location = header.location().ok_or_else(|| {
                    MgetError::MalformedResponse(format!("{} without Location", header.status))
                })?;
                let next = target.resolve(location)?;
                info!("redirected ({}) to {} [hop {}]", header.status, next, hop + 1);
                target = next;
            }
            status => {
                return Err(MgetError::HttpStatus {
                    status,
                    url: target.redacted(),
                })
            }
        }
    }
    Err(MgetError::TooManyRedirects(target.redacted()))
}

/// `Content-Range: bytes */<total>` of a 416.
fn unsatisfiable_total(header: &ResponseHeader) -> Option<u64> {
    header
        .get("content-range")?
        .trim()
        .strip_prefix("bytes */")?
        .parse()
        .ok()
}

enum FetchState {
    Request,
    Header,
    Body(Framing),
}

/// One chunk fetched over its own connection.
pub struct RangeFetch<'a> {
    pub index: usize,
    pub chunk: DataChunk,
    target: UrlInfo,
    connector: &'a Connector,
    output: Arc<OutputFile>,
    conn: Option<Connection>,
    bq: ByteQueue,
    state: FetchState,
    hops: usize,
    payload: Vec<u8>,
}

impl<'a> RangeFetch<'a> {
    pub fn new(
        index: usize,
        chunk: DataChunk,
        target: UrlInfo,
        connector: &'a Connector,
        output: Arc<OutputFile>,
    ) -> Self {
        Self {
            index,
            chunk,
            target,
            connector,
            output,
            conn: None,
            bq: ByteQueue::with_capacity(READ_RESERVE),
            state: FetchState::Request,
            hops: 0,
            payload: Vec::with_capacity(READ_RESERVE),
        }
    }

    /// Handles this connection's header. `Some` short-circuits the read.
    fn on_header(&mut self, header: ResponseHeader) -> Result<Option<Flow>> {
        match header.status {
            206 => {
                let range = header.content_range().ok_or_else(|| {
                    MgetError::MalformedResponse("206 without a usable Content-Range".into())
                })?;
                if range.start != self.chunk.cur_pos {
                    return Err(MgetError::MalformedResponse(format!(
                        "asked for offset {}, server sent {}",
                        self.chunk.cur_pos, range.start
                    )));
                }
                self.state = FetchState::Body(clamp(Framing::for_response(&header), self.chunk.remaining()));
                Ok(None)
            }
            // Whole body from offset 0 is still usable for the first chunk.
            200 if self.chunk.cur_pos == 0 => {
                self.state = FetchState::Body(clamp(Framing::for_response(&header), self.chunk.remaining()));
                Ok(None)
            }
            200 => Err(MgetError::MalformedResponse(
                "server ignored the range request".into(),
            )),
            _ if header.is_redirect() => {
                self.hops += 1;
                if self.hops > MAX_REDIRECTS {
                    return Err(MgetError::TooManyRedirects(self.target.redacted()));
                }
                let location = header.location().ok_or_else(|| {
                    MgetError::MalformedResponse(format!("{} without Location", header.status))
                })?;
                self.target = self.target.resolve(location)?;
                debug!("chunk {} redirected to {}", self.index, self.target);
                self.conn = None;
                self.bq.reset();
                self.state = FetchState::Request;
                Ok(Some(Flow::Continue(0)))
            }
            status => Err(MgetError::HttpStatus {
                status,
                url: self.target.redacted(),
            }),
        }
    }

    /// Moves decoded body bytes into the destination.
    fn drain(&mut self) -> Result<u64> {
        let FetchState::Body(framing) = &mut self.state else {
            return Ok(0);
        };
        self.payload.clear();
        let used = framing.decode(self.bq.readable(), &mut self.payload)?;
        self.bq.consume(used);

        let take = (self.payload.len() as u64).min(self.chunk.remaining());
        if take > 0 {
            self.output
                .write_at(self.chunk.cur_pos, &self.payload[..take as usize])?;
            self.chunk.advance(take);
        }
        Ok(take)
    }

    fn body_done(&self) -> bool {
        matches!(&self.state, FetchState::Body(framing) if framing.is_done())
    }
}

fn clamp(framing: Framing, remaining: u64) -> Framing {
    match framing {
        Framing::Length(len) => Framing::Length(len.min(remaining)),
        other => other,
    }
}

impl Member for RangeFetch<'_> {
    fn wants_write(&self) -> bool {
        matches!(self.state, FetchState::Request)
    }

    async fn on_writable(&mut self) -> Result<Flow> {
        if self.conn.is_none() {
            self.conn = Some(self.connector.connect(&self.target).await?);
        }
        let request = chunk_request(
            &self.target,
            &self.chunk,
            self.connector.absolute_form(&self.target),
        );
        let Some(conn) = self.conn.as_mut() else {
            return Err(MgetError::Internal("chunk connection vanished".into()));
        };
        conn.write_all(request.as_bytes())
            .await
            .map_err(|e| write_err(conn, e))?;
        self.state = FetchState::Header;
        Ok(Flow::Continue(0))
    }

    async fn on_readable(&mut self) -> Result<Flow> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(MgetError::Internal("read on an unconnected chunk".into()));
        };
        let n = conn.fill(&mut self.bq, READ_RESERVE).await?;

        if matches!(self.state, FetchState::Header) {
            match take_header(&mut self.bq)? {
                Some(header) => {
                    if let Some(flow) = self.on_header(header)? {
                        return Ok(flow);
                    }
                }
                None if n == 0 => {
                    return Err(MgetError::MalformedResponse(
                        "connection closed before the end of the header".into(),
                    ))
                }
                None => return Ok(Flow::Continue(0)),
            }
        }

        let written = self.drain()?;
        if self.chunk.is_complete() {
            return Ok(Flow::Finished(written));
        }
        if n == 0 || self.body_done() {
            debug!(
                "chunk {} closed with {} bytes outstanding",
                self.index,
                self.chunk.remaining()
            );
            return Ok(Flow::Closed);
        }
        Ok(Flow::Continue(written))
    }
}

/// Fetches every incomplete chunk over its own connection.
pub async fn transfer_ranges(
    session: &Session<'_>,
    info: &mut DownloadInfo,
    target: &UrlInfo,
    progress: &mut dyn FnMut(&DownloadState),
) -> Result<()> {
    let output = info
        .output()
        .cloned()
        .ok_or_else(|| MgetError::Internal("destination is not mapped".into()))?;

    let mut members: Vec<RangeFetch<'_>> = info
        .metadata
        .chunks()
        .iter()
        .enumerate()
        .filter(|(_, chunk)| !chunk.is_complete())
        .map(|(i, chunk)| RangeFetch::new(i, *chunk, target.clone(), session.connector, output.clone()))
        .collect();
    if members.is_empty() {
        return Ok(());
    }
    info!(
        "fetching {} of {} chunks from {}",
        members.len(),
        info.metadata.chunks().len(),
        target
    );
    info.metadata.header_mut().acon = members.len() as u8;

    let mut first_error: Option<MgetError> = None;
    let outcome = group::run(&mut members, session.cancel, session.idle_timeout, |event| {
        match event {
            GroupEvent::Progress { member, bytes } => {
                info.metadata.set_chunk(member.index, member.chunk)?;
                if bytes > 0 {
                    progress(&info.metadata.snapshot());
                }
            }
            GroupEvent::Finished { member } | GroupEvent::Closed { member } => {
                info.metadata.set_chunk(member.index, member.chunk)?;
                let header = info.metadata.header_mut();
                header.acon = header.acon.saturating_sub(1);
                progress(&info.metadata.snapshot());
            }
            GroupEvent::Failed { member, error } => {
                info.metadata.set_chunk(member.index, member.chunk)?;
                let header = info.metadata.header_mut();
                header.acon = header.acon.saturating_sub(1);
                warn!("chunk {} failed: {error}", member.index);
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
            GroupEvent::Tick { live } => {
                info.metadata.header_mut().acon = live as u8;
                info.sync()?;
                progress(&info.metadata.snapshot());
            }
        }
        Ok(())
    })
    .await?;
    drop(members);

    if outcome.cancelled {
        return Err(MgetError::Aborted);
    }
    let remaining = info.metadata.remaining();
    if remaining > 0 {
        return Err(first_error.unwrap_or(MgetError::Incomplete { remaining }));
    }
    Ok(())
}

/// Streams the body of the probe response over the probe connection.
pub async fn transfer_stream(
    session: &Session<'_>,
    info: &mut DownloadInfo,
    body: OpenBody,
    progress: &mut dyn FnMut(&DownloadState),
) -> Result<()> {
    match body.framing.known_length() {
        Some(_) => stream_mapped(session, info, body, progress).await,
        None => stream_unsized(session, info, body, progress).await,
    }
}

async fn stream_mapped(
    session: &Session<'_>,
    info: &mut DownloadInfo,
    mut body: OpenBody,
    progress: &mut dyn FnMut(&DownloadState),
) -> Result<()> {
    let output = info
        .output()
        .cloned()
        .ok_or_else(|| MgetError::Internal("destination is not mapped".into()))?;
    let mut chunk = info
        .metadata
        .chunks()
        .first()
        .copied()
        .ok_or_else(|| MgetError::Internal("no chunk for a sized body".into()))?;
    info.metadata.header_mut().acon = 1;

    let mut payload = Vec::with_capacity(READ_RESERVE);
    let mut last_sync = Instant::now();
    loop {
        payload.clear();
        let used = body.framing.decode(body.bq.readable(), &mut payload)?;
        body.bq.consume(used);
        let take = (payload.len() as u64).min(chunk.remaining());
        if take > 0 {
            output.write_at(chunk.cur_pos, &payload[..take as usize])?;
            chunk.advance(take);
            info.metadata.set_chunk(0, chunk)?;
            progress(&info.metadata.snapshot());
        }
        if chunk.is_complete() {
            return Ok(());
        }
        if last_sync.elapsed() >= TICK {
            info.sync()?;
            last_sync = Instant::now();
        }
        if session.read(&mut body.conn, &mut body.bq, READ_RESERVE).await? == 0 {
            return Err(MgetError::Incomplete {
                remaining: chunk.remaining(),
            });
        }
    }
}

async fn stream_unsized(
    session: &Session<'_>,
    info: &mut DownloadInfo,
    mut body: OpenBody,
    progress: &mut dyn FnMut(&DownloadState),
) -> Result<()> {
    let mut file = info.create_stream_file().await?;
    let dest = info.dest_path().to_path_buf();
    info.metadata.header_mut().acon = 1;

    let mut payload = Vec::with_capacity(READ_RESERVE);
    let mut total = 0u64;
    loop {
        payload.clear();
        let used = body.framing.decode(body.bq.readable(), &mut payload)?;
        body.bq.consume(used);
        if !payload.is_empty() {
            file.write_all(&payload)
                .await
                .map_err(|e| MgetError::resource(&dest, e))?;
            total += payload.len() as u64;
            info.metadata.header_mut().current_size = total;
            progress(&info.metadata.snapshot());
        }
        if body.framing.is_done() {
            break;
        }
        if session.read(&mut body.conn, &mut body.bq, READ_RESERVE).await? == 0 {
            if body.framing.close_is_eof() {
                break;
            }
            return Err(MgetError::MalformedResponse(
                "connection closed inside a chunked body".into(),
            ));
        }
    }
    file.flush().await.map_err(|e| MgetError::resource(&dest, e))?;
    debug!("streamed {total} bytes of unknown size into {}", dest.display());
    info.metadata.set_streamed_size(total)
}
