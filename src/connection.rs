//! Byte-stream connections: plain TCP, TLS, and tunnels through a proxy.
//!
//! Protocol engines only see [`Connection`], a boxed `AsyncRead + AsyncWrite`
//! with the session's bandwidth limit applied to reads. [`Connector`] turns
//! a [`UrlInfo`] into a live connection through the host cache.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::byte_queue::ByteQueue;
use crate::error::{MgetError, Result};
use crate::host_cache::HostCache;
use crate::http::request;
use crate::http::response::read_header;
use crate::throttle::Throttle;
use crate::url_info::{Protocol, UrlInfo};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub struct Connection {
    stream: Box<dyn Transport>,
    peer: String,
    throttle: Option<Arc<Throttle>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

impl Connection {
    pub fn from_stream<S: Transport + 'static>(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            peer: peer.into(),
            throttle: None,
        }
    }

    pub fn with_throttle(mut self, throttle: Option<Arc<Throttle>>) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Reads at most `buf.len()` bytes; `Ok(0)` means the peer closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream.read(buf).await?;
        if let Some(throttle) = &self.throttle {
            throttle.acquire(n).await;
        }
        Ok(n)
    }

    /// Reads once into the free space of `bq`, reserving `reserve` bytes first.
    pub async fn fill(&mut self, bq: &mut ByteQueue, reserve: usize) -> io::Result<usize> {
        bq.enlarge(reserve);
        let n = self.stream.read(bq.writable()).await?;
        bq.commit(n);
        if let Some(throttle) = &self.throttle {
            throttle.acquire(n).await;
        }
        Ok(n)
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("shutdown of {} failed: {e}", self.peer);
        }
    }

    fn into_stream(self) -> Box<dyn Transport> {
        self.stream
    }
}

/// `host:port` of an HTTP proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    /// The proxy itself is reached over TLS.
    pub tls: bool,
}

impl ProxyConfig {
    pub fn parse(spec: &str, tls: bool) -> Result<Self> {
        let invalid = |reason: &str| MgetError::Url {
            url: spec.to_string(),
            reason: reason.to_string(),
        };
        let (host, port) = spec
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        let port = port.parse().map_err(|_| invalid("invalid proxy port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("missing proxy host"));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

pub fn default_tls_config() -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| MgetError::Internal(format!("TLS setup failed: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

#[derive(Clone)]
pub struct Connector {
    hosts: Arc<HostCache>,
    tls: TlsConnector,
    proxy: Option<ProxyConfig>,
    throttle: Option<Arc<Throttle>>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("proxy", &self.proxy)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Connector {
    pub fn new(hosts: Arc<HostCache>) -> Result<Self> {
        Ok(Self {
            hosts,
            tls: TlsConnector::from(Arc::new(default_tls_config()?)),
            proxy: None,
            throttle: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_proxy(mut self, proxy: Option<ProxyConfig>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_throttle(mut self, throttle: Option<Arc<Throttle>>) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_tls_config(mut self, config: ClientConfig) -> Self {
        self.tls = TlsConnector::from(Arc::new(config));
        self
    }

    pub fn hosts(&self) -> &Arc<HostCache> {
        &self.hosts
    }

    /// Plain HTTP through a proxy uses absolute-form request targets.
    pub fn absolute_form(&self, target: &UrlInfo) -> bool {
        self.proxy.is_some() && target.protocol == Protocol::Http
    }

    /// Opens a connection for `target`, through the proxy for HTTP(S).
    pub async fn connect(&self, target: &UrlInfo) -> Result<Connection> {
        let proxy = match (&self.proxy, target.protocol) {
            (Some(proxy), Protocol::Http | Protocol::Https) => proxy,
            _ => {
                return self
                    .connect_host(&target.host, target.port, target.protocol.is_secure())
                    .await
            }
        };

        let mut conn = self.connect_host(&proxy.host, proxy.port, proxy.tls).await?;
        if target.protocol != Protocol::Https {
            return Ok(conn);
        }

        let authority = target.host_header_with_port();
        conn.write_all(request::connect_request(&authority).as_bytes())
            .await
            .map_err(|e| connection_error(&proxy.host, e))?;
        let mut bq = ByteQueue::default();
        let reply = read_header(&mut conn, &mut bq).await?;
        if reply.status != 200 {
            warn!("proxy {} refused CONNECT {authority}: {}", proxy.host, reply.status);
            return Err(MgetError::ProxyRefused(reply.status));
        }
        if !bq.is_empty() {
            debug!("ignoring {} bytes after CONNECT reply", bq.len());
        }
        debug!("tunnel to {authority} established via {}", proxy.host);
        let peer = conn.peer().to_string();
        let stream = self.handshake(&target.host, conn.into_stream()).await?;
        Ok(Connection::from_stream(stream, peer).with_throttle(self.throttle.clone()))
    }

    /// Direct connection to `host:port`, TLS-wrapped when `secure`.
    pub async fn connect_host(&self, host: &str, port: u16, secure: bool) -> Result<Connection> {
        let addrs = self.hosts.resolve(host, port).await?;
        let tcp = self.dial(host, &addrs).await?;
        let peer = format!("{host}:{port}");
        let conn = if secure {
            let tls = self.handshake(host, Box::new(tcp)).await?;
            Connection::from_stream(tls, peer)
        } else {
            Connection::from_stream(tcp, peer)
        };
        Ok(conn.with_throttle(self.throttle.clone()))
    }

    /// Plain connection to a literal address (FTP data channels).
    pub async fn connect_addr(&self, addr: SocketAddr) -> Result<Connection> {
        let host = addr.ip().to_string();
        let tcp = self.dial(&host, &[addr]).await?;
        Ok(Connection::from_stream(tcp, addr.to_string()).with_throttle(self.throttle.clone()))
    }

    async fn dial(&self, host: &str, addrs: &[SocketAddr]) -> Result<TcpStream> {
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses");
        for addr in addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay on {addr} failed: {e}");
                    }
                    debug!("connected to {host} at {addr}");
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!("connect to {addr} failed: {e}");
                    last_err = e;
                }
                Err(_) => {
                    debug!("connect to {addr} timed out");
                    last_err = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
                }
            }
        }
        Err(connection_error(host, last_err))
    }

    async fn handshake(
        &self,
        host: &str,
        stream: Box<dyn Transport>,
    ) -> Result<tokio_rustls::client::TlsStream<Box<dyn Transport>>> {
        let tls_err = |reason: String| MgetError::Tls {
            host: host.to_string(),
            reason,
        };
        let name = ServerName::try_from(host.to_string()).map_err(|e| tls_err(e.to_string()))?;
        self.tls
            .connect(name, stream)
            .await
            .map_err(|e| tls_err(e.to_string()))
    }
}

fn connection_error(host: &str, source: io::Error) -> MgetError {
    MgetError::Connection {
        host: host.to_string(),
        source,
    }
}
