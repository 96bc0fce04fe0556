#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Deterministic, non-repeating-looking payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub path: String,
    /// Inclusive `bytes=a-b` of the request, if any.
    pub range: Option<(u64, u64)>,
}

#[derive(Debug, Clone)]
pub enum Behavior {
    /// Honours `Range` with 206.
    Ranges(Arc<Vec<u8>>),
    /// Like `Ranges`, naming the file with Content-Disposition.
    Attachment(Arc<Vec<u8>>, &'static str),
    /// Ignores `Range`, always 200 with Content-Length.
    NoRanges(Arc<Vec<u8>>),
    /// 200 with chunked transfer-encoding and no length.
    Chunked(Arc<Vec<u8>>),
    /// 302 to the given absolute URL.
    Redirect(String),
    Status(u16),
}

pub struct MockHttp {
    pub port: u16,
    pub seen: Arc<Mutex<Vec<Seen>>>,
}

impl MockHttp {
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

pub async fn http_server(behavior: Behavior) -> MockHttp {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let behavior = Arc::new(behavior);
    tokio::spawn(async move {
        while let Ok((sock, _)) = listener.accept().await {
            tokio::spawn(handle_http(sock, behavior.clone(), log.clone()));
        }
    });
    MockHttp { port, seen }
}

async fn handle_http(mut sock: TcpStream, behavior: Arc<Behavior>, log: Arc<Mutex<Vec<Seen>>>) {
    let mut head = Vec::new();
    let mut buf = [0u8; 4096];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match sock.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    let text = String::from_utf8_lossy(&head).to_string();
    let mut lines = text.split("\r\n");
    let path = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let range = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.eq_ignore_ascii_case("range"))
        .and_then(|(_, v)| v.trim().strip_prefix("bytes="))
        .and_then(|v| v.split_once('-'))
        .and_then(|(a, b)| Some((a.parse().ok()?, b.parse().ok()?)));
    log.lock().unwrap().push(Seen { path, range });

    let response = match &*behavior {
        Behavior::Ranges(body) => ranged(body, range, ""),
        Behavior::Attachment(body, name) => ranged(
            body,
            range,
            &format!("Content-Disposition: attachment; filename=\"{name}\"\r\n"),
        ),
        Behavior::NoRanges(body) => full(body),
        Behavior::Chunked(body) => {
            let mut r = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
            for piece in body.chunks(1000) {
                r.extend_from_slice(format!("{:x}\r\n", piece.len()).as_bytes());
                r.extend_from_slice(piece);
                r.extend_from_slice(b"\r\n");
            }
            r.extend_from_slice(b"0\r\n\r\n");
            r
        }
        Behavior::Redirect(to) => {
            format!("HTTP/1.1 302 Found\r\nLocation: {to}\r\nContent-Length: 0\r\n\r\n").into_bytes()
        }
        Behavior::Status(code) => {
            format!("HTTP/1.1 {code} Nope\r\nContent-Length: 0\r\n\r\n").into_bytes()
        }
    };
    let _ = sock.write_all(&response).await;
    let _ = sock.shutdown().await;
}

fn ranged(body: &[u8], range: Option<(u64, u64)>, extra: &str) -> Vec<u8> {
    let Some((start, end)) = range else {
        return full(body);
    };
    let total = body.len() as u64;
    let end = end.min(total - 1);
    let slice = &body[start as usize..=end as usize];
    let mut r = format!(
        "HTTP/1.1 206 Partial Content\r\n{extra}Content-Range: bytes {start}-{end}/{total}\r\nContent-Length: {}\r\n\r\n",
        slice.len()
    )
    .into_bytes();
    r.extend_from_slice(slice);
    r
}

fn full(body: &[u8]) -> Vec<u8> {
    let mut r = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
    r.extend_from_slice(body);
    r
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestPolicy {
    #[default]
    Accept,
    Refuse,
    /// Accepts only the `REST 16` capability check.
    CheckOnly,
}

/// Ways the mock FTP server misbehaves.
#[derive(Debug, Clone, Default)]
pub struct FtpQuirks {
    pub rest: RestPolicy,
    /// Answers to successive `SIZE` queries across all sessions; the last
    /// one repeats. Empty means the real size.
    pub sizes: Vec<u64>,
    /// Send this many bytes per `RETR`, then hold the data connection open.
    pub stall_after: Option<usize>,
}

/// Minimal passive-mode FTP server serving one file.
pub struct MockFtp {
    pub port: u16,
    /// Offsets of every accepted `REST`.
    pub rests: Arc<Mutex<Vec<u64>>>,
    /// Start offset of every `RETR`.
    pub retrs: Arc<Mutex<Vec<u64>>>,
    pub logins: Arc<Mutex<Vec<String>>>,
}

impl MockFtp {
    pub fn url(&self, path: &str) -> String {
        format!("ftp://127.0.0.1:{}{}", self.port, path)
    }

    pub fn retrs(&self) -> Vec<u64> {
        let mut offsets = self.retrs.lock().unwrap().clone();
        offsets.sort();
        offsets
    }
}

#[derive(Clone)]
struct FtpShared {
    file_path: &'static str,
    body: Arc<Vec<u8>>,
    quirks: Arc<FtpQuirks>,
    size_queries: Arc<AtomicUsize>,
    rests: Arc<Mutex<Vec<u64>>>,
    retrs: Arc<Mutex<Vec<u64>>>,
    logins: Arc<Mutex<Vec<String>>>,
}

impl FtpShared {
    fn size(&self) -> u64 {
        let n = self.size_queries.fetch_add(1, Ordering::SeqCst);
        match self.quirks.sizes.get(n).or(self.quirks.sizes.last()) {
            Some(size) => *size,
            None => self.body.len() as u64,
        }
    }

    fn accepts_rest(&self, offset: u64) -> bool {
        match self.quirks.rest {
            RestPolicy::Accept => true,
            RestPolicy::Refuse => false,
            RestPolicy::CheckOnly => offset == 16,
        }
    }
}

pub async fn ftp_server(file_path: &'static str, body: Arc<Vec<u8>>) -> MockFtp {
    ftp_server_with(file_path, body, FtpQuirks::default()).await
}

pub async fn ftp_server_with(file_path: &'static str, body: Arc<Vec<u8>>, quirks: FtpQuirks) -> MockFtp {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let shared = FtpShared {
        file_path,
        body,
        quirks: Arc::new(quirks),
        size_queries: Arc::new(AtomicUsize::new(0)),
        rests: Arc::new(Mutex::new(Vec::new())),
        retrs: Arc::new(Mutex::new(Vec::new())),
        logins: Arc::new(Mutex::new(Vec::new())),
    };
    let mock = MockFtp {
        port,
        rests: shared.rests.clone(),
        retrs: shared.retrs.clone(),
        logins: shared.logins.clone(),
    };
    tokio::spawn(async move {
        while let Ok((sock, _)) = listener.accept().await {
            tokio::spawn(handle_ftp(sock, shared.clone()));
        }
    });
    mock
}

async fn handle_ftp(sock: TcpStream, shared: FtpShared) {
    let (read, mut write) = sock.into_split();
    let mut read = BufReader::new(read);
    let mut offset = 0u64;
    let mut passive: Option<TcpListener> = None;
    if write.write_all(b"220 mock ftp ready\r\n").await.is_err() {
        return;
    }
    loop {
        let mut line = String::new();
        match read.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = line.trim_end();
        let (cmd, arg) = line.split_once(' ').unwrap_or((line, ""));
        let reply: String = match cmd {
            "USER" => {
                shared.logins.lock().unwrap().push(arg.to_string());
                "331 password please".into()
            }
            "PASS" => "230 logged in".into(),
            "SYST" => "215 UNIX Type: L8".into(),
            "PWD" => "257 \"/\" is current directory".into(),
            "TYPE" => "200 binary".into(),
            "SIZE" if arg == shared.file_path => format!("213 {}", shared.size()),
            "SIZE" => "550 no such file".into(),
            "REST" => {
                let requested: u64 = arg.parse().unwrap_or(0);
                if shared.accepts_rest(requested) {
                    offset = requested;
                    shared.rests.lock().unwrap().push(offset);
                    format!("350 restarting at {offset}")
                } else {
                    "502 REST not implemented".into()
                }
            }
            "PASV" => {
                let data = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let port = data.local_addr().unwrap().port();
                passive = Some(data);
                format!("227 Entering Passive Mode (127,0,0,1,{},{})", port >> 8, port & 0xff)
            }
            "RETR" if arg == shared.file_path => {
                let Some(data) = passive.take() else {
                    let _ = write.write_all(b"425 use PASV first\r\n").await;
                    continue;
                };
                if write.write_all(b"150 opening data connection\r\n").await.is_err() {
                    return;
                }
                shared.retrs.lock().unwrap().push(offset);
                if let Ok((mut conn, _)) = data.accept().await {
                    let body = &shared.body;
                    let start = (offset as usize).min(body.len());
                    match shared.quirks.stall_after {
                        Some(n) => {
                            let end = (start + n).min(body.len());
                            let _ = conn.write_all(&body[start..end]).await;
                            tokio::time::sleep(Duration::from_secs(60)).await;
                        }
                        None => {
                            let _ = conn.write_all(&body[start..]).await;
                        }
                    }
                    let _ = conn.shutdown().await;
                }
                offset = 0;
                "226 transfer complete".into()
            }
            "RETR" => "550 no such file".into(),
            "QUIT" => {
                let _ = write.write_all(b"221 bye\r\n").await;
                return;
            }
            _ => "502 not implemented".into(),
        };
        if write.write_all(format!("{reply}\r\n").as_bytes()).await.is_err() {
            return;
        }
    }
}
