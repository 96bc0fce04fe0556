//! Response status line and header parsing.

use crate::byte_queue::ByteQueue;
use crate::connection::Connection;
use crate::error::{MgetError, Result};

pub const HEADER_END: &[u8] = b"\r\n\r\n";
pub const MAX_HEADER_LEN: usize = 64 * 1024;
const READ_RESERVE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    pub version: String,
    pub status: u16,
    pub reason: String,
    /// Keys are lowercased; order as received.
    headers: Vec<(String, String)>,
}

/// `Content-Range: bytes <start>-<end>/<total>`; `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

impl ResponseHeader {
    /// Parses a header block (status line plus header lines), with or
    /// without the blank line that terminates it.
    pub fn parse(block: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(block)
            .map_err(|_| MgetError::MalformedResponse("header is not valid UTF-8".into()))?;
        let mut lines = text.split("\r\n").filter(|l| !l.is_empty());

        let status_line = lines
            .next()
            .ok_or_else(|| MgetError::MalformedResponse("empty response".into()))?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(MgetError::MalformedResponse(format!(
                "bad status line '{status_line}'"
            )));
        }
        let status = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .filter(|code| (100..1000).contains(code))
            .ok_or_else(|| MgetError::MalformedResponse(format!("bad status line '{status_line}'")))?;
        let reason = parts.next().unwrap_or_default().trim().to_string();

        let mut headers = Vec::new();
        for line in lines {
            let Some((key, value)) = line.split_once(':') else {
                return Err(MgetError::MalformedResponse(format!("bad header line '{line}'")));
            };
            headers.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
        }

        Ok(Self {
            version: version.to_string(),
            status,
            reason,
            headers,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length")?.parse().ok()
    }

    pub fn content_range(&self) -> Option<ContentRange> {
        parse_content_range(self.get("content-range")?)
    }

    pub fn is_chunked(&self) -> bool {
        self.get("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    pub fn location(&self) -> Option<&str> {
        self.get("location")
    }

    pub fn content_disposition(&self) -> Option<&str> {
        self.get("content-disposition")
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }
}

pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let spec = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = spec.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some(ContentRange { start, end, total })
}

/// Takes a complete header off the front of `bq`, if one is buffered.
/// Bytes after the terminator stay in the queue as the start of the body.
pub fn take_header(bq: &mut ByteQueue) -> Result<Option<ResponseHeader>> {
    match bq.find(HEADER_END) {
        Some(pos) => {
            let header = ResponseHeader::parse(&bq.readable()[..pos])?;
            bq.consume(pos + HEADER_END.len());
            Ok(Some(header))
        }
        None if bq.len() > MAX_HEADER_LEN => Err(MgetError::MalformedResponse(format!(
            "header exceeds {MAX_HEADER_LEN} bytes"
        ))),
        None => Ok(None),
    }
}

/// Reads until a full header is available, however many reads it takes.
pub async fn read_header(conn: &mut Connection, bq: &mut ByteQueue) -> Result<ResponseHeader> {
    loop {
        if let Some(header) = take_header(bq)? {
            return Ok(header);
        }
        let n = conn.fill(bq, READ_RESERVE).await?;
        if n == 0 {
            return Err(MgetError::MalformedResponse(
                "connection closed before the end of the header".into(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn partial_content_keeps_body_bytes() {
        let body = [0xABu8; 100];
        let mut bq = ByteQueue::default();
        bq.push(b"HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 0-99/1000\r\n\r\n");
        bq.push(&body);

        let header = take_header(&mut bq).unwrap().unwrap();
        assert_eq!(header.status, 206);
        assert_eq!(header.reason, "Partial Content");
        assert_eq!(header.content_range().unwrap().total, Some(1000));
        assert_eq!(bq.readable(), &body[..]);
    }

    #[test]
    fn keys_are_case_folded() {
        let header = ResponseHeader::parse(
            b"HTTP/1.1 200 OK\r\nCONTENT-LENGTH: 42\r\nTransfer-Encoding: Chunked\r\nX-Empty:\r\n",
        )
        .unwrap();
        assert_eq!(header.content_length(), Some(42));
        assert!(header.is_chunked());
        assert_eq!(header.get("x-empty"), Some(""));
        assert_eq!(header.get("Content-Length"), Some("42"));
    }

    #[test]
    fn incomplete_header_waits() {
        let mut bq = ByteQueue::default();
        bq.push(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n");
        assert!(take_header(&mut bq).unwrap().is_none());
        bq.push(b"\r\nabc");
        let header = take_header(&mut bq).unwrap().unwrap();
        assert_eq!(header.content_length(), Some(3));
        assert_eq!(bq.readable(), b"abc");
    }

    #[test]
    fn malformed_status_lines() {
        assert!(ResponseHeader::parse(b"SSH-2.0-OpenSSH\r\n").is_err());
        assert!(ResponseHeader::parse(b"HTTP/1.1 abc OK\r\n").is_err());
        assert!(ResponseHeader::parse(b"HTTP/1.1 200 OK\r\nno-colon-here\r\n").is_err());
        let bare = ResponseHeader::parse(b"HTTP/1.0 204\r\n").unwrap();
        assert_eq!(bare.status, 204);
        assert_eq!(bare.version, "HTTP/1.0");
    }

    #[test]
    fn content_range_forms() {
        assert_eq!(
            parse_content_range("bytes 100-199/5000"),
            Some(ContentRange { start: 100, end: 199, total: Some(5000) })
        );
        assert_eq!(
            parse_content_range("bytes 0-1/*"),
            Some(ContentRange { start: 0, end: 1, total: None })
        );
        assert_eq!(parse_content_range("bytes 9-1/10"), None);
        assert_eq!(parse_content_range("items 0-1/2"), None);
    }

    #[test]
    fn redirect_statuses() {
        for code in [301u16, 302, 303, 307, 308] {
            let raw = format!("HTTP/1.1 {code} Moved\r\nLocation: /x\r\n");
            let header = ResponseHeader::parse(raw.as_bytes()).unwrap();
            assert!(header.is_redirect());
            assert_eq!(header.location(), Some("/x"));
        }
    }

    #[tokio::test]
    async fn header_split_across_reads() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut conn = Connection::from_stream(client, "test");
        let writer = tokio::spawn(async move {
            for piece in [&b"HTTP/1.1 200 OK\r\nCont"[..], b"ent-Length: 5\r\n", b"\r\nhel", b"lo"] {
                server.write_all(piece).await.unwrap();
                tokio::task::yield_now().await;
            }
            server
        });
        let mut bq = ByteQueue::with_capacity(8);
        let header = read_header(&mut conn, &mut bq).await.unwrap();
        assert_eq!(header.content_length(), Some(5));
        assert!(bq.readable().starts_with(b"hel"));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn early_close_is_malformed() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b"HTTP/1.1 200 OK\r\n").await.unwrap();
        drop(server);
        let mut conn = Connection::from_stream(client, "test");
        let mut bq = ByteQueue::default();
        assert!(matches!(
            read_header(&mut conn, &mut bq).await,
            Err(MgetError::MalformedResponse(_))
        ));
    }
}
