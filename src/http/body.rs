//! Body framing: content-length, chunked transfer-encoding, and
//! read-until-close.

use crate::error::{MgetError, Result};

use super::response::ResponseHeader;

const MAX_LINE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
    Done,
}

/// Incremental decoder for `Transfer-Encoding: chunked`.
///
/// Input may be split anywhere; bytes after the terminating zero-size chunk
/// and its trailer are left unconsumed.
#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    state: ChunkedState,
    line: Vec<u8>,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self {
            state: ChunkedState::Size,
            line: Vec::new(),
        }
    }
}

impl ChunkedDecoder {
    pub fn is_done(&self) -> bool {
        self.state == ChunkedState::Done
    }

    /// Decodes as much of `input` as possible into `out`; returns the number
    /// of input bytes consumed.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let mut pos = 0;
        while pos < input.len() {
            match self.state {
                ChunkedState::Done => break,
                ChunkedState::Data(left) => {
                    let take = (input.len() - pos).min(left as usize);
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    let left = left - take as u64;
                    self.state = if left == 0 {
                        ChunkedState::DataEnd
                    } else {
                        ChunkedState::Data(left)
                    };
                }
                ChunkedState::Size | ChunkedState::DataEnd | ChunkedState::Trailer => {
                    let Some(line) = self.take_line(input, &mut pos)? else {
                        break;
                    };
                    self.state = self.after_line(&line)?;
                }
            }
        }
        Ok(pos)
    }

    /// Accumulates one `\n`-terminated line; `None` if it is still partial.
    fn take_line(&mut self, input: &[u8], pos: &mut usize) -> Result<Option<Vec<u8>>> {
        let rest = &input[*pos..];
        match rest.iter().position(|&b| b == b'\n') {
            Some(nl) => {
                self.line.extend_from_slice(&rest[..nl]);
                *pos += nl + 1;
                let mut line = std::mem::take(&mut self.line);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Ok(Some(line))
            }
            None => {
                self.line.extend_from_slice(rest);
                *pos = input.len();
                if self.line.len() > MAX_LINE {
                    return Err(MgetError::MalformedResponse("chunk line too long".into()));
                }
                Ok(None)
            }
        }
    }

    fn after_line(&self, line: &[u8]) -> Result<ChunkedState> {
        match self.state {
            ChunkedState::Size => {
                let size = parse_chunk_size(line)?;
                Ok(if size == 0 {
                    ChunkedState::Trailer
                } else {
                    ChunkedState::Data(size)
                })
            }
            ChunkedState::DataEnd if line.is_empty() => Ok(ChunkedState::Size),
            ChunkedState::DataEnd => Err(MgetError::MalformedResponse(
                "missing CRLF after chunk data".into(),
            )),
            ChunkedState::Trailer if line.is_empty() => Ok(ChunkedState::Done),
            ChunkedState::Trailer => Ok(ChunkedState::Trailer),
            state => Ok(state),
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| MgetError::MalformedResponse("chunk size is not ASCII".into()))?;
    // Chunk extensions follow a ';'.
    let digits = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(digits, 16)
        .map_err(|_| MgetError::MalformedResponse(format!("bad chunk size '{digits}'")))
}

/// How the end of a response body is found.
#[derive(Debug, Clone)]
pub enum Framing {
    /// Exactly this many bytes remain.
    Length(u64),
    Chunked(ChunkedDecoder),
    /// Everything until the peer closes.
    UntilClose,
}

impl Framing {
    pub fn for_response(header: &ResponseHeader) -> Self {
        if header.is_chunked() {
            Framing::Chunked(ChunkedDecoder::default())
        } else if let Some(len) = header.content_length() {
            Framing::Length(len)
        } else {
            Framing::UntilClose
        }
    }

    /// Total size the framing announces up front.
    pub fn known_length(&self) -> Option<u64> {
        match self {
            Framing::Length(len) => Some(*len),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        match self {
            Framing::Length(left) => *left == 0,
            Framing::Chunked(decoder) => decoder.is_done(),
            Framing::UntilClose => false,
        }
    }

    /// Moves payload bytes from `input` to `out`; returns input consumed.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        match self {
            Framing::Length(left) => {
                let take = input.len().min(*left as usize);
                out.extend_from_slice(&input[..take]);
                *left -= take as u64;
                Ok(take)
            }
            Framing::Chunked(decoder) => decoder.feed(input, out),
            Framing::UntilClose => {
                out.extend_from_slice(input);
                Ok(input.len())
            }
        }
    }

    /// Whether a close by the peer ends the body cleanly.
    pub fn close_is_eof(&self) -> bool {
        matches!(self, Framing::UntilClose) || self.is_done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_wikipedia_example() {
        let input = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::default();
        let mut out = Vec::new();
        let used = decoder.feed(input, &mut out).unwrap();
        assert_eq!(out, b"Wikipedia");
        assert_eq!(used, input.len());
        assert!(decoder.is_done());
    }

    #[test]
    fn byte_at_a_time() {
        let input = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let mut decoder = ChunkedDecoder::default();
        let mut out = Vec::new();
        for byte in input.iter() {
            decoder.feed(std::slice::from_ref(byte), &mut out).unwrap();
        }
        assert_eq!(out, b"Wikipedia");
        assert!(decoder.is_done());
    }

    #[test]
    fn residual_bytes_are_not_a_chunk_size() {
        let input = b"3\r\nabc\r\n0\r\n\r\nHTTP/1.1 200 OK";
        let mut decoder = ChunkedDecoder::default();
        let mut out = Vec::new();
        let used = decoder.feed(input, &mut out).unwrap();
        assert_eq!(out, b"abc");
        assert_eq!(&input[used..], b"HTTP/1.1 200 OK");
        let again = decoder.feed(&input[used..], &mut out).unwrap();
        assert_eq!(again, 0);
    }

    #[test]
    fn bad_chunk_data() {
        let mut decoder = ChunkedDecoder::default();
        assert!(decoder.feed(b"zz\r\n", &mut Vec::new()).is_err());
        let mut decoder = ChunkedDecoder::default();
        assert!(decoder.feed(b"2\r\nabXX\r\n", &mut Vec::new()).is_err());
    }

    #[test]
    fn length_framing_stops_at_limit() {
        let mut framing = Framing::Length(5);
        let mut out = Vec::new();
        assert_eq!(framing.decode(b"hel", &mut out).unwrap(), 3);
        assert!(!framing.is_done());
        assert_eq!(framing.decode(b"lo, extra", &mut out).unwrap(), 2);
        assert!(framing.is_done());
        assert_eq!(out, b"hello");
    }

    #[test]
    fn framing_from_headers() {
        let chunked =
            ResponseHeader::parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Length: 9\r\n")
                .unwrap();
        assert!(matches!(Framing::for_response(&chunked), Framing::Chunked(_)));
        let sized = ResponseHeader::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n").unwrap();
        assert_eq!(Framing::for_response(&sized).known_length(), Some(9));
        let open = ResponseHeader::parse(b"HTTP/1.0 200 OK\r\n").unwrap();
        let framing = Framing::for_response(&open);
        assert!(framing.close_is_eof());
        assert_eq!(framing.known_length(), None);
    }
}
