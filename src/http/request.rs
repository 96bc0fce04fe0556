//! Request construction.

use crate::chunk::DataChunk;
use crate::url_info::UrlInfo;

pub const USER_AGENT: &str = concat!("mget/", env!("CARGO_PKG_VERSION"));

/// Builds a `GET` for `target`.
///
/// `range` asks for `[cur_pos, end_pos)` of a chunk, sent as the inclusive
/// `bytes=<cur>-<end-1>`. `absolute_form` puts the full URL on the request
/// line, as plain-HTTP proxies expect.
pub fn get_request(target: &UrlInfo, range: Option<(u64, u64)>, absolute_form: bool) -> String {
    let request_target = if absolute_form {
        target.redacted()
    } else {
        target.uri.clone()
    };
    let mut req = format!(
        "GET {request_target} HTTP/1.1\r\n\
         Host: {}\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Accept: */*\r\n\
         Connection: Keep-Alive\r\n",
        target.host_header()
    );
    if let Some((start, end)) = range {
        req.push_str(&format!("Range: bytes={}-{}\r\n", start, end.saturating_sub(1)));
    }
    req.push_str("\r\n");
    req
}

/// Ranged `GET` for the unfetched part of `chunk`.
pub fn chunk_request(target: &UrlInfo, chunk: &DataChunk, absolute_form: bool) -> String {
    get_request(target, Some((chunk.cur_pos, chunk.end_pos)), absolute_form)
}

/// Size probe: the first two bytes tell whether ranges are honoured.
pub fn probe_request(target: &UrlInfo, absolute_form: bool) -> String {
    get_request(target, Some((0, 2)), absolute_form)
}

pub fn connect_request(authority: &str) -> String {
    format!(
        "CONNECT {authority} HTTP/1.1\r\n\
         Host: {authority}\r\n\
         User-Agent: {USER_AGENT}\r\n\r\n"
    )
}
