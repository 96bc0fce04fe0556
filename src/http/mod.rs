//! HTTP/1.1 client pieces: requests, response headers, body framing, and
//! the engine that drives them.

pub mod body;
pub mod engine;
pub mod request;
pub mod response;
