//! Resumable multi-connection HTTP(S)/FTP downloader.
//!
//! A download is split into byte-range chunks fetched over parallel
//! connections. Progress lives in a memory-mapped `<file>.tmd` sidecar so
//! an interrupted download resumes where it stopped.

pub mod byte_queue;
pub mod chunk;
pub mod cli;
pub mod connection;
pub mod download_info;
pub mod downloader;
pub mod error;
pub mod ftp;
pub mod group;
pub mod host_cache;
pub mod http;
pub mod logging;
pub mod metadata;
pub mod output;
pub mod side_table;
pub mod state;
pub mod throttle;
pub mod url_info;
pub mod utils;

pub use downloader::{DownloadOptions, DownloadReport, Downloader};
pub use error::{MgetError, Result};
pub use state::{DownloadState, DownloadStatus};
