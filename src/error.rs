use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MgetError>;

/// Named failure reasons of the FTP control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FtpFailure {
    #[error("error in server response, closing control connection")]
    ServerResponse,
    #[error("error in server greeting")]
    ServerError,
    #[error("write failed, closing control connection")]
    WriteFailed,
    #[error("the server refuses login")]
    LoginRefused,
    #[error("login incorrect")]
    LoginIncorrect,
    #[error("unknown transfer type, closing control connection")]
    UnknownType,
    #[error("REST failed, server cannot resume from an offset")]
    RestFailed,
    #[error("cannot initiate PASV transfer")]
    NoPasv,
    #[error("cannot parse PASV response")]
    InvalidPasv,
    #[error("no such file")]
    NoSuchFile,
    #[error("remote size changed since the transfer started")]
    SizeMismatch,
    #[error("cannot get remote file size")]
    NoSize,
}

#[derive(Debug, Error)]
pub enum MgetError {
    #[error("failed to connect to {host}: {source}")]
    Connection { host: String, source: io::Error },

    #[error("failed to resolve host {0}")]
    Resolve(String),

    #[error("TLS handshake with {host} failed: {reason}")]
    Tls { host: String, reason: String },

    #[error("proxy refused CONNECT with status {0}")]
    ProxyRefused(u16),

    #[error("invalid url {url}: {reason}")]
    Url { url: String, reason: String },

    #[error("server returned {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("too many redirects (last location: {0})")]
    TooManyRedirects(String),

    #[error("ftp: {0}")]
    Ftp(FtpFailure),

    #[error("resource error on {}: {reason}", path.display())]
    Resource { path: PathBuf, reason: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("metadata file {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("metadata file {} was written by incompatible version {found}", path.display())]
    VersionIncompatible { path: PathBuf, found: String },

    #[error("connection idle for more than {0} seconds")]
    IdleTimeout(u64),

    #[error("transfer incomplete: {remaining} bytes outstanding")]
    Incomplete { remaining: u64 },

    #[error("download aborted by user")]
    Aborted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<FtpFailure> for MgetError {
    fn from(failure: FtpFailure) -> Self {
        MgetError::Ftp(failure)
    }
}

impl MgetError {
    pub fn resource(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        MgetError::Resource {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        MgetError::Corrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether a fresh attempt (resumed from the sidecar) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            MgetError::Connection { .. }
            | MgetError::Resolve(_)
            | MgetError::Tls { .. }
            | MgetError::Io(_)
            | MgetError::IdleTimeout(_)
            | MgetError::Incomplete { .. }
            | MgetError::MalformedResponse(_) => true,
            MgetError::HttpStatus { status, .. } => *status >= 500,
            MgetError::Ftp(failure) => matches!(
                failure,
                FtpFailure::ServerResponse
                    | FtpFailure::ServerError
                    | FtpFailure::WriteFailed
                    | FtpFailure::NoPasv
            ),
            MgetError::ProxyRefused(_)
            | MgetError::Url { .. }
            | MgetError::TooManyRedirects(_)
            | MgetError::Resource { .. }
            | MgetError::Corrupt { .. }
            | MgetError::VersionIncompatible { .. }
            | MgetError::Aborted
            | MgetError::Internal(_) => false,
        }
    }
}
