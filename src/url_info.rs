//! Parsed download target.

use std::fmt;

use percent_encoding::percent_decode_str;
use url::{Host, Url};

use crate::error::{MgetError, Result};
use crate::utils::file_name_from_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
    Ftp,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
            Protocol::Ftp => 21,
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Protocol::Https)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlInfo {
    url: Url,
    pub protocol: Protocol,
    /// Host to connect to; IPv6 literals without brackets.
    pub host: String,
    pub port: u16,
    /// Path plus query, as sent on the request line.
    pub uri: String,
    pub basename: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl UrlInfo {
    /// Parses `raw`; a bare `host/path` is taken as `http://host/path`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let parsed = if raw.contains("://") {
            Url::parse(raw)
        } else {
            Url::parse(&format!("http://{raw}"))
        };
        let url = parsed.map_err(|e| MgetError::Url {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_url(url)
    }

    pub fn from_url(url: Url) -> Result<Self> {
        let invalid = |reason: &str| MgetError::Url {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let protocol = match url.scheme() {
            "http" => Protocol::Http,
            "https" => Protocol::Https,
            "ftp" => Protocol::Ftp,
            other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
        };
        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(invalid("missing host")),
        };
        let port = url.port().unwrap_or_else(|| protocol.default_port());

        let mut uri = url.path().to_string();
        if let Some(query) = url.query() {
            uri.push('?');
            uri.push_str(query);
        }
        let basename = file_name_from_path(url.path());

        let user = (!url.username().is_empty()).then(|| decode(url.username()));
        let password = url.password().map(decode);

        Ok(Self {
            url,
            protocol,
            host,
            port,
            uri,
            basename,
            user,
            password,
        })
    }

    /// Resolves a `Location` header value against this URL.
    pub fn resolve(&self, location: &str) -> Result<Self> {
        let joined = self.url.join(location.trim()).map_err(|e| MgetError::Url {
            url: location.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_url(joined)
    }

    pub fn as_url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// Value of the `Host` header: the port is included only when it is not
    /// the scheme default.
    pub fn host_header(&self) -> String {
        let host = self.url.host_str().unwrap_or(&self.host);
        if self.port == self.protocol.default_port() {
            host.to_string()
        } else {
            format!("{host}:{}", self.port)
        }
    }

    /// `host:port` with the port always present (CONNECT targets).
    pub fn host_header_with_port(&self) -> String {
        let host = self.url.host_str().unwrap_or(&self.host);
        format!("{host}:{}", self.port)
    }

    /// The URL without user-info, for logs and absolute-form requests.
    pub fn redacted(&self) -> String {
        let mut url = self.url.clone();
        let _ = url.set_username("");
        let _ = url.set_password(None);
        url.to_string()
    }

    /// Path of the file on an FTP server, without the leading slash.
    pub fn ftp_path(&self) -> String {
        decode(self.url.path().trim_start_matches('/'))
    }
}

fn decode(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

impl fmt::Display for UrlInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}
