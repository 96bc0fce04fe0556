//! FTP control channel: command/reply exchange and the handful of commands
//! a download needs.

use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::byte_queue::ByteQueue;
use crate::connection::Connection;
use crate::error::{FtpFailure, MgetError, Result};

const MAX_LINE: usize = 4096;

/// One (possibly multi-line) server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    /// Text of the final line, after the code.
    pub text: String,
}

impl Reply {
    pub fn class(&self) -> u16 {
        self.code / 100
    }
}

fn reply_code(line: &str) -> Option<u16> {
    let code = line.get(..3)?;
    if !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    code.parse().ok()
}

/// Whether `line` ends a reply that started with `code`: `"ddd "` or a bare
/// `"ddd"`.
fn is_final_line(line: &str, code: &str) -> bool {
    line.starts_with(code) && matches!(line.as_bytes().get(3), None | Some(b' '))
}

/// CR and LF inside an argument would smuggle a second command.
fn defang(arg: &str) -> String {
    arg.replace(['\r', '\n'], " ")
}

/// `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`.
pub fn parse_pasv(text: &str) -> Option<(Ipv4Addr, u16)> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let numbers: Vec<u8> = text[start..]
        .split(|c: char| !(c.is_ascii_digit() || c == ','))
        .next()?
        .split(',')
        .map(|n| n.parse().ok())
        .collect::<Option<Vec<u8>>>()?;
    if numbers.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(numbers[0], numbers[1], numbers[2], numbers[3]);
    let port = (u16::from(numbers[4]) << 8) | u16::from(numbers[5]);
    Some((ip, port))
}

/// `257 "/pub/dir" is the current directory`.
fn parse_pwd(text: &str) -> Option<String> {
    let start = text.find('"')? + 1;
    let len = text[start..].find('"')?;
    let dir = &text[start..start + len];
    (!dir.is_empty()).then(|| dir.to_string())
}

pub struct ControlChannel {
    conn: Connection,
    bq: ByteQueue,
    idle: Duration,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("peer", &self.conn.peer())
            .finish()
    }
}

impl ControlChannel {
    pub fn new(conn: Connection, idle: Duration) -> Self {
        Self {
            conn,
            bq: ByteQueue::default(),
            idle,
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(pos) = self.bq.find(b"\n") {
                let line = String::from_utf8_lossy(&self.bq.readable()[..pos])
                    .trim_end_matches('\r')
                    .to_string();
                self.bq.consume(pos + 1);
                return Ok(line);
            }
            if self.bq.len() > MAX_LINE {
                return Err(FtpFailure::ServerResponse.into());
            }
            let n = tokio::time::timeout(self.idle, self.conn.fill(&mut self.bq, 512))
                .await
                .map_err(|_| MgetError::IdleTimeout(self.idle.as_secs()))??;
            if n == 0 {
                debug!("{} closed the control connection", self.conn.peer());
                return Err(FtpFailure::ServerResponse.into());
            }
        }
    }

    pub async fn read_reply(&mut self) -> Result<Reply> {
        let first = self.read_line().await?;
        let code = reply_code(&first).ok_or(FtpFailure::ServerResponse)?;
        let mut last = first;
        if last.as_bytes().get(3) == Some(&b'-') {
            let prefix = last[..3].to_string();
            loop {
                let line = self.read_line().await?;
                if is_final_line(&line, &prefix) {
                    last = line;
                    break;
                }
            }
        }
        let text = last.get(4..).unwrap_or_default().to_string();
        debug!("<- {code} {text}");
        Ok(Reply { code, text })
    }

    pub async fn send(&mut self, command: &str, arg: Option<&str>) -> Result<Reply> {
        let line = match arg {
            Some(arg) => format!("{command} {}\r\n", defang(arg)),
            None => format!("{command}\r\n"),
        };
        if command == "PASS" {
            debug!("-> PASS ****");
        } else {
            debug!("-> {}", line.trim_end());
        }
        self.conn.write_all(line.as_bytes()).await.map_err(|e| {
            warn!("write to {} failed: {e}", self.conn.peer());
            MgetError::Ftp(FtpFailure::WriteFailed)
        })?;
        self.read_reply().await
    }

    /// Reads the greeting, then `USER` and, when asked for, `PASS`.
    pub async fn login(&mut self, user: &str, password: &str) -> Result<()> {
        let greeting = self.read_reply().await?;
        if greeting.class() != 2 {
            return Err(FtpFailure::ServerError.into());
        }
        let reply = self.send("USER", Some(user)).await?;
        match reply.class() {
            2 => return Ok(()),
            3 => {}
            _ => return Err(FtpFailure::LoginRefused.into()),
        }
        let reply = self.send("PASS", Some(password)).await?;
        if reply.class() != 2 {
            return Err(FtpFailure::LoginIncorrect.into());
        }
        Ok(())
    }

    /// System type; a refusal is not fatal.
    pub async fn syst(&mut self) -> Result<Option<String>> {
        let reply = self.send("SYST", None).await?;
        match reply.class() {
            2 => Ok(Some(reply.text)),
            5 => Ok(None),
            _ => Err(FtpFailure::ServerResponse.into()),
        }
    }

    /// Working directory after login, `/` when the server won't say.
    pub async fn pwd(&mut self) -> Result<String> {
        let reply = self.send("PWD", None).await?;
        match reply.class() {
            2 => Ok(parse_pwd(&reply.text).unwrap_or_else(|| "/".to_string())),
            5 => Ok("/".to_string()),
            _ => Err(FtpFailure::ServerResponse.into()),
        }
    }

    pub async fn type_binary(&mut self) -> Result<()> {
        let reply = self.send("TYPE", Some("I")).await?;
        if reply.class() != 2 {
            return Err(FtpFailure::UnknownType.into());
        }
        Ok(())
    }

    /// Remote size in bytes; 0 when `SIZE` is not supported.
    pub async fn size(&mut self, path: &str) -> Result<u64> {
        let reply = self.send("SIZE", Some(path)).await?;
        match reply.class() {
            2 => Ok(reply
                .text
                .split_whitespace()
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap_or(0)),
            5 => Ok(0),
            _ => Err(FtpFailure::ServerResponse.into()),
        }
    }

    pub async fn rest(&mut self, offset: u64) -> Result<()> {
        let reply = self.send("REST", Some(&offset.to_string())).await?;
        if reply.class() != 3 {
            return Err(FtpFailure::RestFailed.into());
        }
        Ok(())
    }

    pub async fn pasv(&mut self) -> Result<(Ipv4Addr, u16)> {
        let reply = self.send("PASV", None).await?;
        if reply.class() != 2 {
            return Err(FtpFailure::NoPasv.into());
        }
        parse_pasv(&reply.text).ok_or_else(|| FtpFailure::InvalidPasv.into())
    }

    pub async fn retr(&mut self, path: &str) -> Result<()> {
        let reply = self.send("RETR", Some(path)).await?;
        match reply.class() {
            1 => Ok(()),
            5 => Err(FtpFailure::NoSuchFile.into()),
            _ => Err(FtpFailure::ServerResponse.into()),
        }
    }

    /// Best effort; the channel is dropped either way.
    pub async fn quit(mut self) {
        if let Err(e) = self.conn.write_all(b"QUIT\r\n").await {
            debug!("QUIT to {} failed: {e}", self.conn.peer());
        }
        self.conn.shutdown().await;
    }
}

/// Absolute path of a URL path relative to the login directory.
pub fn remote_path(pwd: &str, url_path: &str) -> String {
    if url_path.starts_with('/') {
        return url_path.to_string();
    }
    format!("{}/{}", pwd.trim_end_matches('/'), url_path)
}
