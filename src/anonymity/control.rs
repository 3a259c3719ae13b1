//! Anonymity-network control protocol session
//!
//! Line-oriented protocol over TCP: every reply is a run of `NNN-` lines,
//! optional `NNN+` data blocks terminated by a lone `.`, and a final
//! `NNN ` line. Status 250 means success.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, trace};

use crate::error::{Result, VeilError};
use crate::models::{Circuit, CircuitStatus};

const STATUS_OK: u16 = 250;

/// One complete reply from the daemon
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlReply {
    pub status: u16,
    /// Text of every reply line, without the status prefix
    pub lines: Vec<String>,
    /// Lines carried inside data blocks, dot-unstuffed
    pub data: Vec<String>,
}

impl ControlReply {
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Text of the final line, used in error messages
    pub fn message(&self) -> String {
        self.lines.last().cloned().unwrap_or_default()
    }

    fn into_result(self, context: &str) -> Result<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(VeilError::ControlProtocol(format!(
                "{} rejected: {} {}",
                context,
                self.status,
                self.message()
            )))
        }
    }
}

/// Authentication methods advertised by PROTOCOLINFO
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub methods: Vec<String>,
    pub cookie_file: Option<String>,
}

impl ProtocolInfo {
    fn supports(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }

    fn parse(reply: &ControlReply) -> Self {
        let mut info = ProtocolInfo::default();

        for line in &reply.lines {
            let Some(rest) = line.strip_prefix("AUTH ") else {
                continue;
            };

            if let Some(methods) = rest.strip_prefix("METHODS=") {
                let methods = methods.split(' ').next().unwrap_or_default();
                info.methods = methods.split(',').map(str::to_string).collect();
            }

            if let Some(idx) = rest.find("COOKIEFILE=") {
                let value = &rest[idx + "COOKIEFILE=".len()..];
                info.cookie_file = Some(unquote(value));
            }
        }

        info
    }
}

/// An open, line-framed control session
///
/// A command that times out, fails mid-reply or is cancelled leaves the
/// session desynced: its reply may still arrive. Such a session refuses
/// further commands and must be replaced.
pub struct ControlConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    io_timeout: Duration,
    in_flight: bool,
}

impl ControlConnection {
    /// Open a session to the control port
    #[instrument(skip(io_timeout))]
    pub async fn connect(addr: &str, io_timeout: Duration) -> Result<Self> {
        let stream = timeout(io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| VeilError::Timeout)??;

        debug!("Control connection opened to {}", addr);

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            io_timeout,
            in_flight: false,
        })
    }

    /// True when a previous command never read its complete reply
    pub fn is_desynced(&self) -> bool {
        self.in_flight
    }

    /// Send one command line and read its complete reply
    pub async fn command(&mut self, line: &str) -> Result<ControlReply> {
        if self.in_flight {
            return Err(VeilError::ControlProtocol(
                "session out of sync with the daemon".to_string(),
            ));
        }

        self.in_flight = true;
        let reply = timeout(self.io_timeout, self.exchange(line))
            .await
            .map_err(|_| VeilError::Timeout)??;
        self.in_flight = false;

        Ok(reply)
    }

    async fn exchange(&mut self, line: &str) -> Result<ControlReply> {
        trace!("-> {}", redact(line));
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<ControlReply> {
        let mut reply = ControlReply::default();

        loop {
            let line = self.read_line().await?;
            trace!("<- {}", line);

            let (Some(code), Some(&separator), Some(text)) =
                (line.get(..3), line.as_bytes().get(3), line.get(4..))
            else {
                return Err(VeilError::ControlProtocol(format!(
                    "malformed reply line: {:?}",
                    line
                )));
            };

            reply.status = code.parse().map_err(|_| {
                VeilError::ControlProtocol(format!("malformed status in {:?}", line))
            })?;
            reply.lines.push(text.to_string());

            match separator {
                b'-' => continue,
                b'+' => self.read_data_block(&mut reply.data).await?,
                b' ' => return Ok(reply),
                _ => {
                    return Err(VeilError::ControlProtocol(format!(
                        "unknown reply separator in {:?}",
                        line
                    )))
                }
            }
        }
    }

    async fn read_data_block(&mut self, data: &mut Vec<String>) -> Result<()> {
        loop {
            let line = self.read_line().await?;
            if line == "." {
                return Ok(());
            }
            let line = line.strip_prefix('.').map(str::to_string).unwrap_or(line);
            data.push(line);
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf).await?;
        if n == 0 {
            return Err(VeilError::ControlProtocol(
                "control connection closed by daemon".to_string(),
            ));
        }
        Ok(buf.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Authenticate with a password, or with whatever PROTOCOLINFO offers
    pub async fn authenticate(&mut self, password: Option<&str>) -> Result<()> {
        let command = match password {
            Some(password) => format!("AUTHENTICATE {}", quote(password)),
            None => {
                let info = self.protocol_info().await?;
                debug!(methods = ?info.methods, "Control port authentication methods");

                if info.supports("NULL") {
                    "AUTHENTICATE".to_string()
                } else if info.supports("COOKIE") {
                    let path = info.cookie_file.ok_or_else(|| {
                        VeilError::ControlAuthentication(
                            "cookie authentication offered without a cookie file".to_string(),
                        )
                    })?;
                    let cookie = tokio::fs::read(&path).await.map_err(|e| {
                        VeilError::ControlAuthentication(format!(
                            "cannot read cookie file {}: {}",
                            path, e
                        ))
                    })?;
                    format!("AUTHENTICATE {}", hex::encode(cookie))
                } else {
                    return Err(VeilError::ControlAuthentication(format!(
                        "no usable method among {:?}; configure a control password",
                        info.methods
                    )));
                }
            }
        };

        let reply = self.command(&command).await?;
        if !reply.is_ok() {
            return Err(VeilError::ControlAuthentication(format!(
                "{} {}",
                reply.status,
                reply.message()
            )));
        }

        debug!("Control session authenticated");
        Ok(())
    }

    async fn protocol_info(&mut self) -> Result<ProtocolInfo> {
        let reply = self.command("PROTOCOLINFO 1").await?.into_result("PROTOCOLINFO")?;
        Ok(ProtocolInfo::parse(&reply))
    }

    /// Ask the daemon to switch to clean circuits
    pub async fn signal_newnym(&mut self) -> Result<()> {
        self.command("SIGNAL NEWNYM")
            .await?
            .into_result("SIGNAL NEWNYM")?;
        Ok(())
    }

    /// Current circuits as listed by the daemon
    pub async fn circuit_status(&mut self) -> Result<Vec<Circuit>> {
        let reply = self
            .command("GETINFO circuit-status")
            .await?
            .into_result("GETINFO circuit-status")?;

        let inline = reply
            .lines
            .iter()
            .filter_map(|l| l.strip_prefix("circuit-status="))
            .filter(|rest| !rest.is_empty())
            .map(str::to_string);

        Ok(reply
            .data
            .iter()
            .cloned()
            .chain(inline)
            .filter_map(|line| parse_circuit_line(&line))
            .collect())
    }

    /// Close the session politely
    pub async fn quit(mut self) {
        if let Err(e) = self.command("QUIT").await {
            debug!("QUIT failed: {}", e);
        }
        let _ = self.writer.shutdown().await;
    }
}

/// Parse one `circuit-status` entry: `ID STATUS [PATH] [KEY=VALUE...]`
pub(crate) fn parse_circuit_line(line: &str) -> Option<Circuit> {
    let mut tokens = line.split_whitespace();
    let id = tokens.next()?.to_string();
    let status = CircuitStatus::from_keyword(tokens.next()?)?;

    let mut path = Vec::new();
    let mut purpose = None;

    for (i, token) in tokens.enumerate() {
        if let Some(value) = token.strip_prefix("PURPOSE=") {
            purpose = Some(value.to_string());
        } else if i == 0 && !token.contains('=') {
            path = token.split(',').map(str::to_string).collect();
        }
    }

    Some(Circuit {
        id,
        status,
        path,
        purpose,
    })
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

fn unquote(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"') else {
        return value.split(' ').next().unwrap_or_default().to_string();
    };

    let mut out = String::new();
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => break,
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            c => out.push(c),
        }
    }
    out
}

fn redact(line: &str) -> &str {
    if line.starts_with("AUTHENTICATE ") {
        "AUTHENTICATE <redacted>"
    } else {
        line
    }
}
