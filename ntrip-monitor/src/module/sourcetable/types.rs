//! NTRIP request and response-head types shared by the source-table client
//! and the stream health verifier

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ntrip_common::StationCode;
use std::time::Duration;

/// Caster host plus credentials; the port varies per request
#[derive(Debug, Clone)]
pub struct CasterEndpoint {
    pub host: String,
    pub user: String,
    pub password: String,
    pub user_agent: String,
    /// Bound for connecting and for every individual read
    pub timeout: Duration,
    /// Bound for a complete source-table exchange
    pub response_timeout: Duration,
}

impl CasterEndpoint {
    pub fn address(&self, port: u16) -> String {
        format!("{}:{}", self.host, port)
    }

    /// Render an NTRIP 2.0 GET for `mount` (empty mount = source table).
    pub fn request(&self, mount: &str) -> String {
        let credentials = STANDARD.encode(format!("{}:{}", self.user, self.password));
        format!(
            "GET /{mount} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Ntrip-Version: Ntrip/2.0\r\n\
             User-Agent: {agent}\r\n\
             Authorization: Basic {credentials}\r\n\
             Connection: close\r\n\
             \r\n",
            mount = mount,
            host = self.host,
            agent = self.user_agent,
            credentials = credentials,
        )
    }
}

/// First line of a caster response, resolved once at the boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseStatus {
    /// NTRIP 1 `SOURCETABLE 200 OK`
    SourceTable,
    /// NTRIP 1 stream acknowledgement `ICY 200 OK`
    Icy,
    /// NTRIP 2 / plain HTTP status line
    Http(u16),
    Unrecognized,
}

impl ResponseStatus {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("SOURCETABLE") => ResponseStatus::SourceTable,
            Some("ICY") => ResponseStatus::Icy,
            Some(version) if version.starts_with("HTTP/") => parts
                .next()
                .and_then(|code| code.parse().ok())
                .map(ResponseStatus::Http)
                .unwrap_or(ResponseStatus::Unrecognized),
            _ => ResponseStatus::Unrecognized,
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            ResponseStatus::SourceTable | ResponseStatus::Icy => true,
            ResponseStatus::Http(code) => *code == 200,
            ResponseStatus::Unrecognized => false,
        }
    }
}

/// One `STR;` line of a source table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub mountpoint: String,
    /// Field 4, e.g. `RTCM 3.2`, when present
    pub format: Option<String>,
}

impl StreamRecord {
    /// Candidate station code; `None` for mountpoints shorter than four characters.
    pub fn station_code(&self) -> Option<StationCode> {
        StationCode::from_mountpoint(&self.mountpoint).ok()
    }
}
