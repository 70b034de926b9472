//! Source-table client
//!
//! One TCP connection per port: send the request, read until the caster
//! closes, decode best-effort as text. Each read is bounded by the endpoint
//! timeout and the whole exchange by its response deadline and size cap.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::debug;

use super::types::{CasterEndpoint, ResponseStatus};
use crate::error::FetchError;

const READ_CHUNK: usize = 4096;
pub const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

/// Anything that can hand back the raw source table for a caster port.
#[async_trait]
pub trait SourceTableFetcher: Send + Sync {
    async fn fetch(&self, port: u16) -> Result<String, FetchError>;
}

#[async_trait]
impl<T: SourceTableFetcher + ?Sized> SourceTableFetcher for &T {
    async fn fetch(&self, port: u16) -> Result<String, FetchError> {
        (**self).fetch(port).await
    }
}

#[async_trait]
impl<T: SourceTableFetcher + ?Sized> SourceTableFetcher for Arc<T> {
    async fn fetch(&self, port: u16) -> Result<String, FetchError> {
        (**self).fetch(port).await
    }
}

pub struct SourceTableClient {
    endpoint: CasterEndpoint,
}

impl SourceTableClient {
    pub fn new(endpoint: CasterEndpoint) -> Self {
        Self { endpoint }
    }
}

/// Open a connection to `port` and send the NTRIP request for `mount`.
pub(crate) async fn open_request(
    endpoint: &CasterEndpoint,
    port: u16,
    mount: &str,
) -> Result<TcpStream, FetchError> {
    let addr = endpoint.address(port);

    let mut stream = match timeout(endpoint.timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(FetchError::Connect { addr, source }),
        Err(_) => return Err(FetchError::Timeout(endpoint.timeout)),
    };

    let request = endpoint.request(mount);
    match timeout(endpoint.timeout, stream.write_all(request.as_bytes())).await {
        Ok(result) => result?,
        Err(_) => return Err(FetchError::Timeout(endpoint.timeout)),
    }

    Ok(stream)
}

#[async_trait]
impl SourceTableFetcher for SourceTableClient {
    async fn fetch(&self, port: u16) -> Result<String, FetchError> {
        let deadline = Instant::now() + self.endpoint.response_timeout;
        let mut stream = open_request(&self.endpoint, port, "").await?;

        let mut response = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let read = timeout(self.endpoint.timeout, stream.read(&mut chunk));
            let n = match timeout_at(deadline, read).await {
                Ok(Ok(result)) => result?,
                Ok(Err(_)) => return Err(FetchError::Timeout(self.endpoint.timeout)),
                Err(_) => return Err(FetchError::Timeout(self.endpoint.response_timeout)),
            };
            if n == 0 {
                break;
            }
            if response.len() + n > MAX_RESPONSE_BYTES {
                return Err(FetchError::TooLarge(MAX_RESPONSE_BYTES));
            }
            response.extend_from_slice(&chunk[..n]);
        }

        let text = String::from_utf8_lossy(&response).into_owned();
        debug!("Port {}: received {} bytes", port, response.len());

        let status_line = text.lines().next().unwrap_or_default();
        let status = ResponseStatus::parse(status_line);
        match status {
            ResponseStatus::Http(_) if !status.is_success() => {
                Err(FetchError::Rejected(status_line.trim().to_string()))
            }
            _ => Ok(text),
        }
    }
}
