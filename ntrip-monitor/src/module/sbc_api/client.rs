use anyhow::{Context, Result, anyhow};
use ntrip_common::StationCode;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

use super::types::{LoginResponse, Site, SitesResponse, site_status};
use crate::config::ApiConfig;
use crate::error::PipelineError;

const AUTH_HEADER: &str = "X-SBC-Auth";
const TOKEN_HEADERS: [&str; 3] = ["x-sbc-auth", "token", "authorization"];

pub struct SbcApiClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl SbcApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    /// Log in and return the session token. A rejected login is retried once
    /// with the capitalised field names older controllers expect.
    pub async fn login(&self) -> Result<String> {
        let current = json!({ "username": self.username, "password": self.password });
        let (status, token) = self.login_attempt(&current).await?;
        if let Some(token) = token {
            return Ok(token);
        }

        if status != StatusCode::OK {
            warn!("Login rejected (status {}), retrying with legacy payload", status);
            let legacy = json!({ "Username": self.username, "Password": self.password });
            let (status, token) = self.login_attempt(&legacy).await?;
            return token.ok_or_else(|| anyhow!("SBC login failed with status {}", status));
        }

        Err(anyhow!("SBC login succeeded but no session token was returned"))
    }

    async fn login_attempt(&self, payload: &serde_json::Value) -> Result<(StatusCode, Option<String>)> {
        let url = format!("{}/login", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("Failed to send login request to {}", url))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Ok((status, None));
        }

        let headers = response.headers().clone();
        let body = response.text().await.context("Failed to read login response")?;
        let token = LoginResponse::parse(&body)
            .and_then(|login| login.token())
            .or_else(|| token_from_headers(&headers));
        Ok((status, token))
    }

    pub async fn fetch_sites(&self, token: &str) -> Result<Vec<Site>> {
        let url = format!("{}/sites", self.base_url);
        let response = self
            .client
            .get(&url)
            .header(AUTH_HEADER, token)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", url))?;

        if !response.status().is_success() {
            return Err(anyhow!("Failed to retrieve sites (status {})", response.status()));
        }

        let sites: SitesResponse = response
            .json()
            .await
            .context("Failed to parse sites response")?;
        Ok(sites.into_sites())
    }

    /// Login plus site query, resolved to station code -> online.
    pub async fn site_status(&self) -> Result<BTreeMap<StationCode, bool>> {
        info!("Connecting to SBC API ({})", self.base_url);
        let token = self.login().await?;
        let sites = self.fetch_sites(&token).await?;
        if sites.is_empty() {
            return Err(PipelineError::NoSitesReturned.into());
        }
        info!("Retrieved {} sites from SBC API", sites.len());
        Ok(site_status(&sites))
    }
}

fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    TOKEN_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().trim_matches('"').to_string())
            .filter(|value| !value.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Read one HTTP request (head plus Content-Length body).
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data).into_owned();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let length = text[..head_end]
                    .lines()
                    .find_map(|l| {
                        let l = l.to_ascii_lowercase();
                        l.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if data.len() >= head_end + 4 + length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&data).into_owned()
    }

    fn http_response(status: &str, extra_headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n{}",
            status,
            body.len(),
            extra_headers,
            body
        )
    }

    /// Fake controller: only the legacy payload logs in, the token arrives
    /// as a header, and sites are wrapped.
    async fn fake_controller(listener: TcpListener) -> Vec<String> {
        let mut requests = Vec::new();
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let reply = if request.starts_with("POST /api/login") && request.contains("\"Username\"") {
                http_response("200 OK", "X-SBC-Auth: tok-42\r\n", "")
            } else if request.starts_with("POST /api/login") {
                http_response("401 Unauthorized", "", r#"{"error": "bad payload"}"#)
            } else if request.starts_with("GET /api/sites") && request.contains("tok-42") {
                http_response(
                    "200 OK",
                    "",
                    r#"{"sites": [{"siteCode": "AUCK", "connected": true, "receivingData": true}]}"#,
                )
            } else {
                http_response("403 Forbidden", "", "")
            };
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            let done = request.starts_with("GET /api/sites");
            requests.push(request);
            if done {
                return requests;
            }
        }
    }

    fn config(port: u16) -> ApiConfig {
        ApiConfig {
            base_url: format!("http://127.0.0.1:{}/api/", port),
            username: "Admin".into(),
            password: "secret".into(),
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_legacy_login_and_header_token() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(fake_controller(listener));

        let client = SbcApiClient::new(&config(port)).unwrap();
        let status = client.site_status().await.unwrap();
        assert_eq!(status.len(), 1);
        assert!(status[&StationCode::parse("AUCK").unwrap()]);

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].contains("\"username\""));
        assert!(requests[1].contains("\"Username\""));
        assert!(requests[2].to_ascii_lowercase().contains("x-sbc-auth: tok-42"));
    }

    #[test]
    fn test_token_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(token_from_headers(&headers), None);
        headers.insert("token", "\"abc\"".parse().unwrap());
        assert_eq!(token_from_headers(&headers).as_deref(), Some("abc"));
    }
}
