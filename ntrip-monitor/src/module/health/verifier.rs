//! Per-station stream verification
//!
//! Opens `<CODE><suffix>` on the station's primary port, counts valid RTCM
//! frames for a fixed window and records the verdict in `data_verified`.
//! Stations are checked one at a time with a cooldown in between so the
//! caster never sees a burst of stream logins.

use ntrip_common::{StationCode, StationMetadataMap};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, warn};

use super::chunked::ChunkedDecoder;
use super::rtcm::RtcmFramer;
use crate::error::FetchError;
use crate::module::sourcetable::client::open_request;
use crate::module::sourcetable::{CasterEndpoint, ResponseStatus};

const READ_CHUNK: usize = 4096;
const MAX_HEAD_LEN: usize = 8192;

#[derive(Debug, Clone)]
pub struct HealthPolicy {
    /// Appended to the station code to form the checked mountpoint
    pub mount_suffix: String,
    pub window: Duration,
    /// Verified iff strictly more frames than this arrive within the window
    pub min_frames: u32,
    pub cooldown: Duration,
}

impl HealthPolicy {
    pub fn mountpoint(&self, code: &StationCode) -> String {
        format!("{}{}", code, self.mount_suffix)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCount {
    pub frames: u32,
    pub decode_errors: u32,
    pub bytes: usize,
    /// Body bytes passed over while looking for a frame preamble
    pub skipped_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub code: StationCode,
    pub port: u16,
    pub count: FrameCount,
    pub verified: bool,
    /// Set when the stream could not be opened or was refused
    pub error: Option<String>,
}

/// Transfer framing announced by the response head
enum Body {
    Raw,
    Chunked(ChunkedDecoder),
}

struct FrameCounter {
    body: Body,
    framer: RtcmFramer,
    count: FrameCount,
    scratch: Vec<u8>,
}

impl FrameCounter {
    fn new(body: Body) -> Self {
        Self {
            body,
            framer: RtcmFramer::new(),
            count: FrameCount::default(),
            scratch: Vec::new(),
        }
    }

    fn feed(&mut self, data: &[u8]) -> Result<(), FetchError> {
        self.count.bytes += data.len();
        match &mut self.body {
            Body::Raw => self.framer.push(data),
            Body::Chunked(decoder) => {
                self.scratch.clear();
                decoder
                    .decode(data, &mut self.scratch)
                    .map_err(|e| FetchError::Rejected(e.to_string()))?;
                self.framer.push(&self.scratch);
            }
        }

        while let Some(frame) = self.framer.next_frame() {
            match frame {
                Ok(frame) => {
                    self.count.frames += 1;
                    debug!("RTCM {} ({} bytes)", frame.message_type, frame.payload.len());
                }
                Err(e) => {
                    self.count.decode_errors += 1;
                    debug!("Skipping bad frame: {}", e);
                }
            }
        }
        self.count.skipped_bytes = self.framer.skipped_bytes();
        Ok(())
    }

    /// A chunked body ended with its terminal chunk
    fn body_finished(&self) -> bool {
        match &self.body {
            Body::Raw => false,
            Body::Chunked(decoder) => decoder.is_done(),
        }
    }
}

/// Resolve the response head in `buf`. Returns the body framing and where
/// the body starts, or `None` while the head is still incomplete.
fn parse_head(buf: &[u8]) -> Result<Option<(Body, usize)>, FetchError> {
    let Some(line_end) = find(buf, b"\r\n") else {
        return Ok(None);
    };
    let status_line = String::from_utf8_lossy(&buf[..line_end]).into_owned();

    match ResponseStatus::parse(&status_line) {
        // NTRIP 1: stream follows the status line directly
        ResponseStatus::Icy => Ok(Some((Body::Raw, line_end + 2))),
        ResponseStatus::Http(200) => {
            let Some(head_end) = find(buf, b"\r\n\r\n") else {
                return Ok(None);
            };
            let headers = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
            let chunked = headers
                .lines()
                .any(|line| line.starts_with("transfer-encoding:") && line.contains("chunked"));
            let body = if chunked {
                Body::Chunked(ChunkedDecoder::new())
            } else {
                Body::Raw
            };
            Ok(Some((body, head_end + 4)))
        }
        // a source table in reply to a stream request means unknown mountpoint
        ResponseStatus::SourceTable => Err(FetchError::Rejected("mountpoint not found".into())),
        _ => Err(FetchError::Rejected(status_line.trim().to_string())),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read a stream response for at most `window`, counting valid frames.
/// Stops early once `stop_after` frames were seen. Silence, EOF and
/// window expiry all end the count normally.
pub async fn count_frames<R>(
    mut reader: R,
    window: Duration,
    stop_after: u32,
) -> Result<FrameCount, FetchError>
where
    R: AsyncRead + Unpin,
{
    let deadline = Instant::now() + window;
    let mut buf = [0u8; READ_CHUNK];
    let mut head = Vec::new();
    let mut counter: Option<FrameCounter> = None;

    loop {
        let n = match timeout_at(deadline, reader.read(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => break,
        };
        if n == 0 {
            break;
        }

        match counter.as_mut() {
            Some(counter) => counter.feed(&buf[..n])?,
            None => {
                head.extend_from_slice(&buf[..n]);
                if let Some((body, body_start)) = parse_head(&head)? {
                    let mut fresh = FrameCounter::new(body);
                    fresh.feed(&head[body_start..])?;
                    counter = Some(fresh);
                } else if head.len() > MAX_HEAD_LEN {
                    return Err(FetchError::Rejected("response head too long".into()));
                }
            }
        }

        if counter
            .as_ref()
            .is_some_and(|c| c.count.frames >= stop_after || c.body_finished())
        {
            break;
        }
    }

    Ok(counter.map(|c| c.count).unwrap_or_default())
}

pub struct StreamHealthVerifier {
    endpoint: CasterEndpoint,
    policy: HealthPolicy,
}

impl StreamHealthVerifier {
    pub fn new(endpoint: CasterEndpoint, policy: HealthPolicy) -> Self {
        Self { endpoint, policy }
    }

    pub async fn check_station(&self, code: &StationCode, port: u16) -> HealthCheck {
        let mount = self.policy.mountpoint(code);
        let stop_after = self.policy.min_frames.saturating_add(1);

        let result = match open_request(&self.endpoint, port, &mount).await {
            Ok(stream) => count_frames(stream, self.policy.window, stop_after).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(count) => {
                let verified = count.frames > self.policy.min_frames;
                debug!(
                    "{} on port {}: {} frames, {} decode errors, {} of {} bytes skipped",
                    mount, port, count.frames, count.decode_errors, count.skipped_bytes, count.bytes
                );
                HealthCheck {
                    code: code.clone(),
                    port,
                    count,
                    verified,
                    error: None,
                }
            }
            Err(e) => {
                warn!("{} on port {}: {}", mount, port, e);
                HealthCheck {
                    code: code.clone(),
                    port,
                    count: FrameCount::default(),
                    verified: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Check every Online station that has a primary port and record the
    /// verdict. Status, ports and last-seen are left untouched.
    pub async fn verify_all(&self, stations: &mut StationMetadataMap) -> Vec<HealthCheck> {
        let targets: Vec<(StationCode, u16)> = stations
            .iter()
            .filter(|(_, meta)| meta.is_online())
            .filter_map(|(code, meta)| meta.port.map(|port| (code.clone(), port)))
            .collect();

        info!("Verifying data flow for {} online stations", targets.len());

        let mut checks = Vec::with_capacity(targets.len());
        for (index, (code, port)) in targets.into_iter().enumerate() {
            if index > 0 {
                sleep(self.policy.cooldown).await;
            }
            let check = self.check_station(&code, port).await;
            if let Some(meta) = stations.get_mut(&code) {
                meta.data_verified = Some(check.verified);
            }
            checks.push(check);
        }

        let verified = checks.iter().filter(|c| c.verified).count();
        info!("Verification complete: {}/{} streams verified", verified, checks.len());
        checks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::health::rtcm::encode_frame;
    use ntrip_common::{LastSeen, StationMetadata, StationStatus};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn frames(n: usize) -> Vec<u8> {
        (0..n)
            .flat_map(|i| encode_frame(&[0x43, 0x50, i as u8, 0x11, 0x22]))
            .collect()
    }

    fn policy(window_ms: u64) -> HealthPolicy {
        HealthPolicy {
            mount_suffix: "singleADV4".into(),
            window: Duration::from_millis(window_ms),
            min_frames: 5,
            cooldown: Duration::from_millis(10),
        }
    }

    fn endpoint() -> CasterEndpoint {
        CasterEndpoint {
            host: "127.0.0.1".into(),
            user: "user".into(),
            password: "pass".into(),
            user_agent: "NTRIP test".into(),
            timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(5),
        }
    }

    /// Accept one connection per reply, send it and hold the socket open
    /// briefly so the verifier's window decides the outcome.
    async fn serve(listener: TcpListener, replies: Vec<Vec<u8>>) -> Vec<String> {
        let mut requests = Vec::new();
        for reply in replies {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 1024];
            let n = socket.read(&mut request).await.unwrap();
            requests.push(String::from_utf8_lossy(&request[..n]).into_owned());
            socket.write_all(&reply).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        requests
    }

    #[tokio::test]
    async fn test_count_frames_icy_stream() {
        let mut reply = b"ICY 200 OK\r\n".to_vec();
        reply.extend(frames(6));
        let count = count_frames(&reply[..], Duration::from_secs(1), 100).await.unwrap();
        assert_eq!(count.frames, 6);
        assert_eq!(count.decode_errors, 0);
    }

    #[tokio::test]
    async fn test_count_frames_chunked_stream() {
        let body = frames(7);
        let mut reply = b"HTTP/1.1 200 OK\r\nContent-Type: gnss/data\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        // chunk boundaries deliberately cut through frames
        for piece in body.chunks(9) {
            reply.extend(format!("{:x}\r\n", piece.len()).as_bytes());
            reply.extend(piece);
            reply.extend(b"\r\n");
        }
        reply.extend(b"0\r\n\r\n");

        let count = count_frames(&reply[..], Duration::from_secs(1), 100).await.unwrap();
        assert_eq!(count.frames, 7);
        assert_eq!(count.decode_errors, 0);
    }

    #[tokio::test]
    async fn test_count_frames_resyncs_after_garbage() {
        let mut reply = b"ICY 200 OK\r\n".to_vec();
        reply.extend(frames(2));
        reply.extend([0xD3, 0x00, 0x05, 0x01, 0x02, 0x03]);
        reply.extend(b"noise");
        reply.extend(frames(3));
        let count = count_frames(&reply[..], Duration::from_secs(1), 100).await.unwrap();
        assert_eq!(count.frames, 5);
    }

    #[tokio::test]
    async fn test_count_frames_rejected_status() {
        let reply = b"HTTP/1.1 401 Unauthorized\r\n\r\n".to_vec();
        let err = count_frames(&reply[..], Duration::from_secs(1), 100).await.unwrap_err();
        assert!(matches!(err, FetchError::Rejected(_)));

        let reply = b"SOURCETABLE 200 OK\r\n\r\nSTR;OTHER;;\r\n".to_vec();
        assert!(count_frames(&reply[..], Duration::from_secs(1), 100).await.is_err());
    }

    #[tokio::test]
    async fn test_count_frames_stops_at_window() {
        let (client, mut server) = tokio::io::duplex(1024);
        server.write_all(b"ICY 200 OK\r\n").await.unwrap();
        server.write_all(&frames(2)).await.unwrap();

        let started = Instant::now();
        let count = count_frames(client, Duration::from_millis(200), 100).await.unwrap();
        assert_eq!(count.frames, 2);
        assert!(started.elapsed() >= Duration::from_millis(200));
        drop(server);
    }

    #[tokio::test]
    async fn test_verify_all_annotates_online_stations_only() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut healthy = b"ICY 200 OK\r\n".to_vec();
        healthy.extend(frames(6));
        let mut sparse = b"ICY 200 OK\r\n".to_vec();
        sparse.extend(frames(5));
        let server = tokio::spawn(serve(listener, vec![healthy, sparse]));

        let online = |port| StationMetadata {
            status: StationStatus::Online,
            port: Some(port),
            network_port: None,
            last_seen: LastSeen::parse("2025-07-25 14:03"),
            data_verified: None,
        };
        let mut stations = StationMetadataMap::new();
        stations.insert(StationCode::parse("AUCK").unwrap(), online(port));
        stations.insert(StationCode::parse("BLUF").unwrap(), online(port));
        stations.insert(
            StationCode::parse("CHTI").unwrap(),
            StationMetadata {
                status: StationStatus::Offline,
                port: Some(port),
                ..StationMetadata::default()
            },
        );
        stations.insert(
            StationCode::parse("DUNT").unwrap(),
            StationMetadata {
                port: None,
                ..online(port)
            },
        );
        let before = stations.clone();

        let verifier = StreamHealthVerifier::new(endpoint(), policy(300));
        let checks = verifier.verify_all(&mut stations).await;

        assert_eq!(checks.len(), 2);
        assert_eq!(stations[&StationCode::parse("AUCK").unwrap()].data_verified, Some(true));
        assert_eq!(stations[&StationCode::parse("BLUF").unwrap()].data_verified, Some(false));
        assert_eq!(stations[&StationCode::parse("CHTI").unwrap()].data_verified, None);
        assert_eq!(stations[&StationCode::parse("DUNT").unwrap()].data_verified, None);
        for (code, meta) in &stations {
            assert_eq!(meta.status, before[code].status);
            assert_eq!(meta.port, before[code].port);
        }

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("GET /AUCKsingleADV4 HTTP/1.1\r\n"));
        assert!(requests[1].starts_with("GET /BLUFsingleADV4 HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_unreachable_station_is_unverified() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let verifier = StreamHealthVerifier::new(endpoint(), policy(200));
        let check = verifier.check_station(&StationCode::parse("AUCK").unwrap(), port).await;
        assert!(!check.verified);
        assert!(check.error.is_some());
    }

    #[tokio::test]
    async fn test_silent_or_noisy_stream_is_unverified() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let silent = b"ICY 200 OK\r\n".to_vec();
        let mut noisy = b"ICY 200 OK\r\n".to_vec();
        noisy.extend(b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n");
        noisy.extend([0xD3, 0x00, 0x04, 0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x00]);
        let server = tokio::spawn(serve(listener, vec![silent, noisy]));

        let verifier = StreamHealthVerifier::new(endpoint(), policy(200));
        let auck = StationCode::parse("AUCK").unwrap();

        let check = verifier.check_station(&auck, port).await;
        assert!(!check.verified);
        assert_eq!(check.count.frames, 0);
        assert!(check.error.is_none());

        let check = verifier.check_station(&auck, port).await;
        assert!(!check.verified);
        assert_eq!(check.count.frames, 0);
        assert_eq!(check.count.decode_errors, 1);
        assert!(check.count.skipped_bytes > 0);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_terminal_chunk_ends_count_early() {
        let mut reply = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        let body = frames(2);
        reply.extend(format!("{:x}\r\n", body.len()).as_bytes());
        reply.extend(&body);
        reply.extend(b"\r\n0\r\n\r\n");

        let (client, mut server) = tokio::io::duplex(4096);
        server.write_all(&reply).await.unwrap();

        let started = Instant::now();
        let count = count_frames(client, Duration::from_secs(5), 100).await.unwrap();
        assert_eq!(count.frames, 2);
        assert!(started.elapsed() < Duration::from_secs(1));
        drop(server);
    }
}
