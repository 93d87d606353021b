//! # Publisher Module
//!
//! Delivers records to the remote time-series collector over HTTP.
//!
//! This module handles:
//! - Building the write URL from the configured organization and bucket
//! - Token authentication and content headers
//! - Short timeouts for single records, long timeouts for compressed batches
//! - Reporting every failure as an error value, never panicking
//!
//! The publisher keeps no state between attempts; retry bookkeeping lives in
//! the offline queue.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, Url};
use serde::de::Error;
use std::time::Duration;
use tracing::debug;

use crate::config::{CollectorConfig, TimingConfig};
use crate::error::{Result, UplinkError};

/// Content type of line protocol bodies
pub const LINE_PROTOCOL_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Codec named in the `Content-Encoding` header of batches
pub const BATCH_ENCODING: &str = "gzip";

/// Write endpoint path on the collector
const WRITE_PATH: &str = "api/v2/write";

/// Timestamp precision of published records
const PRECISION: &str = "s";

/// Delivery of records to the collector
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one line protocol record
    async fn send(&self, record: &str) -> Result<()>;

    /// Send one gzip-compressed batch of newline-terminated records
    async fn send_batch(&self, body: Bytes) -> Result<()>;
}

/// Connect and total timeouts of one request class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub total: Duration,
}

impl Timeouts {
    /// Timeouts for single records, sized to the publish cadence
    #[must_use]
    pub fn for_records(timing: &TimingConfig) -> Self {
        Self {
            connect: Duration::from_millis(timing.send_connect_timeout_ms),
            total: Duration::from_millis(timing.send_timeout_ms),
        }
    }

    /// Timeouts for bulk catch-up batches
    #[must_use]
    pub fn for_batches(timing: &TimingConfig) -> Self {
        Self {
            connect: Duration::from_millis(timing.batch_connect_timeout_ms),
            total: Duration::from_millis(timing.batch_timeout_ms),
        }
    }

    fn client(&self) -> Result<Client> {
        Client::builder()
            .connect_timeout(self.connect)
            .timeout(self.total)
            .build()
            .map_err(|e| UplinkError::Transport(format!("Failed to build HTTP client: {}", e)))
    }
}

/// HTTP publisher for the collector's write API
pub struct HttpPublisher {
    write_url: Url,
    authorization: String,
    record_client: Client,
    batch_client: Client,
}

impl std::fmt::Debug for HttpPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPublisher")
            .field("write_url", &self.write_url.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpPublisher {
    /// Create a publisher for the configured collector
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the collector URL does not parse,
    /// or a transport error if an HTTP client cannot be built.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use telemetry_uplink::config::{CollectorConfig, TimingConfig};
    /// use telemetry_uplink::publisher::{HttpPublisher, Timeouts};
    ///
    /// let collector = CollectorConfig {
    ///     url: "http://10.0.0.5:8086".to_string(),
    ///     org: "lab".to_string(),
    ///     bucket: "boat".to_string(),
    ///     token: "secret".to_string(),
    /// };
    /// let timing = TimingConfig::default();
    /// let publisher = HttpPublisher::new(
    ///     &collector,
    ///     Timeouts::for_records(&timing),
    ///     Timeouts::for_batches(&timing),
    /// )?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn new(collector: &CollectorConfig, records: Timeouts, batches: Timeouts) -> Result<Self> {
        Ok(Self {
            write_url: write_url(collector)?,
            authorization: format!("Token {}", collector.token),
            record_client: records.client()?,
            batch_client: batches.client()?,
        })
    }

    /// Full write URL including query parameters
    pub fn write_url(&self) -> &Url {
        &self.write_url
    }

    async fn post(&self, client: &Client, body: Bytes, encoding: Option<&str>) -> Result<()> {
        let mut request = client
            .post(self.write_url.clone())
            .header(AUTHORIZATION, &self.authorization)
            .header(CONTENT_TYPE, LINE_PROTOCOL_CONTENT_TYPE);
        if let Some(encoding) = encoding {
            request = request.header(CONTENT_ENCODING, encoding);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| UplinkError::Transport(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UplinkError::Transport(format!("Collector returned {}", status)));
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for HttpPublisher {
    async fn send(&self, record: &str) -> Result<()> {
        self.post(&self.record_client, Bytes::copy_from_slice(record.as_bytes()), None)
            .await?;
        debug!("Sent record ({} bytes)", record.len());
        Ok(())
    }

    async fn send_batch(&self, body: Bytes) -> Result<()> {
        let size = body.len();
        self.post(&self.batch_client, body, Some(BATCH_ENCODING)).await?;
        debug!("Sent compressed batch ({} bytes)", size);
        Ok(())
    }
}

/// Build `<url>/api/v2/write?org=..&bucket=..&precision=s`
fn write_url(collector: &CollectorConfig) -> Result<Url> {
    let base = format!("{}/{}", collector.url.trim_end_matches('/'), WRITE_PATH);
    let mut url = Url::parse(&base).map_err(|e| {
        UplinkError::Config(toml::de::Error::custom(format!(
            "invalid collector url {:?}: {}",
            collector.url, e
        )))
    })?;

    url.query_pairs_mut()
        .append_pair("org", &collector.org)
        .append_pair("bucket", &collector.bucket)
        .append_pair("precision", PRECISION);

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{Read, Write};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Request as seen by the loopback collector
    struct CapturedRequest {
        head: String,
        body: Vec<u8>,
    }

    impl CapturedRequest {
        fn header(&self, name: &str) -> Option<String> {
            let prefix = format!("{}:", name.to_ascii_lowercase());
            self.head.lines().find_map(|line| {
                line.to_ascii_lowercase()
                    .starts_with(&prefix)
                    .then(|| line[prefix.len()..].trim().to_string())
            })
        }
    }

    fn collector(url: &str) -> CollectorConfig {
        CollectorConfig {
            url: url.to_string(),
            org: "lab".to_string(),
            bucket: "boat".to_string(),
            token: "secret-token".to_string(),
        }
    }

    fn quick() -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(500),
            total: Duration::from_millis(1000),
        }
    }

    fn header_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n")
    }

    /// Accept one request, answer with `status` and return what was received
    async fn serve_once(status: &'static str) -> (String, JoinHandle<CapturedRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];

            let (head, body_start, body_len) = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed before sending headers");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(end) = header_end(&buf) {
                    let head = String::from_utf8_lossy(&buf[..end]).to_string();
                    let body_len = head
                        .lines()
                        .find_map(|l| {
                            let l = l.to_ascii_lowercase();
                            l.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    break (head, end + 4, body_len);
                }
            };
            while buf.len() < body_start + body_len {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed before sending body");
                buf.extend_from_slice(&chunk[..n]);
            }

            let response = format!("HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status);
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();

            CapturedRequest {
                head,
                body: buf[body_start..body_start + body_len].to_vec(),
            }
        });

        (format!("http://{}", addr), handle)
    }

    fn gzip(data: &[u8]) -> Bytes {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    #[test]
    fn test_write_url_carries_org_bucket_and_precision() {
        let url = write_url(&collector("http://10.0.0.5:8086/")).unwrap();
        assert_eq!(
            url.as_str(),
            "http://10.0.0.5:8086/api/v2/write?org=lab&bucket=boat&precision=s"
        );
    }

    #[test]
    fn test_write_url_escapes_query_values() {
        let mut config = collector("https://collector.example");
        config.org = "my org".to_string();
        let url = write_url(&config).unwrap();
        assert!(url.as_str().contains("org=my+org"));
    }

    #[test]
    fn test_write_url_rejects_garbage() {
        assert!(matches!(write_url(&collector("not a url")), Err(UplinkError::Config(_))));
    }

    #[test]
    fn test_timeouts_from_timing() {
        let timing = TimingConfig::default();
        assert_eq!(Timeouts::for_records(&timing).connect, Duration::from_secs(2));
        assert_eq!(Timeouts::for_records(&timing).total, Duration::from_secs(5));
        assert_eq!(Timeouts::for_batches(&timing).connect, Duration::from_secs(10));
        assert_eq!(Timeouts::for_batches(&timing).total, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_send_posts_record_with_headers() {
        let (url, server) = serve_once("204 No Content").await;
        let publisher = HttpPublisher::new(&collector(&url), quick(), quick()).unwrap();

        publisher.send("measurements x=1.000000 1").await.unwrap();

        let request = server.await.unwrap();
        assert!(request.head.starts_with("POST /api/v2/write?org=lab&bucket=boat&precision=s HTTP/1.1"));
        assert_eq!(request.header("authorization").as_deref(), Some("Token secret-token"));
        assert_eq!(request.header("content-type").as_deref(), Some(LINE_PROTOCOL_CONTENT_TYPE));
        assert_eq!(request.header("content-encoding"), None);
        assert_eq!(request.body, b"measurements x=1.000000 1");
    }

    #[tokio::test]
    async fn test_send_batch_names_codec() {
        let (url, server) = serve_once("204 No Content").await;
        let publisher = HttpPublisher::new(&collector(&url), quick(), quick()).unwrap();
        let lines = b"m x=1.000000 1\nm x=2.000000 2\n";

        publisher.send_batch(gzip(lines)).await.unwrap();

        let request = server.await.unwrap();
        assert_eq!(request.header("content-encoding").as_deref(), Some("gzip"));

        let mut decoded = Vec::new();
        GzDecoder::new(&request.body[..]).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, lines);
    }

    #[tokio::test]
    async fn test_error_status_is_failure() {
        let (url, server) = serve_once("500 Internal Server Error").await;
        let publisher = HttpPublisher::new(&collector(&url), quick(), quick()).unwrap();

        let result = publisher.send("m x=1.000000 1").await;
        assert!(matches!(result, Err(UplinkError::Transport(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_collector_is_failure() {
        // Grab a free port, then close it so nothing is listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let publisher = HttpPublisher::new(&collector(&format!("http://{}", addr)), quick(), quick()).unwrap();
        assert!(publisher.send("m x=1.000000 1").await.is_err());
        assert!(publisher.send_batch(gzip(b"m x=1.000000 1\n")).await.is_err());
    }

    #[tokio::test]
    async fn test_silent_collector_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold the connection without ever answering
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(3)).await;
            drop(socket);
        });

        let short = Timeouts {
            connect: Duration::from_millis(200),
            total: Duration::from_millis(300),
        };
        let publisher = HttpPublisher::new(&collector(&format!("http://{}", addr)), short, short).unwrap();

        let started = std::time::Instant::now();
        assert!(publisher.send("m x=1.000000 1").await.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
        server.abort();
    }

    #[tokio::test]
    async fn test_rejected_batch_is_failure() {
        let (url, server) = serve_once("400 Bad Request").await;
        let publisher = HttpPublisher::new(&collector(&url), quick(), quick()).unwrap();

        let result = publisher.send_batch(gzip(b"m x=1.000000 1\n")).await;
        match result {
            Err(UplinkError::Transport(message)) => assert!(message.contains("400")),
            other => panic!("expected transport error, got {:?}", other),
        }

        let request = server.await.unwrap();
        assert_eq!(request.header("content-encoding").as_deref(), Some("gzip"));
    }
}
