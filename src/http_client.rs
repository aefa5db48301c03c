use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::mitm::http_parser::{find_header_end, ParsedRequest};
use crate::mitm::tls_config::{SniUtils, UpstreamTlsConfig};

const MAX_HEADER_SIZE: usize = 65536; // 64KB max head
const MAX_RESPONSE_HEADERS: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Read timeout")]
    ReadTimeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Headers too large (> 64KB)")]
    HeadersTooLarge,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid message framing: {0}")]
    InvalidFraming(String),

    #[error("Body exceeds {0} bytes")]
    BodyTooLarge(u64),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl From<httparse::Error> for HttpClientError {
    fn from(e: httparse::Error) -> Self {
        HttpClientError::InvalidResponse(e.to_string())
    }
}

/// Per-hop I/O timeouts
#[derive(Debug, Clone, Copy)]
pub struct HopTimeouts {
    pub connect: Duration,
    /// Idle time allowed between reads
    pub read: Duration,
    pub write: Duration,
}

impl Default for HopTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(300),
            write: Duration::from_secs(30),
        }
    }
}

/// Byte stream to an upstream server
pub trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

/// Opens a fresh connection to the real upstream for each attempt
#[async_trait::async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn UpstreamIo>, HttpClientError>;
}

pub type SharedUpstreamConnector = Arc<dyn UpstreamConnector>;

/// TCP + verified TLS connector used in production
#[derive(Clone)]
pub struct TlsUpstreamConnector {
    connector: TlsConnector,
    connect_timeout: Duration,
}

impl std::fmt::Debug for TlsUpstreamConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsUpstreamConnector")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl TlsUpstreamConnector {
    pub fn new(tls: &UpstreamTlsConfig, connect_timeout: Duration) -> Self {
        Self {
            connector: TlsConnector::from(tls.client_config()),
            connect_timeout,
        }
    }
}

#[async_trait::async_trait]
impl UpstreamConnector for TlsUpstreamConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn UpstreamIo>, HttpClientError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| HttpClientError::ConnectionTimeout)?
            .map_err(HttpClientError::IoError)?;
        stream.set_nodelay(true)?;

        let server_name = SniUtils::parse_server_name(host)
            .map_err(|e| HttpClientError::TlsError(e.to_string()))?;

        let tls_stream = timeout(self.connect_timeout, self.connector.connect(server_name, stream))
            .await
            .map_err(|_| HttpClientError::ConnectionTimeout)?
            .map_err(|e| HttpClientError::TlsError(e.to_string()))?;

        debug!(target_host = %host, port = port, "Upstream TLS connection established");
        Ok(Box::new(tls_stream))
    }
}

/// Read one message head, up to and including the blank line
///
/// Bytes after the head stay buffered in `reader`. Returns `None` when the peer closed
/// the connection before sending anything.
pub async fn read_message_head<R>(
    reader: &mut R,
    read_timeout: Duration,
) -> Result<Option<BytesMut>, HttpClientError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = BytesMut::with_capacity(4096);

    loop {
        let available = timeout(read_timeout, reader.fill_buf())
            .await
            .map_err(|_| HttpClientError::ReadTimeout)?
            .map_err(HttpClientError::IoError)?;

        if available.is_empty() {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(HttpClientError::InvalidResponse(
                "Connection closed mid-headers".to_string(),
            ));
        }

        // Terminator may straddle the previous read
        let search_from = head.len().saturating_sub(3);
        let previous_len = head.len();
        head.extend_from_slice(available);

        if let Some(pos) = find_header_end(&head[search_from..]) {
            let head_end = search_from + pos + 4;
            reader.consume(head_end - previous_len);
            head.truncate(head_end);
            return Ok(Some(head));
        }

        let consumed = available.len();
        reader.consume(consumed);

        if head.len() > MAX_HEADER_SIZE {
            return Err(HttpClientError::HeadersTooLarge);
        }
    }
}

/// How a message body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
    /// Body ends when the upstream closes the connection
    UntilClose,
}

/// Body framing of a client request
pub fn request_framing(request: &ParsedRequest) -> Result<BodyFraming, HttpClientError> {
    if request.is_chunked() {
        return Ok(BodyFraming::Chunked);
    }
    match request.header("content-length") {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(|n| if n == 0 { BodyFraming::None } else { BodyFraming::Length(n) })
            .map_err(|_| HttpClientError::InvalidFraming(format!("bad Content-Length: {}", value))),
        None => Ok(BodyFraming::None),
    }
}

/// How a response body is relayed to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Piped as it arrives, flushed after every write
    Stream,
    /// Read fully, then written in one go
    Buffer,
}

/// Parsed upstream response head
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    /// Header names lower-cased, in wire order
    pub headers: Vec<(String, String)>,
    /// Exact head bytes as received
    pub raw: BytesMut,
}

impl ResponseHead {
    pub fn parse(raw: BytesMut) -> Result<Self, HttpClientError> {
        let mut header_buf = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut response = httparse::Response::new(&mut header_buf);

        match response.parse(&raw)? {
            httparse::Status::Complete(_) => {}
            httparse::Status::Partial => {
                return Err(HttpClientError::InvalidResponse(
                    "Incomplete headers".to_string(),
                ));
            }
        }

        let status = response
            .code
            .ok_or_else(|| HttpClientError::InvalidResponse("Missing status code".to_string()))?;
        let reason = response.reason.unwrap_or("").to_string();
        let headers = response
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_ascii_lowercase(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect();

        Ok(Self {
            status,
            reason,
            headers,
            raw,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.header(name)
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    pub fn is_event_stream(&self) -> bool {
        self.header("content-type")
            .map(|ct| ct.to_ascii_lowercase().contains("text/event-stream"))
            .unwrap_or(false)
    }

    pub fn mode(&self) -> ResponseMode {
        if self.is_event_stream() {
            ResponseMode::Stream
        } else {
            ResponseMode::Buffer
        }
    }

    pub fn wants_close(&self) -> bool {
        self.header_has_token("connection", "close")
    }

    /// Body framing given the request method that produced this response
    pub fn framing(&self, request_method: &str) -> Result<BodyFraming, HttpClientError> {
        if request_method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return Ok(BodyFraming::None);
        }
        if self.header_has_token("transfer-encoding", "chunked") {
            return Ok(BodyFraming::Chunked);
        }
        match self.header("content-length") {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map(|n| if n == 0 { BodyFraming::None } else { BodyFraming::Length(n) })
                .map_err(|_| {
                    HttpClientError::InvalidResponse(format!("bad Content-Length: {}", value))
                }),
            None => Ok(BodyFraming::UntilClose),
        }
    }
}

/// Copy one framed body from `reader` to `writer` without altering its bytes
///
/// Chunked bodies are forwarded chunk by chunk, including sizes and trailers. With
/// `flush_each` every write is flushed immediately. Returns the bytes written.
pub async fn relay_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    framing: BodyFraming,
    timeouts: HopTimeouts,
    flush_each: bool,
) -> Result<u64, HttpClientError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    Relay {
        writer,
        timeouts,
        flush_each,
        written: 0,
        limit: None,
    }
    .run(reader, framing)
    .await
}

/// Read one framed body fully into memory (raw wire bytes)
pub async fn read_body<R>(
    reader: &mut R,
    framing: BodyFraming,
    timeouts: HopTimeouts,
) -> Result<Vec<u8>, HttpClientError>
where
    R: AsyncBufRead + Unpin,
{
    read_body_capped(reader, framing, timeouts, None).await
}

/// Like [`read_body`], failing with `BodyTooLarge` once the wire bytes exceed `limit`
pub async fn read_body_capped<R>(
    reader: &mut R,
    framing: BodyFraming,
    timeouts: HopTimeouts,
    limit: Option<u64>,
) -> Result<Vec<u8>, HttpClientError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    Relay {
        writer: &mut body,
        timeouts,
        flush_each: false,
        written: 0,
        limit,
    }
    .run(reader, framing)
    .await?;
    Ok(body)
}

struct Relay<'a, W> {
    writer: &'a mut W,
    timeouts: HopTimeouts,
    flush_each: bool,
    written: u64,
    limit: Option<u64>,
}

impl<W: AsyncWrite + Unpin> Relay<'_, W> {
    async fn run<R: AsyncBufRead + Unpin>(
        mut self,
        reader: &mut R,
        framing: BodyFraming,
    ) -> Result<u64, HttpClientError> {
        match framing {
            BodyFraming::None => {}
            BodyFraming::Length(n) => self.copy_exact(reader, n).await?,
            BodyFraming::Chunked => self.copy_chunked(reader).await?,
            BodyFraming::UntilClose => self.copy_until_eof(reader).await?,
        }

        timeout(self.timeouts.write, self.writer.flush())
            .await
            .map_err(|_| HttpClientError::WriteTimeout)??;
        Ok(self.written)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), HttpClientError> {
        if let Some(limit) = self.limit {
            if self.written.saturating_add(bytes.len() as u64) > limit {
                return Err(HttpClientError::BodyTooLarge(limit));
            }
        }
        timeout(self.timeouts.write, self.writer.write_all(bytes))
            .await
            .map_err(|_| HttpClientError::WriteTimeout)??;
        if self.flush_each {
            timeout(self.timeouts.write, self.writer.flush())
                .await
                .map_err(|_| HttpClientError::WriteTimeout)??;
        }
        self.written += bytes.len() as u64;
        Ok(())
    }

    async fn copy_exact<R: AsyncBufRead + Unpin>(
        &mut self,
        reader: &mut R,
        mut remaining: u64,
    ) -> Result<(), HttpClientError> {
        while remaining > 0 {
            let available = timeout(self.timeouts.read, reader.fill_buf())
                .await
                .map_err(|_| HttpClientError::ReadTimeout)??;
            if available.is_empty() {
                return Err(HttpClientError::InvalidResponse(format!(
                    "Premature EOF: {} body bytes missing",
                    remaining
                )));
            }
            let take = available.len().min(remaining as usize);
            self.write(&available[..take]).await?;
            reader.consume(take);
            remaining -= take as u64;
        }
        Ok(())
    }

    async fn copy_until_eof<R: AsyncBufRead + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> Result<(), HttpClientError> {
        loop {
            let available = timeout(self.timeouts.read, reader.fill_buf())
                .await
                .map_err(|_| HttpClientError::ReadTimeout)??;
            if available.is_empty() {
                return Ok(());
            }
            let take = available.len();
            self.write(available).await?;
            reader.consume(take);
        }
    }

    async fn read_line<R: AsyncBufRead + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> Result<Vec<u8>, HttpClientError> {
        let mut line = Vec::new();
        let n = timeout(self.timeouts.read, reader.read_until(b'\n', &mut line))
            .await
            .map_err(|_| HttpClientError::ReadTimeout)??;
        if n == 0 || !line.ends_with(b"\n") {
            return Err(HttpClientError::InvalidFraming(
                "Incomplete chunk line".to_string(),
            ));
        }
        if line.len() > MAX_HEADER_SIZE {
            return Err(HttpClientError::HeadersTooLarge);
        }
        Ok(line)
    }

    async fn copy_chunked<R: AsyncBufRead + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> Result<(), HttpClientError> {
        loop {
            let size_line = self.read_line(reader).await?;
            let chunk_size = parse_chunk_size(&size_line)?;
            self.write(&size_line).await?;

            if chunk_size == 0 {
                // Trailers, terminated by an empty line
                loop {
                    let line = self.read_line(reader).await?;
                    self.write(&line).await?;
                    if line == b"\r\n" || line == b"\n" {
                        return Ok(());
                    }
                }
            }

            // Chunk data plus its CRLF
            let framed = chunk_size.checked_add(2).ok_or_else(|| {
                HttpClientError::InvalidFraming(format!("Chunk size too large: {:x}", chunk_size))
            })?;
            self.copy_exact(reader, framed).await?;
        }
    }
}

/// Parse a chunk size line such as `1a;ext=value\r\n`
fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpClientError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| HttpClientError::InvalidFraming("Invalid chunk size encoding".to_string()))?;
    let size = text.split(';').next().unwrap_or(text).trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| HttpClientError::InvalidFraming(format!("Invalid chunk size hex: {}", size)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn head(raw: &str) -> ResponseHead {
        ResponseHead::parse(BytesMut::from(raw.as_bytes())).unwrap()
    }

    #[tokio::test]
    async fn test_read_message_head_leaves_body_buffered() {
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec();
        let mut reader = BufReader::with_capacity(7, &data[..]);

        let raw = read_message_head(&mut reader, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(raw.ends_with(b"\r\n\r\n"));

        let parsed = ResponseHead::parse(raw).unwrap();
        let framing = parsed.framing("POST").unwrap();
        assert_eq!(framing, BodyFraming::Length(5));

        let body = read_body(&mut reader, framing, HopTimeouts::default()).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn test_read_message_head_clean_close() {
        let mut reader = BufReader::new(&b""[..]);
        let head = read_message_head(&mut reader, Duration::from_secs(1)).await.unwrap();
        assert!(head.is_none());

        let mut reader = BufReader::new(&b"GET / HTTP/1.1\r\n"[..]);
        assert!(read_message_head(&mut reader, Duration::from_secs(1)).await.is_err());
    }

    #[test]
    fn test_response_framing_rules() {
        let h = head("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert_eq!(h.framing("GET").unwrap(), BodyFraming::Chunked);
        assert_eq!(h.framing("HEAD").unwrap(), BodyFraming::None);

        let h = head("HTTP/1.1 204 No Content\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(h.framing("GET").unwrap(), BodyFraming::None);

        let h = head("HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n");
        assert_eq!(h.framing("GET").unwrap(), BodyFraming::UntilClose);
        assert!(h.wants_close());

        let h = head("HTTP/1.1 200 OK\r\nContent-Length: nope\r\n\r\n");
        assert!(h.framing("GET").is_err());
    }

    #[test]
    fn test_event_stream_selects_stream_mode() {
        let h = head("HTTP/1.1 200 OK\r\nContent-Type: text/event-stream; charset=utf-8\r\n\r\n");
        assert_eq!(h.mode(), ResponseMode::Stream);

        let h = head("HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n");
        assert_eq!(h.mode(), ResponseMode::Buffer);
        assert_eq!(h.header("CONTENT-TYPE"), Some("application/json"));
    }

    #[tokio::test]
    async fn test_chunked_body_relayed_verbatim() {
        let wire = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: yes\r\n\r\nNEXT";
        let mut reader = BufReader::new(&wire[..]);

        let body = read_body(&mut reader, BodyFraming::Chunked, HopTimeouts::default())
            .await
            .unwrap();
        assert_eq!(body, &wire[..wire.len() - 4]);

        let mut rest = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut rest).await.unwrap();
        assert_eq!(rest, b"NEXT");
    }

    #[tokio::test]
    async fn test_short_body_is_an_error() {
        let mut reader = BufReader::new(&b"abc"[..]);
        let result = read_body(&mut reader, BodyFraming::Length(10), HopTimeouts::default()).await;
        assert!(matches!(result, Err(HttpClientError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_oversized_chunk_size_is_a_framing_error() {
        let mut reader = BufReader::new(&b"ffffffffffffffff\r\nabc"[..]);
        let result = read_body(&mut reader, BodyFraming::Chunked, HopTimeouts::default()).await;
        assert!(matches!(result, Err(HttpClientError::InvalidFraming(_))));
    }

    #[test]
    fn test_parse_chunk_size() {
        assert_eq!(parse_chunk_size(b"1a\r\n").unwrap(), 26);
        assert_eq!(parse_chunk_size(b"0;x=y\r\n").unwrap(), 0);
        assert!(parse_chunk_size(b"zz\r\n").is_err());
    }
}
