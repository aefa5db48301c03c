//! HTTP/1.1 request codec for intercepted traffic
//!
//! Two pure functions, no I/O:
//! - [`parse_request`] splits a raw request buffer into start line, headers and body offset
//! - [`rebuild_request`] re-serializes a request with a substituted bearer token
//!
//! Parsing is tolerant: header lines without a colon are skipped. Rebuilding copies
//! header lines from the original buffer byte-for-byte, so nothing but the
//! `Authorization` header ever changes.

use std::collections::HashMap;
use std::ops::Range;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// One header line as it appeared on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderLine {
    /// Header name with original casing
    pub name: String,

    /// Trimmed header value
    pub value: String,

    /// Byte range of the full line (without CRLF) in the original buffer
    pub raw: Range<usize>,
}

/// Parsed HTTP/1.1 request head
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    /// HTTP method (GET, POST, CONNECT, ...)
    pub method: String,

    /// Request target (/path?query, or host:port for CONNECT)
    pub path: String,

    /// HTTP version (HTTP/1.1)
    pub version: String,

    /// Headers in wire order, case preserved
    pub headers: Vec<HeaderLine>,

    /// Lower-cased header name -> value, last occurrence wins
    pub header_map: HashMap<String, String>,

    /// Byte range of the start line in the original buffer
    pub start_line: Range<usize>,

    /// Offset of the first body byte
    pub body_offset: usize,
}

impl ParsedRequest {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_map
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Whether the request carried any `Authorization` header
    pub fn has_authorization(&self) -> bool {
        self.header_map.contains_key("authorization")
    }

    /// Bearer token from the `Authorization` header, if the scheme is Bearer
    pub fn bearer_token(&self) -> Option<&str> {
        let value = self.header("authorization")?;
        let (scheme, token) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let token = token.trim();
        (!token.is_empty()).then_some(token)
    }

    /// Declared `Content-Length`, if present and numeric
    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Whether the body uses chunked transfer coding
    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|te| te.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Whether the client asked to close the connection after this exchange
    pub fn wants_close(&self) -> bool {
        let close_requested = self
            .header("connection")
            .map(|c| c.to_ascii_lowercase().contains("close"))
            .unwrap_or(false);
        close_requested || self.version.eq_ignore_ascii_case("HTTP/1.0")
    }

    /// Whether the client waits for `100 Continue` before sending its body
    pub fn expects_continue(&self) -> bool {
        self.header("expect")
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
    }
}

/// Parse an HTTP/1.1 request head from `data`
///
/// Returns `None` when the blank line ending the header section is missing or the
/// start line does not have three parts. Never panics on arbitrary input.
pub fn parse_request(data: &[u8]) -> Option<ParsedRequest> {
    let header_end = find_header_end(data)?;
    let body_offset = header_end + HEADER_TERMINATOR.len();

    let mut lines = line_ranges(data, header_end);
    let start_line = lines.next()?;

    let start_text = String::from_utf8_lossy(&data[start_line.clone()]);
    let mut parts = start_text.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let version = parts.next()?.to_string();
    if parts.next().is_some() {
        return None;
    }

    let mut headers = Vec::new();
    let mut header_map = HashMap::new();

    for range in lines {
        let line = &data[range.clone()];
        // Tolerant parsing: lines without a colon are dropped
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };

        let name = String::from_utf8_lossy(&line[..colon]).trim().to_string();
        if name.is_empty() {
            continue;
        }
        let value = String::from_utf8_lossy(&line[colon + 1..])
            .trim()
            .to_string();

        header_map.insert(name.to_ascii_lowercase(), value.clone());
        headers.push(HeaderLine {
            name,
            value,
            raw: range,
        });
    }

    Some(ParsedRequest {
        method,
        path,
        version,
        headers,
        header_map,
        start_line,
        body_offset,
    })
}

/// Rebuild `original` with every `Authorization` header replaced by one carrying `new_token`
///
/// The replacement is only appended when the original request had an `Authorization`
/// header; anonymous requests stay anonymous. Start line, other headers and the body
/// are copied verbatim from `original`.
pub fn rebuild_request(parsed: &ParsedRequest, original: &[u8], new_token: &str) -> Vec<u8> {
    let body = original.get(parsed.body_offset..).unwrap_or_default();
    let mut out = Vec::with_capacity(original.len() + new_token.len());

    out.extend_from_slice(&original[parsed.start_line.clone()]);
    out.extend_from_slice(b"\r\n");

    for header in &parsed.headers {
        if header.name.eq_ignore_ascii_case("authorization") {
            continue;
        }
        out.extend_from_slice(&original[header.raw.clone()]);
        out.extend_from_slice(b"\r\n");
    }

    if parsed.has_authorization() {
        out.extend_from_slice(b"Authorization: Bearer ");
        out.extend_from_slice(new_token.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// Copy of the head in `original` without any header named `name`
pub fn strip_header(parsed: &ParsedRequest, original: &[u8], name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(parsed.body_offset);
    out.extend_from_slice(&original[parsed.start_line.clone()]);
    out.extend_from_slice(b"\r\n");
    for header in parsed.headers.iter().filter(|h| !h.name.eq_ignore_ascii_case(name)) {
        out.extend_from_slice(&original[header.raw.clone()]);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Find the end of HTTP headers (position before \r\n\r\n)
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

/// CRLF-separated line ranges in `data[..end]`
fn line_ranges(data: &[u8], end: usize) -> impl Iterator<Item = Range<usize>> + '_ {
    let mut cursor = 0;
    std::iter::from_fn(move || {
        if cursor > end {
            return None;
        }
        let rest = &data[cursor..end];
        let line_end = rest
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|p| cursor + p)
            .unwrap_or(end);
        let range = cursor..line_end;
        cursor = line_end + 2;
        Some(range)
    })
}
