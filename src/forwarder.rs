//! Request forwarding on intercepted channels
//!
//! One [`Forwarder::forward`] call handles one logical request, which may span several
//! upstream attempts:
//!
//! - the caller's credential is classified once, on the first attempt
//! - each attempt opens a fresh upstream connection, dropped before any retry
//! - a 401 is retried once with the active credential (never in passthrough mode)
//! - a 429 triggers rotation, bounded by the configured retry count
//! - anything else is relayed, streamed for event streams and buffered otherwise

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::health::SharedProxyStats;
use crate::http_client::{
    read_body, read_body_capped, read_message_head, relay_body, request_framing, BodyFraming,
    HopTimeouts,
    HttpClientError, ResponseHead, ResponseMode, SharedUpstreamConnector, UpstreamIo,
};
use crate::mitm::http_parser::{parse_request, rebuild_request, strip_header, ParsedRequest};
use crate::rotation::{short_id, ActiveCredential, KeyStatus, SharedRotationDriver};

pub const DEFAULT_MAX_REQUEST_BODY: u64 = 32 * 1024 * 1024;

/// Forwarding limits
#[derive(Debug, Clone, Copy)]
pub struct ForwarderSettings {
    /// Upper bound on 429-driven rotations per request
    pub max_429_retries: u32,
    /// Pause before re-sending with a rotated credential
    pub retry_delay: Duration,
    /// Largest request body accepted from the client, in wire bytes
    pub max_request_body: u64,
    pub timeouts: HopTimeouts,
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            max_429_retries: 2,
            retry_delay: Duration::from_millis(500),
            max_request_body: DEFAULT_MAX_REQUEST_BODY,
            timeouts: HopTimeouts::default(),
        }
    }
}

/// Per-request retry bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryContext {
    pub retry_count: u32,
    /// Caller's own credential is forwarded unmodified
    pub use_passthrough: bool,
}

/// What to do with an upstream response, decided from its status alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    RetryWithActive,
    Rotate,
    Relay,
}

pub fn decide(status: u16, ctx: &RetryContext, max_429_retries: u32) -> Verdict {
    match status {
        401 if ctx.retry_count == 0 && !ctx.use_passthrough => Verdict::RetryWithActive,
        429 if ctx.retry_count < max_429_retries => Verdict::Rotate,
        _ => Verdict::Relay,
    }
}

/// How the caller's credential relates to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Token of a deliberately dead account: substitute the active key
    Tombstone,
    /// Token never seen before: forward it untouched
    Unknown,
    /// Registered key, or no bearer token at all: substitute the active key
    Known,
}

impl Classification {
    pub fn from_lookup(status: Option<KeyStatus>) -> Self {
        match status {
            Some(KeyStatus::Tombstone) => Classification::Tombstone,
            Some(_) => Classification::Known,
            None => Classification::Unknown,
        }
    }
}

/// Whether the client connection may carry another request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    KeepAlive,
    Close,
}

/// Request bytes about to go upstream and the key they carry
struct Outbound {
    bytes: Vec<u8>,
    key_id: Option<String>,
}

impl Outbound {
    fn with_credential(parsed: &ParsedRequest, original: &[u8], credential: &ActiveCredential) -> Self {
        Self {
            bytes: rebuild_request(parsed, original, credential.token.expose_secret()),
            key_id: parsed
                .has_authorization()
                .then(|| credential.key_id.clone()),
        }
    }
}

pub struct Forwarder {
    driver: SharedRotationDriver,
    connector: SharedUpstreamConnector,
    stats: SharedProxyStats,
    settings: ForwarderSettings,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("settings", &self.settings)
            .finish()
    }
}

impl Forwarder {
    pub fn new(
        driver: SharedRotationDriver,
        connector: SharedUpstreamConnector,
        stats: SharedProxyStats,
        settings: ForwarderSettings,
    ) -> Self {
        Self {
            driver,
            connector,
            stats,
            settings,
        }
    }

    pub fn settings(&self) -> &ForwarderSettings {
        &self.settings
    }

    /// Serve HTTP/1.1 requests from a decrypted client channel until it closes
    pub async fn serve_channel<S>(&self, stream: S, host: &str, port: u16) -> Result<(), HttpClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let timeouts = self.settings.timeouts;
        let mut client = BufReader::new(stream);

        loop {
            let head = match read_message_head(&mut client, timeouts.read).await {
                Ok(Some(head)) => head,
                Ok(None) => break,
                Err(HttpClientError::ReadTimeout) => {
                    debug!(target_host = %host, "Idle client channel timed out");
                    break;
                }
                Err(e) => return Err(e),
            };

            self.stats.record_request();

            let Some(parsed) = parse_request(&head) else {
                write_status(&mut client, 400, "Bad Request", timeouts).await?;
                break;
            };
            let framing = match request_framing(&parsed) {
                Ok(framing) => framing,
                Err(e) => {
                    debug!(target_host = %host, "Rejecting request: {}", e);
                    write_status(&mut client, 400, "Bad Request", timeouts).await?;
                    break;
                }
            };

            let limit = self.settings.max_request_body;
            if matches!(framing, BodyFraming::Length(n) if n > limit) {
                warn!(target_host = %host, limit, "Rejecting oversized request body");
                write_status(&mut client, 413, "Payload Too Large", timeouts).await?;
                break;
            }

            let mut request = if parsed.expects_continue() {
                write_continue(&mut client, timeouts).await?;
                strip_header(&parsed, &head, "expect")
            } else {
                head.to_vec()
            };
            match read_body_capped(&mut client, framing, timeouts, Some(limit)).await {
                Ok(body) => request.extend_from_slice(&body),
                Err(HttpClientError::BodyTooLarge(_)) => {
                    warn!(target_host = %host, limit, "Rejecting oversized request body");
                    write_status(&mut client, 413, "Payload Too Large", timeouts).await?;
                    break;
                }
                Err(e) => return Err(e),
            }

            let disposition = self.forward(&mut client, &request, host, port).await?;
            if disposition == Disposition::Close || parsed.wants_close() {
                break;
            }
        }

        let mut stream = client.into_inner();
        let _ = stream.shutdown().await;
        Ok(())
    }

    /// Drive one logical request to completion, writing the final response to `client`
    ///
    /// `request` holds the complete request as received (head and framed body).
    pub async fn forward<W>(
        &self,
        client: &mut W,
        request: &[u8],
        host: &str,
        port: u16,
    ) -> Result<Disposition, HttpClientError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let timeouts = self.settings.timeouts;

        let Some(parsed) = parse_request(request) else {
            write_status(client, 400, "Bad Request", timeouts).await?;
            return Ok(Disposition::Close);
        };

        let active = match self.driver.active_credential().await {
            Ok(active) => active,
            Err(e) => {
                warn!(target_host = %host, "No usable credential: {}", e);
                write_status(client, 502, "Bad Gateway", timeouts).await?;
                return Ok(Disposition::Close);
            }
        };

        let mut ctx = RetryContext::default();
        let mut outbound = self.classify_and_prepare(&parsed, request, &active, &mut ctx).await;

        loop {
            let attempt = self.attempt(host, port, &outbound.bytes, client).await;
            let (mut upstream, head) = match attempt {
                Ok(pair) => pair,
                Err(e) => {
                    self.stats.record_upstream_error();
                    warn!(target_host = %host, attempt = ctx.retry_count, "Upstream request failed: {}", e);
                    write_status(client, 502, "Bad Gateway", timeouts).await?;
                    return Ok(Disposition::Close);
                }
            };

            match decide(head.status, &ctx, self.settings.max_429_retries) {
                Verdict::RetryWithActive => {
                    drop(upstream);
                    let current = match self.driver.active_credential().await {
                        Ok(current) => current,
                        Err(e) => {
                            warn!("No usable credential for 401 retry: {}", e);
                            write_status(client, 502, "Bad Gateway", timeouts).await?;
                            return Ok(Disposition::Close);
                        }
                    };

                    info!(
                        key_id = %outbound.key_id.as_deref().map(short_id).unwrap_or("-"),
                        active = %short_id(&current.key_id),
                        "Upstream rejected credential, retrying with active key"
                    );
                    self.driver
                        .audit()
                        .record(
                            "auth_401_retry",
                            json!({
                                "key_id": outbound.key_id.as_deref().map(short_id),
                                "active_key_id": short_id(&current.key_id),
                            }),
                        )
                        .await;

                    outbound = Outbound::with_credential(&parsed, request, &current);
                    ctx.retry_count += 1;
                    self.stats.record_auth_retry();
                }
                Verdict::Rotate if outbound.key_id.is_some() => {
                    let framing = head.framing(&parsed.method);
                    let body = match framing {
                        Ok(framing) => read_body(&mut upstream, framing, timeouts).await,
                        Err(e) => Err(e),
                    };
                    drop(upstream);

                    let body = match body {
                        Ok(body) => body,
                        Err(e) => {
                            self.stats.record_upstream_error();
                            warn!("Failed to read 429 body: {}", e);
                            write_status(client, 502, "Bad Gateway", timeouts).await?;
                            return Ok(Disposition::Close);
                        }
                    };

                    let exhausted = outbound.key_id.clone().unwrap_or_default();
                    if ctx.use_passthrough && ctx.retry_count == 0 {
                        // The exhaustion stamp needs an entry to land on
                        if let Some(token) = parsed.bearer_token() {
                            if let Err(e) = self.driver.register_new_key(token).await {
                                warn!(key_id = %short_id(&exhausted), "Registration before rotation failed: {}", e);
                            }
                        }
                    }
                    let next = match self.driver.rotate_on_exhaustion(&exhausted).await {
                        Ok(next) => next,
                        Err(e) => {
                            warn!(key_id = %short_id(&exhausted), "Rotation failed: {}", e);
                            None
                        }
                    };

                    let Some(next) = next else {
                        info!(key_id = %short_id(&exhausted), "No replacement key, relaying 429");
                        write_buffered(client, &head, &body, timeouts).await?;
                        return Ok(close_after(&head, BodyFraming::None));
                    };

                    debug!(
                        from = %short_id(&exhausted),
                        to = %short_id(&next.key_id),
                        delay_ms = self.settings.retry_delay.as_millis() as u64,
                        "Retrying with rotated key"
                    );
                    sleep(self.settings.retry_delay).await;

                    outbound = Outbound::with_credential(&parsed, request, &next);
                    ctx.retry_count += 1;
                    self.stats.record_rotation_retry();
                }
                Verdict::Rotate | Verdict::Relay => {
                    return self
                        .relay(client, &mut upstream, head, &parsed.method)
                        .await;
                }
            }
        }
    }

    /// Classify the caller's credential and build the first outbound request
    async fn classify_and_prepare(
        &self,
        parsed: &ParsedRequest,
        request: &[u8],
        active: &ActiveCredential,
        ctx: &mut RetryContext,
    ) -> Outbound {
        let Some(token) = parsed.bearer_token() else {
            return Outbound::with_credential(parsed, request, active);
        };
        let incoming_id = self.driver.derive_key_id(token);

        let classification = match self.driver.key_status(&incoming_id).await {
            Ok(status) => Classification::from_lookup(status),
            Err(e) => {
                warn!("Rotation state unreadable during classification: {}", e);
                Classification::Known
            }
        };

        match classification {
            Classification::Tombstone => {
                info!(
                    incoming = %short_id(&incoming_id),
                    active = %short_id(&active.key_id),
                    "Swapping tombstoned credential for active key"
                );
                self.driver
                    .audit()
                    .record(
                        "tombstone_token_swap",
                        json!({
                            "incoming_key_id": short_id(&incoming_id),
                            "active_key_id": short_id(&active.key_id),
                        }),
                    )
                    .await;
                Outbound::with_credential(parsed, request, active)
            }
            Classification::Unknown => {
                ctx.use_passthrough = true;
                info!(incoming = %short_id(&incoming_id), "Unknown credential, forwarding unmodified");
                self.driver
                    .audit()
                    .record(
                        "unknown_token_passthrough",
                        json!({ "incoming_key_id": short_id(&incoming_id) }),
                    )
                    .await;
                self.spawn_registration(SecretString::new(token.to_string()));

                Outbound {
                    bytes: request.to_vec(),
                    key_id: Some(incoming_id),
                }
            }
            Classification::Known => Outbound::with_credential(parsed, request, active),
        }
    }

    /// Best-effort registration; failures never reach the request
    fn spawn_registration(&self, token: SecretString) {
        let driver = Arc::clone(&self.driver);
        tokio::spawn(async move {
            match driver.register_new_key(token.expose_secret()).await {
                Ok(key_id) => debug!(key_id = %short_id(&key_id), "Registered unknown credential"),
                Err(e) => debug!("Registration of unknown credential failed: {}", e),
            }
        });
    }

    /// Send one attempt and read the final response head
    ///
    /// Informational heads are passed straight to the client.
    async fn attempt<W>(
        &self,
        host: &str,
        port: u16,
        bytes: &[u8],
        client: &mut W,
    ) -> Result<(BufReader<Box<dyn UpstreamIo>>, ResponseHead), HttpClientError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let timeouts = self.settings.timeouts;
        let mut upstream = BufReader::new(self.connector.connect(host, port).await?);

        timeout(timeouts.write, async {
            upstream.write_all(bytes).await?;
            upstream.flush().await
        })
        .await
        .map_err(|_| HttpClientError::WriteTimeout)??;

        loop {
            let raw = read_message_head(&mut upstream, timeouts.read)
                .await?
                .ok_or_else(|| {
                    HttpClientError::InvalidResponse("Upstream closed without response".to_string())
                })?;
            let head = ResponseHead::parse(raw)?;
            if !head.is_informational() {
                return Ok((upstream, head));
            }
            timeout(timeouts.write, client.write_all(&head.raw))
                .await
                .map_err(|_| HttpClientError::WriteTimeout)??;
        }
    }

    /// Relay a final response, streaming or buffering by content type
    async fn relay<W>(
        &self,
        client: &mut W,
        upstream: &mut BufReader<Box<dyn UpstreamIo>>,
        head: ResponseHead,
        method: &str,
    ) -> Result<Disposition, HttpClientError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let timeouts = self.settings.timeouts;
        let framing = match head.framing(method) {
            Ok(framing) => framing,
            Err(e) => {
                self.stats.record_upstream_error();
                warn!("Unrelayable upstream response: {}", e);
                write_status(client, 502, "Bad Gateway", timeouts).await?;
                return Ok(Disposition::Close);
            }
        };

        match head.mode() {
            ResponseMode::Stream => {
                timeout(timeouts.write, async {
                    client.write_all(&head.raw).await?;
                    client.flush().await
                })
                .await
                .map_err(|_| HttpClientError::WriteTimeout)??;
                let streamed = relay_body(upstream, client, framing, timeouts, true).await?;
                debug!(status = head.status, bytes = streamed, "Streamed response");
            }
            ResponseMode::Buffer => {
                let body = match read_body(upstream, framing, timeouts).await {
                    Ok(body) => body,
                    Err(e) => {
                        self.stats.record_upstream_error();
                        warn!("Failed to read upstream body: {}", e);
                        write_status(client, 502, "Bad Gateway", timeouts).await?;
                        return Ok(Disposition::Close);
                    }
                };
                write_buffered(client, &head, &body, timeouts).await?;
            }
        }

        Ok(close_after(&head, framing))
    }
}

fn close_after(head: &ResponseHead, framing: BodyFraming) -> Disposition {
    if head.wants_close() || framing == BodyFraming::UntilClose {
        Disposition::Close
    } else {
        Disposition::KeepAlive
    }
}

async fn write_buffered<W>(
    client: &mut W,
    head: &ResponseHead,
    body: &[u8],
    timeouts: HopTimeouts,
) -> Result<(), HttpClientError>
where
    W: AsyncWrite + Unpin,
{
    let mut response = Vec::with_capacity(head.raw.len() + body.len());
    response.extend_from_slice(&head.raw);
    response.extend_from_slice(body);

    timeout(timeouts.write, async {
        client.write_all(&response).await?;
        client.flush().await
    })
    .await
    .map_err(|_| HttpClientError::WriteTimeout)??;
    Ok(())
}

/// Minimal proxy-generated response; always closes the connection
pub async fn write_status<W>(
    client: &mut W,
    status: u16,
    reason: &str,
    timeouts: HopTimeouts,
) -> Result<(), HttpClientError>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        reason.len(),
        reason
    );
    timeout(timeouts.write, async {
        client.write_all(response.as_bytes()).await?;
        client.flush().await
    })
    .await
    .map_err(|_| HttpClientError::WriteTimeout)??;
    Ok(())
}

/// Interim reply releasing a client that sent `Expect: 100-continue`
async fn write_continue<W>(client: &mut W, timeouts: HopTimeouts) -> Result<(), HttpClientError>
where
    W: AsyncWrite + Unpin,
{
    timeout(timeouts.write, async {
        client.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
        client.flush().await
    })
    .await
    .map_err(|_| HttpClientError::WriteTimeout)??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_401_retried_once_and_never_in_passthrough() {
        let fresh = RetryContext::default();
        assert_eq!(decide(401, &fresh, 2), Verdict::RetryWithActive);

        let retried = RetryContext {
            retry_count: 1,
            use_passthrough: false,
        };
        assert_eq!(decide(401, &retried, 2), Verdict::Relay);

        let passthrough = RetryContext {
            retry_count: 0,
            use_passthrough: true,
        };
        assert_eq!(decide(401, &passthrough, 2), Verdict::Relay);
    }

    #[test]
    fn test_429_bounded_by_max_retries() {
        let mut ctx = RetryContext::default();
        assert_eq!(decide(429, &ctx, 2), Verdict::Rotate);
        ctx.retry_count = 1;
        assert_eq!(decide(429, &ctx, 2), Verdict::Rotate);
        ctx.retry_count = 2;
        assert_eq!(decide(429, &ctx, 2), Verdict::Relay);
        assert_eq!(decide(429, &RetryContext::default(), 0), Verdict::Relay);
    }

    #[test]
    fn test_other_statuses_relay() {
        for status in [200, 204, 400, 403, 500, 503] {
            assert_eq!(decide(status, &RetryContext::default(), 2), Verdict::Relay);
        }
    }

    #[test]
    fn test_classification_from_lookup() {
        assert_eq!(
            Classification::from_lookup(Some(KeyStatus::Tombstone)),
            Classification::Tombstone
        );
        assert_eq!(Classification::from_lookup(None), Classification::Unknown);
        assert_eq!(
            Classification::from_lookup(Some(KeyStatus::Exhausted)),
            Classification::Known
        );
    }

    #[tokio::test]
    async fn test_write_status_closes() {
        let mut out = Vec::new();
        write_status(&mut out, 502, "Bad Gateway", HopTimeouts::default())
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("Connection: close"));
        assert!(text.ends_with("\r\n\r\nBad Gateway"));
    }
}
