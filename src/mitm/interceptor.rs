//! CONNECT tunnel handling
//!
//! Every tunnel is either:
//! 1. Intercepted: the client's TLS session is terminated locally with the installed
//!    certificate and the decrypted channel is handed to the forwarder
//! 2. Passed through: bytes are piped to the real host with no inspection
//!
//! The decision is made purely on the target hostname.

use bytes::BytesMut;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::forwarder::Forwarder;
use crate::health::SharedProxyStats;
use crate::http_client::HttpClientError;
use crate::mitm::error::MitmError;
use crate::mitm::rewind::ReplayStream;

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const TUNNEL_BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Interception errors
#[derive(Debug, Error)]
pub enum InterceptionError {
    #[error("MITM error: {0}")]
    MitmError(#[from] MitmError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Forwarding failed: {0}")]
    Forwarding(#[from] HttpClientError),
}

/// How a finished tunnel was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelOutcome {
    Intercepted,
    Passthrough { bytes_up: u64, bytes_down: u64 },
}

/// Routes CONNECT tunnels to interception or passthrough
pub struct MitmInterceptor {
    /// Lower-cased hostnames whose traffic is decrypted
    intercept_domains: HashSet<String>,

    /// Client-facing TLS with the installed server certificate
    acceptor: TlsAcceptor,

    forwarder: Arc<Forwarder>,

    /// Bounds passthrough connects and client handshakes
    connect_timeout: Duration,

    stats: SharedProxyStats,
}

impl std::fmt::Debug for MitmInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MitmInterceptor")
            .field("intercept_domains", &self.intercept_domains)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

impl MitmInterceptor {
    pub fn new<I, D>(
        intercept_domains: I,
        acceptor: TlsAcceptor,
        forwarder: Arc<Forwarder>,
        connect_timeout: Duration,
        stats: SharedProxyStats,
    ) -> Self
    where
        I: IntoIterator<Item = D>,
        D: AsRef<str>,
    {
        let intercept_domains = intercept_domains
            .into_iter()
            .map(|d| normalize_host(d.as_ref()))
            .filter(|d| !d.is_empty())
            .collect();

        Self {
            intercept_domains,
            acceptor,
            forwarder,
            connect_timeout,
            stats,
        }
    }

    pub fn should_intercept(&self, host: &str) -> bool {
        self.intercept_domains.contains(&normalize_host(host))
    }

    /// Handle an accepted CONNECT
    ///
    /// `leftover` holds any bytes read past the CONNECT head; they belong to the client's
    /// TLS handshake.
    pub async fn handle_connect<S>(
        &self,
        client: S,
        leftover: BytesMut,
        target_host: String,
        target_port: u16,
    ) -> Result<TunnelOutcome, InterceptionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.should_intercept(&target_host) {
            self.stats.record_intercepted_tunnel();
            self.intercept(client, leftover, &target_host, target_port)
                .await
        } else {
            self.stats.record_passthrough_tunnel();
            self.tunnel_connection(client, leftover, &target_host, target_port)
                .await
        }
    }

    /// Terminate the client's TLS and serve the decrypted channel
    async fn intercept<S>(
        &self,
        mut client: S,
        leftover: BytesMut,
        target_host: &str,
        target_port: u16,
    ) -> Result<TunnelOutcome, InterceptionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        debug!(
            target_host = %target_host,
            target_port = target_port,
            replayed_bytes = leftover.len(),
            "Intercepting tunnel"
        );

        // Confirmation goes out before the buffered handshake bytes are touched
        client.write_all(CONNECTION_ESTABLISHED).await?;
        client.flush().await?;

        let replay = ReplayStream::new(client, leftover);
        let tls_stream = timeout(self.connect_timeout, self.acceptor.accept(replay))
            .await
            .map_err(|_| MitmError::tls_handshake(target_host, "handshake timed out"))?
            .map_err(|e| MitmError::tls_handshake(target_host, e.to_string()))?;

        debug!(target_host = %target_host, "Client TLS established");

        self.forwarder
            .serve_channel(tls_stream, target_host, target_port)
            .await?;

        info!(target_host = %target_host, "Intercepted tunnel closed");
        Ok(TunnelOutcome::Intercepted)
    }

    /// Tunnel connection without inspection
    async fn tunnel_connection<S>(
        &self,
        mut client: S,
        leftover: BytesMut,
        target_host: &str,
        target_port: u16,
    ) -> Result<TunnelOutcome, InterceptionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        debug!(
            target_host = %target_host,
            target_port = target_port,
            "Tunneling without inspection"
        );

        let connect = timeout(
            self.connect_timeout,
            TcpStream::connect((target_host, target_port)),
        )
        .await;
        let mut upstream_stream = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(target_host = %target_host, "Passthrough connect failed: {}", e);
                let _ = client.write_all(TUNNEL_BAD_GATEWAY).await;
                return Err(MitmError::upstream(target_host, e.to_string()).into());
            }
            Err(_) => {
                warn!(target_host = %target_host, "Passthrough connect timed out");
                let _ = client.write_all(TUNNEL_BAD_GATEWAY).await;
                return Err(MitmError::upstream(target_host, "connect timed out").into());
            }
        };

        client.write_all(CONNECTION_ESTABLISHED).await?;
        client.flush().await?;

        // Early bytes are the start of the client's stream to the real server
        if !leftover.is_empty() {
            upstream_stream.write_all(&leftover).await?;
        }

        let (bytes_up, bytes_down) =
            tokio::io::copy_bidirectional(&mut client, &mut upstream_stream).await?;
        let bytes_up = bytes_up + leftover.len() as u64;

        info!(
            target_host = %target_host,
            bytes_up = bytes_up,
            bytes_down = bytes_down,
            "Tunnel completed"
        );

        Ok(TunnelOutcome::Passthrough {
            bytes_up,
            bytes_down,
        })
    }
}
