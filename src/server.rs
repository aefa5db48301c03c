use bytes::BytesMut;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::forwarder::write_status;
use crate::health::{health_status, render_health_response, SharedProxyStats, HEALTH_PATH};
use crate::http_client::{read_message_head, HopTimeouts};
use crate::mitm::http_parser::parse_request;
use crate::mitm::interceptor::{InterceptionError, MitmInterceptor, TunnelOutcome};
use crate::rotation::SharedRotationDriver;

/// Parse and validate CONNECT authority (host:port)
/// Returns (host, port) or error message
pub fn parse_authority(authority: &str) -> Result<(String, u16), String> {
    // Split by last colon to handle IPv6 addresses like [::1]:443
    let parts: Vec<&str> = authority.rsplitn(2, ':').collect();

    if parts.len() != 2 {
        return Err("Authority must be in host:port format".to_string());
    }

    let port_str = parts[0];
    let host = parts[1].trim_start_matches('[').trim_end_matches(']');

    if host.is_empty() {
        return Err("Host cannot be empty".to_string());
    }

    let port: u16 = port_str.parse().map_err(|_| {
        format!(
            "Invalid port '{}': must be a number between 1 and 65535",
            port_str
        )
    })?;

    if port == 0 {
        return Err("Invalid port: must be between 1 and 65535".to_string());
    }

    Ok((host.to_string(), port))
}

/// Shared per-connection context
#[derive(Debug)]
pub struct ServerContext {
    pub interceptor: Arc<MitmInterceptor>,
    pub driver: SharedRotationDriver,
    pub stats: SharedProxyStats,
    pub timeouts: HopTimeouts,
}

/// Loopback listener accepting CONNECT tunnels and health requests
pub struct ProxyServer {
    listener: TcpListener,
    context: Arc<ServerContext>,
}

impl ProxyServer {
    pub fn new(listener: TcpListener, context: ServerContext) -> Self {
        Self {
            listener,
            context: Arc::new(context),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves
    ///
    /// Every connection runs in its own task; in-flight tunnels are not awaited.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted connection from {}", peer_addr);
                            let _ = stream.set_nodelay(true);

                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, context).await {
                                    warn!(peer = %peer_addr, "Connection ended with error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutting down server...");
                    break;
                }
            }
        }
    }
}

/// Route one client connection by its first request
pub async fn handle_connection<S>(
    stream: S,
    context: Arc<ServerContext>,
) -> Result<(), InterceptionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let timeouts = context.timeouts;
    let mut reader = BufReader::new(stream);

    let head = match read_message_head(&mut reader, timeouts.read).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(e) => {
            debug!("Failed to read request head: {}", e);
            write_status(&mut reader, 400, "Bad Request", timeouts).await?;
            return Ok(());
        }
    };

    let Some(request) = parse_request(&head) else {
        write_status(&mut reader, 400, "Bad Request", timeouts).await?;
        return Ok(());
    };

    if request.method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = match parse_authority(&request.path) {
            Ok(authority) => authority,
            Err(msg) => {
                warn!("[CONNECT] Invalid authority {}: {}", request.path, msg);
                write_status(&mut reader, 400, "Bad Request", timeouts).await?;
                return Ok(());
            }
        };

        info!("[CONNECT] {}:{} from client", host, port);

        // Bytes read past the CONNECT head travel with the tunnel
        let leftover = BytesMut::from(reader.buffer());
        let stream = reader.into_inner();

        let outcome = context
            .interceptor
            .handle_connect(stream, leftover, host.clone(), port)
            .await?;
        if let TunnelOutcome::Passthrough { bytes_up, bytes_down } = outcome {
            debug!(target_host = %host, bytes_up, bytes_down, "Passthrough finished");
        }
        return Ok(());
    }

    if request.method.eq_ignore_ascii_case("GET") && request.path == HEALTH_PATH {
        let status = health_status(&context.stats, &context.driver).await;
        reader.write_all(&render_health_response(&status)).await?;
        reader.flush().await?;
        return Ok(());
    }

    debug!(method = %request.method, path = %request.path, "Rejecting non-CONNECT request");
    let response = b"HTTP/1.1 405 Method Not Allowed\r\nAllow: CONNECT\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    reader.write_all(response).await?;
    reader.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_authority_valid() {
        assert_eq!(
            parse_authority("api.example.com:443").unwrap(),
            ("api.example.com".to_string(), 443)
        );
        assert_eq!(
            parse_authority("127.0.0.1:8080").unwrap(),
            ("127.0.0.1".to_string(), 8080)
        );
        assert_eq!(parse_authority("[::1]:443").unwrap(), ("::1".to_string(), 443));
    }

    #[test]
    fn test_parse_authority_invalid() {
        assert!(parse_authority("example.com").is_err());
        assert!(parse_authority(":443").is_err());
        assert!(parse_authority("example.com:0").is_err());
        assert!(parse_authority("example.com:99999").is_err());
        assert!(parse_authority("example.com:https").is_err());
    }
}
