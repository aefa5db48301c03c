//! Process startup and shutdown
//!
//! Startup runs in a fixed order and stops at the first failure: open the rotation
//! store, require a usable active key, load the interception certificates, bind the
//! loopback listener. Each failure maps to a process exit code.

use serde_json::json;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::forwarder::Forwarder;
use crate::health::{ProxyStats, SharedProxyStats};
use crate::http_client::{SharedUpstreamConnector, TlsUpstreamConnector};
use crate::logger::{AuditLog, SharedAuditLog};
use crate::mitm::error::MitmError;
use crate::mitm::interceptor::MitmInterceptor;
use crate::mitm::tls_config::UpstreamTlsConfig;
use crate::rotation::{
    short_id, spawn_health_checker, JsonFileStore, RotationDriver, RotationError,
    SharedRotationDriver, StoreError,
};
use crate::server::{ProxyServer, ServerContext};
use crate::tls::CertBundle;

/// Exit code when the listener port is already taken
pub const EXIT_ADDR_IN_USE: i32 = 98;

/// Errors that abort startup
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rotation store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("No usable active key: {0}")]
    NoActiveKey(RotationError),

    #[error("{0}")]
    Certificates(#[from] MitmError),

    #[error("Port {0} is already in use; is another proxy instance running?")]
    AddrInUse(u16),

    #[error("Failed to bind 127.0.0.1:{port}: {reason}")]
    Bind { port: u16, reason: String },
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::AddrInUse(_) => EXIT_ADDR_IN_USE,
            _ => 1,
        }
    }
}

/// Bind the listener on loopback only
pub async fn bind_loopback(port: u16) -> Result<TcpListener, StartupError> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpListener::bind(addr).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            StartupError::AddrInUse(port)
        } else {
            StartupError::Bind {
                port,
                reason: e.to_string(),
            }
        }
    })
}

/// Everything a started proxy owns
pub struct Runtime {
    pub server: ProxyServer,
    pub driver: SharedRotationDriver,
    pub stats: SharedProxyStats,
    pub audit: SharedAuditLog,
    health_checker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("local_addr", &self.server.local_addr().ok())
            .field("health_checker", &self.health_checker.is_some())
            .finish()
    }
}

/// Run the startup sequence
pub async fn startup(config: &Config) -> Result<Runtime, StartupError> {
    let audit: SharedAuditLog = Arc::new(AuditLog::new(
        config.audit_log_path.clone(),
        config.audit_log_max_bytes,
    ));

    let store = JsonFileStore::open(&config.rotation_state_path, config.usage_endpoint.clone())
        .await?
        .with_credentials_path(config.credentials_path.clone());
    let driver: SharedRotationDriver = Arc::new(RotationDriver::new(Arc::new(store), audit.clone()));

    let active = driver
        .active_credential()
        .await
        .map_err(StartupError::NoActiveKey)?;
    info!(active_key = %short_id(&active.key_id), "Active key resolved");

    match driver.misconfigured_keys().await {
        Ok(ids) => {
            for id in ids {
                warn!(
                    key_id = %short_id(&id),
                    "Key is active but has no refresh token; it cannot be refreshed"
                );
            }
        }
        Err(e) => warn!("Could not scan keys for misconfiguration: {}", e),
    }

    let acceptor = CertBundle::load(&config.cert_dir)?.into_acceptor()?;

    let upstream_tls =
        UpstreamTlsConfig::new().map_err(|e| StartupError::Config(e.to_string()))?;
    let timeouts = config.timeouts();
    let connector: SharedUpstreamConnector =
        Arc::new(TlsUpstreamConnector::new(&upstream_tls, timeouts.connect));

    let stats: SharedProxyStats = Arc::new(ProxyStats::new());
    let forwarder = Arc::new(Forwarder::new(
        driver.clone(),
        connector,
        stats.clone(),
        config.forwarder_settings(),
    ));
    let interceptor = Arc::new(MitmInterceptor::new(
        config.intercept_domains.iter(),
        acceptor,
        forwarder,
        timeouts.connect,
        stats.clone(),
    ));

    let listener = bind_loopback(config.port).await?;
    let server = ProxyServer::new(
        listener,
        ServerContext {
            interceptor,
            driver: driver.clone(),
            stats: stats.clone(),
            timeouts,
        },
    );

    let health_checker = config.health_check_interval().map(|interval| {
        info!(interval_secs = interval.as_secs(), "Background key health checks enabled");
        spawn_health_checker(driver.clone(), interval)
    });

    audit
        .record(
            "proxy_started",
            json!({
                "port": config.port,
                "active_key": short_id(&active.key_id),
                "intercept_domains": config.intercept_domains,
            }),
        )
        .await;

    Ok(Runtime {
        server,
        driver,
        stats,
        audit,
        health_checker,
    })
}

impl Runtime {
    /// Serve until `shutdown` resolves, then log the final counters
    pub async fn run<F>(self, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        if let Ok(addr) = self.server.local_addr() {
            info!("Listening on {}", addr);
        }

        self.server.run(shutdown).await;

        if let Some(handle) = self.health_checker {
            handle.abort();
        }

        let counters = self.stats.snapshot();
        info!(
            requests_total = counters.requests_total,
            intercepted_tunnels = counters.intercepted_tunnels,
            passthrough_tunnels = counters.passthrough_tunnels,
            rotations = self.driver.rotation_count(),
            uptime_seconds = self.stats.uptime_seconds(),
            "Proxy stopped"
        );

        self.audit
            .record(
                "proxy_stopped",
                json!({
                    "requests_total": counters.requests_total,
                    "rotations": self.driver.rotation_count(),
                    "uptime_seconds": self.stats.uptime_seconds(),
                }),
            )
            .await;
    }
}

/// Resolve on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    // Handle SIGINT (Ctrl+C)
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(StartupError::AddrInUse(18080).exit_code(), 98);
        assert_eq!(
            StartupError::Store(StoreError::NotFound("/tmp/x".into())).exit_code(),
            1
        );
        assert_eq!(
            StartupError::NoActiveKey(RotationError::NoActiveKey).exit_code(),
            1
        );
    }

    #[tokio::test]
    async fn test_bind_loopback_reports_addr_in_use() {
        let first = bind_loopback(0).await.unwrap();
        let port = first.local_addr().unwrap().port();
        assert!(first.local_addr().unwrap().ip().is_loopback());

        let err = bind_loopback(port).await.unwrap_err();
        assert!(matches!(err, StartupError::AddrInUse(p) if p == port));
        assert_eq!(err.exit_code(), EXIT_ADDR_IN_USE);
    }

    #[tokio::test]
    async fn test_startup_fails_without_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            port: 0,
            home_dir: dir.path().to_path_buf(),
            rotation_state_path: dir.path().join("missing.json"),
            cert_dir: dir.path().join("certs"),
            credentials_path: None,
            intercept_domains: vec!["api.anthropic.com".into()],
            max_429_retries: 2,
            rotation_retry_delay_ms: 500,
            max_request_body_bytes: 1 << 20,
            audit_log_path: dir.path().join("audit.log"),
            audit_log_max_bytes: 1 << 20,
            connect_timeout_seconds: 1,
            read_timeout_seconds: 1,
            write_timeout_seconds: 1,
            health_check_interval_seconds: 0,
            usage_endpoint: "http://127.0.0.1:9/usage".into(),
        };

        let err = startup(&config).await.unwrap_err();
        assert!(matches!(err, StartupError::Store(StoreError::NotFound(_))));
        assert_eq!(err.exit_code(), 1);
    }
}
