//! Operational counters and the health endpoint

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::rotation::{short_id, RotationDriver};

/// Path answered by the listener itself instead of being proxied
pub const HEALTH_PATH: &str = "/__health";

/// Process-wide counters, updated lock-free from every connection task
#[derive(Debug)]
pub struct ProxyStats {
    started: Instant,
    requests: AtomicU64,
    intercepted_tunnels: AtomicU64,
    passthrough_tunnels: AtomicU64,
    auth_retries: AtomicU64,
    rotation_retries: AtomicU64,
    upstream_errors: AtomicU64,
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            requests: AtomicU64::new(0),
            intercepted_tunnels: AtomicU64::new(0),
            passthrough_tunnels: AtomicU64::new(0),
            auth_retries: AtomicU64::new(0),
            rotation_retries: AtomicU64::new(0),
            upstream_errors: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_intercepted_tunnel(&self) {
        self.intercepted_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_passthrough_tunnel(&self) {
        self.passthrough_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_retry(&self) {
        self.auth_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rotation_retry(&self) {
        self.rotation_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_total: self.requests(),
            intercepted_tunnels: self.intercepted_tunnels.load(Ordering::Relaxed),
            passthrough_tunnels: self.passthrough_tunnels.load(Ordering::Relaxed),
            auth_retries: self.auth_retries.load(Ordering::Relaxed),
            rotation_retries: self.rotation_retries.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
        }
    }
}

pub type SharedProxyStats = Arc<ProxyStats>;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests_total: u64,
    pub intercepted_tunnels: u64,
    pub passthrough_tunnels: u64,
    pub auth_retries: u64,
    pub rotation_retries: u64,
    pub upstream_errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    /// Truncated id of the active key, `None` when state is unreadable
    pub active_key_id: Option<String>,
    pub uptime_seconds: u64,
    pub rotations: u64,
    pub version: &'static str,
    #[serde(flatten)]
    pub counters: StatsSnapshot,
}

/// Gather the health payload; never fails
pub async fn health_status(stats: &ProxyStats, driver: &RotationDriver) -> HealthStatus {
    let active_key_id = driver
        .active_key_id()
        .await
        .map(|id| short_id(&id).to_string());

    HealthStatus {
        status: "ok",
        active_key_id,
        uptime_seconds: stats.uptime_seconds(),
        rotations: driver.rotation_count(),
        version: crate::VERSION,
        counters: stats.snapshot(),
    }
}

/// Full HTTP/1.1 response carrying the health payload
pub fn render_health_response(status: &HealthStatus) -> Vec<u8> {
    let body = serde_json::to_string(status).unwrap_or_else(|_| "{\"status\":\"ok\"}".to_string());
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}
