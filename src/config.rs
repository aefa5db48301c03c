use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::forwarder::ForwarderSettings;
use crate::http_client::HopTimeouts;

pub const DEFAULT_USAGE_ENDPOINT: &str = "https://api.anthropic.com/api/oauth/usage";

#[derive(Debug, Clone)]
pub struct Config {
    // Listener (always bound to loopback)
    pub port: u16,

    // Working directory and files under it
    pub home_dir: PathBuf,
    pub rotation_state_path: PathBuf,
    pub cert_dir: PathBuf,
    pub credentials_path: Option<PathBuf>,

    // Interception and rotation
    pub intercept_domains: Vec<String>,
    pub max_429_retries: u32,
    pub rotation_retry_delay_ms: u64,
    pub max_request_body_bytes: u64,

    // Audit log
    pub audit_log_path: PathBuf,
    pub audit_log_max_bytes: u64,

    // Upstream timeouts
    pub connect_timeout_seconds: u64,
    pub read_timeout_seconds: u64,
    pub write_timeout_seconds: u64,

    // Background key health checks (0 disables)
    pub health_check_interval_seconds: u64,
    pub usage_endpoint: String,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn path_var(name: &str, default: PathBuf) -> PathBuf {
    env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let port = var_or("PROXY_PORT", "18080")
            .parse()
            .context("Invalid PROXY_PORT")?;

        let home_dir = match env::var_os("KEYRELAY_HOME").filter(|v| !v.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .context("Cannot determine home directory; set KEYRELAY_HOME")?
                .join(".claude"),
        };

        let rotation_state_path =
            path_var("ROTATION_STATE_PATH", home_dir.join("api-key-rotation.json"));
        let cert_dir = path_var("PROXY_CERT_DIR", home_dir.join("proxy-certs"));
        let credentials_path = env::var_os("CREDENTIALS_PATH")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let intercept_domains: Vec<String> = var_or("INTERCEPT_DOMAINS", "api.anthropic.com")
            .split(',')
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        if intercept_domains.is_empty() {
            return Err(anyhow::anyhow!(
                "INTERCEPT_DOMAINS must name at least one host"
            ));
        }

        let max_429_retries = var_or("MAX_429_RETRIES", "2")
            .parse()
            .context("Invalid MAX_429_RETRIES")?;
        let rotation_retry_delay_ms = var_or("ROTATION_RETRY_DELAY_MS", "500")
            .parse()
            .context("Invalid ROTATION_RETRY_DELAY_MS")?;
        let max_request_body_bytes = var_or("MAX_REQUEST_BODY_BYTES", "33554432")
            .parse()
            .context("Invalid MAX_REQUEST_BODY_BYTES")?;

        let audit_log_path = path_var("AUDIT_LOG_PATH", home_dir.join("rotation-proxy.log"));
        let audit_log_max_bytes = var_or("AUDIT_LOG_MAX_BYTES", "1048576")
            .parse()
            .context("Invalid AUDIT_LOG_MAX_BYTES")?;

        let connect_timeout_seconds = var_or("UPSTREAM_CONNECT_TIMEOUT_SECONDS", "10")
            .parse()
            .context("Invalid UPSTREAM_CONNECT_TIMEOUT_SECONDS")?;
        let read_timeout_seconds = var_or("UPSTREAM_READ_TIMEOUT_SECONDS", "300")
            .parse()
            .context("Invalid UPSTREAM_READ_TIMEOUT_SECONDS")?;
        let write_timeout_seconds = var_or("UPSTREAM_WRITE_TIMEOUT_SECONDS", "30")
            .parse()
            .context("Invalid UPSTREAM_WRITE_TIMEOUT_SECONDS")?;

        let health_check_interval_seconds = var_or("HEALTH_CHECK_INTERVAL_SECONDS", "0")
            .parse()
            .context("Invalid HEALTH_CHECK_INTERVAL_SECONDS")?;
        let usage_endpoint = var_or("USAGE_ENDPOINT", DEFAULT_USAGE_ENDPOINT);

        Ok(Config {
            port,
            home_dir,
            rotation_state_path,
            cert_dir,
            credentials_path,
            intercept_domains,
            max_429_retries,
            rotation_retry_delay_ms,
            max_request_body_bytes,
            audit_log_path,
            audit_log_max_bytes,
            connect_timeout_seconds,
            read_timeout_seconds,
            write_timeout_seconds,
            health_check_interval_seconds,
            usage_endpoint,
        })
    }

    pub fn timeouts(&self) -> HopTimeouts {
        HopTimeouts {
            connect: Duration::from_secs(self.connect_timeout_seconds),
            read: Duration::from_secs(self.read_timeout_seconds),
            write: Duration::from_secs(self.write_timeout_seconds),
        }
    }

    pub fn forwarder_settings(&self) -> ForwarderSettings {
        ForwarderSettings {
            max_429_retries: self.max_429_retries,
            retry_delay: Duration::from_millis(self.rotation_retry_delay_ms),
            max_request_body: self.max_request_body_bytes,
            timeouts: self.timeouts(),
        }
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_seconds > 0)
            .then(|| Duration::from_secs(self.health_check_interval_seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Global mutex to serialize config tests (env vars are process-global)
    static TEST_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "PROXY_PORT",
        "KEYRELAY_HOME",
        "ROTATION_STATE_PATH",
        "PROXY_CERT_DIR",
        "CREDENTIALS_PATH",
        "INTERCEPT_DOMAINS",
        "MAX_429_RETRIES",
        "ROTATION_RETRY_DELAY_MS",
        "MAX_REQUEST_BODY_BYTES",
        "AUDIT_LOG_PATH",
        "AUDIT_LOG_MAX_BYTES",
        "HEALTH_CHECK_INTERVAL_SECONDS",
    ];

    fn clear_test_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_config_defaults_derive_from_home() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("KEYRELAY_HOME", "/tmp/keyrelay-home");

        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 18080);
        assert_eq!(
            config.rotation_state_path,
            PathBuf::from("/tmp/keyrelay-home/api-key-rotation.json")
        );
        assert_eq!(config.cert_dir, PathBuf::from("/tmp/keyrelay-home/proxy-certs"));
        assert_eq!(config.intercept_domains, vec!["api.anthropic.com".to_string()]);
        assert_eq!(config.max_429_retries, 2);
        assert_eq!(config.audit_log_max_bytes, 1_048_576);
        assert_eq!(config.forwarder_settings().max_request_body, 32 * 1024 * 1024);
        assert!(config.credentials_path.is_none());
        assert!(config.health_check_interval().is_none());
        assert_eq!(
            config.forwarder_settings().retry_delay,
            Duration::from_millis(500)
        );

        clear_test_env();
    }

    #[test]
    fn test_config_overrides() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("KEYRELAY_HOME", "/tmp/keyrelay-home");
        env::set_var("PROXY_PORT", "19999");
        env::set_var("INTERCEPT_DOMAINS", " API.Example.com , other.example.com,");
        env::set_var("MAX_429_RETRIES", "5");
        env::set_var("HEALTH_CHECK_INTERVAL_SECONDS", "60");
        env::set_var("MAX_REQUEST_BODY_BYTES", "1024");

        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 19999);
        assert_eq!(
            config.intercept_domains,
            vec!["api.example.com".to_string(), "other.example.com".to_string()]
        );
        assert_eq!(config.max_429_retries, 5);
        assert_eq!(config.health_check_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.forwarder_settings().max_request_body, 1024);

        clear_test_env();
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("KEYRELAY_HOME", "/tmp/keyrelay-home");

        env::set_var("PROXY_PORT", "not-a-port");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("PROXY_PORT"));
        env::remove_var("PROXY_PORT");

        env::set_var("INTERCEPT_DOMAINS", " , ");
        assert!(Config::from_env().is_err());

        clear_test_env();
    }
}
