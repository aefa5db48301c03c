//! TLS Configuration for intercepted channels
//!
//! - Client-facing TLS (proxy ← client) with the locally installed server certificate
//! - Upstream TLS (proxy → upstream) with real verification against Mozilla roots
//!
//! Both sides negotiate HTTP/1.1 only: the forwarder rewrites HTTP/1.1 messages.

use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig, DEFAULT_VERSIONS};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use webpki_roots::TLS_SERVER_ROOTS;

const ALPN_HTTP11: &[u8] = b"http/1.1";

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("TLS configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Client-facing TLS config (proxy acts as the intercepted server)
#[derive(Debug, Clone)]
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    /// Build server config from the installed certificate chain
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsConfigError> {
        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(DEFAULT_VERSIONS)
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| TlsConfigError::InvalidCertificate(e.to_string()))?;

        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        info!("Client-facing TLS config created");

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Get rustls ServerConfig
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Upstream TLS config (proxy acts as client with real verification)
#[derive(Debug, Clone)]
pub struct UpstreamTlsConfig {
    config: Arc<ClientConfig>,
}

impl UpstreamTlsConfig {
    /// Build client config trusting the Mozilla root bundle
    pub fn new() -> Result<Self, TlsConfigError> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(TLS_SERVER_ROOTS.iter().cloned());

        let mut config = ClientConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(DEFAULT_VERSIONS)
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?
            .with_root_certificates(root_store)
            .with_no_client_auth();

        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        info!(
            roots_count = TLS_SERVER_ROOTS.len(),
            "Upstream TLS config created"
        );

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Get rustls ClientConfig
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }
}

/// SNI (Server Name Indication) utilities
pub struct SniUtils;

impl SniUtils {
    /// Parse hostname into ServerName for SNI
    pub fn parse_server_name(hostname: &str) -> Result<ServerName<'static>, TlsConfigError> {
        ServerName::try_from(hostname.to_owned())
            .map_err(|e| TlsConfigError::InvalidServerName(format!("{}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_tls_config_from_generated_cert() {
        let cert = rcgen::generate_simple_self_signed(vec!["api.example.com".to_string()]).unwrap();
        let chain = vec![CertificateDer::from(cert.serialize_der().unwrap())];
        let key = PrivateKeyDer::Pkcs8(cert.serialize_private_key_der().into());

        let config = ClientTlsConfig::new(chain, key).unwrap();
        assert_eq!(
            config.server_config().alpn_protocols,
            vec![b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn test_client_tls_config_rejects_garbage_key() {
        let cert = rcgen::generate_simple_self_signed(vec!["api.example.com".to_string()]).unwrap();
        let chain = vec![CertificateDer::from(cert.serialize_der().unwrap())];
        let key = PrivateKeyDer::Pkcs8(vec![0u8; 16].into());

        let err = ClientTlsConfig::new(chain, key).unwrap_err();
        assert!(matches!(err, TlsConfigError::InvalidCertificate(_)));
    }

    #[test]
    fn test_sni_parse_server_name() {
        assert!(SniUtils::parse_server_name("api.example.com").is_ok());
        assert!(SniUtils::parse_server_name("192.168.1.1").is_ok());
        assert!(SniUtils::parse_server_name("").is_err());
    }

    #[test]
    fn test_upstream_tls_config_negotiates_http11() {
        let config = UpstreamTlsConfig::new().unwrap();
        assert_eq!(
            config.client_config().alpn_protocols,
            vec![b"http/1.1".to_vec()]
        );
    }
}
