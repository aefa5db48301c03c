//! MITM error types

use std::path::PathBuf;
use thiserror::Error;

/// Result type for MITM operations
pub type Result<T> = std::result::Result<T, MitmError>;

/// MITM-specific errors
#[derive(Error, Debug)]
pub enum MitmError {
    /// One or more certificate files are absent
    #[error(
        "Missing certificate files in {}: {}. Generate them with the proxy certificate setup tool \
         (it writes ca.pem, server.pem and server-key.pem) and install ca.pem as a trusted root",
        .dir.display(),
        .missing.join(", ")
    )]
    CertificatesMissing { dir: PathBuf, missing: Vec<String> },

    /// Certificate parsing failed
    #[error("Failed to parse certificate {path}: {reason}")]
    CertParseFailed { path: String, reason: String },

    /// TLS handshake failed
    #[error("TLS handshake failed for {host}: {reason}")]
    TlsHandshakeFailed { host: String, reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid CONNECT request
    #[error("Invalid CONNECT request: {0}")]
    InvalidConnectRequest(String),

    /// TLS configuration failed
    #[error("TLS configuration failed: {0}")]
    TlsConfigFailed(String),

    /// Upstream connection failed
    #[error("Upstream connection failed for {host}: {reason}")]
    UpstreamConnectionFailed { host: String, reason: String },
}

impl MitmError {
    /// Create a certificate parse error
    pub fn cert_parse(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CertParseFailed {
            path: path.into(),
            reason: msg.into(),
        }
    }

    /// Create a TLS handshake error
    pub fn tls_handshake(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TlsHandshakeFailed {
            host: host.into(),
            reason: msg.into(),
        }
    }

    /// Create an upstream connection error
    pub fn upstream(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::UpstreamConnectionFailed {
            host: host.into(),
            reason: msg.into(),
        }
    }
}
