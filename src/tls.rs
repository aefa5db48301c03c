use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::mitm::error::{MitmError, Result};
use crate::mitm::tls_config::ClientTlsConfig;

/// Issuing authority certificate
pub const CA_CERT_FILE: &str = "ca.pem";
/// Server certificate covering the intercepted domains
pub const SERVER_CERT_FILE: &str = "server.pem";
/// Private key for the server certificate
pub const SERVER_KEY_FILE: &str = "server-key.pem";

/// Certificate material for intercepted domains
#[derive(Debug)]
pub struct CertBundle {
    /// Server certificate followed by the issuing CA
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl CertBundle {
    /// Load the three certificate files from `dir`, failing if any is absent
    pub fn load(dir: &Path) -> Result<Self> {
        let missing: Vec<String> = [CA_CERT_FILE, SERVER_CERT_FILE, SERVER_KEY_FILE]
            .iter()
            .filter(|name| !dir.join(name).is_file())
            .map(|name| name.to_string())
            .collect();

        if !missing.is_empty() {
            return Err(MitmError::CertificatesMissing {
                dir: dir.to_path_buf(),
                missing,
            });
        }

        let mut chain = load_certs(&dir.join(SERVER_CERT_FILE))?;
        chain.extend(load_certs(&dir.join(CA_CERT_FILE))?);
        let key = load_key(&dir.join(SERVER_KEY_FILE))?;

        info!(
            cert_dir = %dir.display(),
            chain_len = chain.len(),
            "Loaded interception certificates"
        );

        Ok(Self { chain, key })
    }

    /// Create the TLS acceptor used for intercepted channels
    pub fn into_acceptor(self) -> Result<TlsAcceptor> {
        let config = ClientTlsConfig::new(self.chain, self.key)
            .map_err(|e| MitmError::TlsConfigFailed(e.to_string()))?;
        Ok(TlsAcceptor::from(config.server_config()))
    }
}

/// Load PEM certificates from a file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| MitmError::cert_parse(path.display().to_string(), e.to_string()))?;

    if certs.is_empty() {
        return Err(MitmError::cert_parse(
            path.display().to_string(),
            "no certificates found",
        ));
    }

    Ok(certs)
}

/// Load the first PEM private key (PKCS#8, PKCS#1 or SEC1) from a file
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    private_key(&mut reader)
        .map_err(|e| MitmError::cert_parse(path.display().to_string(), e.to_string()))?
        .ok_or_else(|| MitmError::cert_parse(path.display().to_string(), "no private key found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_are_all_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CA_CERT_FILE), "x").unwrap();

        let err = CertBundle::load(dir.path()).unwrap_err();
        match &err {
            MitmError::CertificatesMissing { missing, .. } => {
                assert_eq!(missing, &vec![SERVER_CERT_FILE.to_string(), SERVER_KEY_FILE.to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("setup tool"));
    }

    #[test]
    fn test_load_generated_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["api.example.com".to_string()]).unwrap();
        std::fs::write(dir.path().join(CA_CERT_FILE), cert.serialize_pem().unwrap()).unwrap();
        std::fs::write(dir.path().join(SERVER_CERT_FILE), cert.serialize_pem().unwrap()).unwrap();
        std::fs::write(dir.path().join(SERVER_KEY_FILE), cert.serialize_private_key_pem()).unwrap();

        let bundle = CertBundle::load(dir.path()).unwrap();
        assert_eq!(bundle.chain.len(), 2);
        assert!(bundle.into_acceptor().is_ok());
    }

    #[test]
    fn test_garbage_pem_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pem");
        std::fs::write(&path, "not a pem").unwrap();
        assert!(load_certs(&path).is_err());
        assert!(load_key(&path).is_err());
    }
}
