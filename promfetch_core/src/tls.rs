//! TLS settings of outbound clients.
//!
//! Targets and Consul are trusted through the bundled webpki roots, plus any CA
//! certificates configured here.

use rustls::internal::pemfile;
use rustls::{
    Certificate, ClientConfig, PrivateKey, RootCertStore, ServerCertVerified, ServerCertVerifier,
    TLSError,
};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("error while adding ca certs to the cert pool: no certificate found")]
    InvalidCa,

    #[error("error loading key pair: {0}")]
    InvalidKeyPair(String),

    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// PEM encoded trust and identity of a client
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    /// CA certificates trusted along with the bundled roots
    pub ca_certs: Option<String>,

    /// Client certificate chain, only sent when `private_key` is set too
    pub cert_chain: Option<String>,

    pub private_key: Option<String>,

    pub skip_ssl_validation: bool,
}

impl TlsConfig {
    pub fn client_config(&self) -> Result<ClientConfig, TlsError> {
        let mut config = ClientConfig::new();
        config
            .root_store
            .add_server_trust_anchors(&webpki_roots::TLS_SERVER_ROOTS);

        if let Some(pem) = non_empty(&self.ca_certs) {
            let mut reader = pem.as_bytes();
            let (added, _) = config
                .root_store
                .add_pem_file(&mut reader)
                .map_err(|_| TlsError::InvalidCa)?;
            if added == 0 {
                return Err(TlsError::InvalidCa);
            }
        }

        if let (Some(chain), Some(key)) = (non_empty(&self.cert_chain), non_empty(&self.private_key)) {
            let certs = certificates(chain)?;
            let key = private_key(key)?;
            config
                .set_single_client_cert(certs, key)
                .map_err(|err| TlsError::InvalidKeyPair(err.to_string()))?;
        }

        if self.skip_ssl_validation {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoCertificateVerification));
        }
        Ok(config)
    }
}

/// TLS files of the Consul agent connection
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsulTls {
    /// Path to a PEM file of CA certificates
    pub ca: Option<String>,

    /// Path to a PEM client certificate, used along with `key`
    pub cert: Option<String>,

    pub key: Option<String>,

    pub skip_ssl_validation: bool,
}

impl ConsulTls {
    /// Reads the configured files.
    pub fn load(&self) -> Result<TlsConfig, TlsError> {
        let (cert_chain, private_key) =
            match (non_empty(&self.cert), non_empty(&self.key)) {
                (Some(cert), Some(key)) => (Some(read(cert)?), Some(read(key)?)),
                _ => (None, None),
            };
        Ok(TlsConfig {
            ca_certs: non_empty(&self.ca).map(read).transpose()?,
            cert_chain,
            private_key,
            skip_ssl_validation: self.skip_ssl_validation,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.trim().is_empty())
}

fn read(path: &str) -> Result<String, TlsError> {
    std::fs::read_to_string(path).map_err(|source| TlsError::Read {
        path: path.to_owned(),
        source,
    })
}

fn certificates(pem: &str) -> Result<Vec<Certificate>, TlsError> {
    let mut reader = pem.as_bytes();
    let certs = pemfile::certs(&mut reader)
        .map_err(|_| TlsError::InvalidKeyPair("invalid certificate chain".to_owned()))?;
    if certs.is_empty() {
        return Err(TlsError::InvalidKeyPair("no certificate found".to_owned()));
    }
    Ok(certs)
}

fn private_key(pem: &str) -> Result<PrivateKey, TlsError> {
    let invalid = |_| TlsError::InvalidKeyPair("invalid private key".to_owned());
    let mut keys = pemfile::pkcs8_private_keys(&mut pem.as_bytes()).map_err(invalid)?;
    if keys.is_empty() {
        keys = pemfile::rsa_private_keys(&mut pem.as_bytes()).map_err(invalid)?;
    }
    keys.into_iter()
        .next()
        .ok_or_else(|| TlsError::InvalidKeyPair("no private key found".to_owned()))
}

/// Accepts any server certificate, for `skip_ssl_validation`
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _roots: &RootCertStore,
        _presented_certs: &[Certificate],
        _dns_name: webpki::DNSNameRef<'_>,
        _ocsp_response: &[u8],
    ) -> Result<ServerCertVerified, TLSError> {
        Ok(ServerCertVerified::assertion())
    }
}
