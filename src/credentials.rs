//! Server credentials.
//!
//! Two variants: insecure (plaintext HTTP/2) and secure (TLS from raw PEM
//! buffers). Certificate parsing itself is delegated to `rustls-pemfile`;
//! this module only assembles the acceptor configuration.

use bytes::Bytes;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};

/// A private key and its certificate chain, both PEM-encoded.
#[derive(Debug, Clone)]
pub struct KeyCertPair {
    pub private_key: Bytes,
    pub cert_chain: Bytes,
}

/// Errors from building credentials or their TLS configuration.
#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("secure credentials require at least one key/certificate pair")]
    EmptyKeyCertPairs,
    #[error("invalid certificate chain: {0}")]
    InvalidCertChain(String),
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),
    #[error("invalid root certificates: {0}")]
    InvalidRootCerts(String),
    #[error("TLS configuration error: {0}")]
    Tls(String),
}

#[derive(Debug, Clone)]
enum Kind {
    Insecure,
    Secure(Arc<SecureOptions>),
}

#[derive(Debug)]
struct SecureOptions {
    root_certs: Option<Bytes>,
    key_cert_pairs: Vec<KeyCertPair>,
    check_client_certificate: bool,
}

/// Credentials presented by the server when binding a listener.
#[derive(Debug, Clone)]
pub struct ServerCredentials {
    kind: Kind,
}

impl ServerCredentials {
    /// Plaintext credentials.
    pub fn insecure() -> Self {
        Self {
            kind: Kind::Insecure,
        }
    }

    /// TLS credentials from PEM buffers. `root_certs` is only consulted when
    /// `check_client_certificate` is set; when omitted there, the file named
    /// by `GRPC_DEFAULT_SSL_ROOTS_FILE_PATH` is used instead.
    pub fn ssl(
        root_certs: Option<Bytes>,
        key_cert_pairs: Vec<KeyCertPair>,
        check_client_certificate: bool,
    ) -> Result<Self, CredentialsError> {
        if key_cert_pairs.is_empty() {
            return Err(CredentialsError::EmptyKeyCertPairs);
        }
        Ok(Self {
            kind: Kind::Secure(Arc::new(SecureOptions {
                root_certs,
                key_cert_pairs,
                check_client_certificate,
            })),
        })
    }

    /// Whether these credentials configure TLS.
    pub fn is_secure(&self) -> bool {
        matches!(self.kind, Kind::Secure(_))
    }

    /// Assemble the rustls server configuration, or None for insecure
    /// credentials.
    pub(crate) fn server_config(&self) -> Result<Option<Arc<ServerConfig>>, CredentialsError> {
        let options = match &self.kind {
            Kind::Insecure => return Ok(None),
            Kind::Secure(options) => options,
        };

        let pair = &options.key_cert_pairs[0];
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut pair.cert_chain.as_ref())
                .collect::<Result<_, _>>()
                .map_err(|e| CredentialsError::InvalidCertChain(e.to_string()))?;
        if certs.is_empty() {
            return Err(CredentialsError::InvalidCertChain(
                "no certificates found in PEM input".to_string(),
            ));
        }
        let key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut pair.private_key.as_ref())
                .map_err(|e| CredentialsError::InvalidPrivateKey(e.to_string()))?
                .ok_or_else(|| {
                    CredentialsError::InvalidPrivateKey("no private key found in PEM input".into())
                })?;

        let builder = ServerConfig::builder_with_provider(Arc::new(provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| CredentialsError::Tls(e.to_string()))?;

        let builder = if options.check_client_certificate {
            let roots = client_root_store(options.root_certs.as_ref())?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| CredentialsError::Tls(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let mut config = builder
            .with_single_cert(certs, key)
            .map_err(|e| CredentialsError::Tls(e.to_string()))?;
        config.alpn_protocols = vec![b"h2".to_vec()];
        Ok(Some(Arc::new(config)))
    }
}

/// The crypto provider, with the cipher-suite list narrowed by
/// `GRPC_SSL_CIPHER_SUITES` when set (colon-separated suite names).
fn provider() -> CryptoProvider {
    let mut provider = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider();
    if let Ok(list) = std::env::var("GRPC_SSL_CIPHER_SUITES") {
        let allowed: Vec<&str> = list.split(':').collect();
        let filtered: Vec<_> = provider
            .cipher_suites
            .iter()
            .copied()
            .filter(|s| allowed.contains(&format!("{:?}", s.suite()).as_str()))
            .collect();
        if filtered.is_empty() {
            tracing::error!(
                "GRPC_SSL_CIPHER_SUITES matched no supported suites, keeping defaults"
            );
        } else {
            provider.cipher_suites = filtered;
        }
    }
    provider
}

fn client_root_store(root_certs: Option<&Bytes>) -> Result<RootCertStore, CredentialsError> {
    let pem = match root_certs {
        Some(pem) => pem.clone(),
        None => default_roots()
            .ok_or_else(|| {
                CredentialsError::InvalidRootCerts(
                    "client certificate checking requires root certificates".to_string(),
                )
            })?
            .clone(),
    };
    let mut store = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_ref()) {
        let cert = cert.map_err(|e| CredentialsError::InvalidRootCerts(e.to_string()))?;
        store
            .add(cert)
            .map_err(|e| CredentialsError::InvalidRootCerts(e.to_string()))?;
    }
    if store.is_empty() {
        return Err(CredentialsError::InvalidRootCerts(
            "no root certificates found".to_string(),
        ));
    }
    Ok(store)
}

/// Default CA roots named by `GRPC_DEFAULT_SSL_ROOTS_FILE_PATH`, read once
/// per process.
fn default_roots() -> Option<&'static Bytes> {
    static ROOTS: OnceLock<Option<Bytes>> = OnceLock::new();
    ROOTS
        .get_or_init(|| {
            let path = std::env::var("GRPC_DEFAULT_SSL_ROOTS_FILE_PATH").ok()?;
            match std::fs::read(&path) {
                Ok(pem) => Some(Bytes::from(pem)),
                Err(e) => {
                    tracing::error!(path, "failed to read default root certificates: {}", e);
                    None
                }
            }
        })
        .as_ref()
}
