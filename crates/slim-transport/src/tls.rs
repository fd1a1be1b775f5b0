//! TLS/mTLS support for SLIM connections.
//!
//! Builds rustls client and server configurations from a [`TlsConfig`].
//! Certificates and keys are read from PEM files; the ring provider is used
//! explicitly so the transport does not depend on a process-wide default.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme, SupportedProtocolVersion};

use crate::config::{TlsConfig, TlsVersion};
use crate::error::{Result, TransportError};

pub use tokio_rustls::TlsAcceptor as TlsAcceptorInner;
pub use tokio_rustls::TlsConnector as TlsConnectorInner;

/// Well-known CA bundle locations probed when the system pool is requested.
const SYSTEM_CA_BUNDLES: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/ssl/cert.pem",
    "/usr/local/etc/openssl/cert.pem",
];

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn protocol_versions(version: TlsVersion) -> &'static [&'static SupportedProtocolVersion] {
    static TLS12: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
    static TLS13: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];
    match version {
        TlsVersion::Tls12 => TLS12,
        TlsVersion::Tls13 => TLS13,
    }
}

fn tls_err(context: &str, e: impl fmt::Display) -> TransportError {
    TransportError::TlsError {
        reason: format!("{}: {}", context, e),
    }
}

/// Client-side TLS connector.
#[derive(Clone)]
pub struct TlsConnector {
    inner: TlsConnectorInner,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector").finish()
    }
}

impl TlsConnector {
    /// Creates a connector from configuration. `config.insecure` must be false.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let provider = provider();
        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(protocol_versions(config.tls_version))
            .map_err(|e| tls_err("unsupported protocol version", e))?;

        let builder = if config.insecure_skip_verify {
            tracing::warn!("TLS server certificate verification disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification { provider }))
        } else {
            builder.with_root_certificates(root_store(config)?)
        };

        let client_config = match (&config.cert_file, &config.key_file) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
                .map_err(|e| tls_err("failed to set client certificate", e))?,
            _ => builder.with_no_client_auth(),
        };

        Ok(Self {
            inner: TlsConnectorInner::from(Arc::new(client_config)),
        })
    }

    /// Runs the client handshake over an existing stream.
    pub async fn connect<IO>(
        &self,
        domain: &str,
        stream: IO,
    ) -> Result<tokio_rustls::client::TlsStream<IO>>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let domain = if let Ok(ip) = domain.parse::<std::net::IpAddr>() {
            ServerName::IpAddress(ip.into())
        } else {
            ServerName::try_from(domain.to_string()).map_err(|e| tls_err("invalid domain", e))?
        };
        self.inner
            .connect(domain, stream)
            .await
            .map_err(|e| tls_err("TLS handshake failed", e))
    }
}

/// Server-side TLS acceptor.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: TlsAcceptorInner,
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor").finish()
    }
}

impl TlsAcceptor {
    /// Creates an acceptor. Client certificates are required when `ca_file` is set.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let provider = provider();
        let (cert, key) = match (&config.cert_file, &config.key_file) {
            (Some(cert), Some(key)) => (cert, key),
            _ => {
                return Err(TransportError::TlsError {
                    reason: "server TLS requires cert_file and key_file".to_string(),
                })
            }
        };

        let builder = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(protocol_versions(config.tls_version))
            .map_err(|e| tls_err("unsupported protocol version", e))?;

        let builder = match &config.ca_file {
            Some(ca) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(ca)? {
                    roots
                        .add(cert)
                        .map_err(|e| tls_err("failed to add CA cert", e))?;
                }
                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .build()
                    .map_err(|e| tls_err("failed to build client verifier", e))?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let server_config = builder
            .with_single_cert(load_certs(cert)?, load_private_key(key)?)
            .map_err(|e| tls_err("failed to set server cert", e))?;

        Ok(Self {
            inner: TlsAcceptorInner::from(Arc::new(server_config)),
        })
    }

    /// Runs the server handshake over an accepted stream.
    pub async fn accept<IO>(&self, stream: IO) -> Result<tokio_rustls::server::TlsStream<IO>>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        self.inner
            .accept(stream)
            .await
            .map_err(|e| tls_err("TLS handshake failed", e))
    }
}

fn root_store(config: &TlsConfig) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    if let Some(ca) = &config.ca_file {
        for cert in load_certs(ca)? {
            roots
                .add(cert)
                .map_err(|e| tls_err("failed to add CA cert", e))?;
        }
    }
    if config.include_system_ca_certs_pool {
        let (added, ignored) = roots.add_parsable_certificates(system_certs());
        tracing::debug!(added, ignored, "loaded system CA certificates");
    }
    if roots.is_empty() {
        return Err(TransportError::TlsError {
            reason: "no trusted CA certificates configured".to_string(),
        });
    }
    Ok(roots)
}

fn system_certs() -> Vec<CertificateDer<'static>> {
    let env_bundle = std::env::var_os("SSL_CERT_FILE");
    let candidates = env_bundle
        .iter()
        .map(|p| Path::new(p))
        .chain(SYSTEM_CA_BUNDLES.iter().map(Path::new));
    for path in candidates {
        if let Ok(certs) = load_certs(path) {
            return certs;
        }
    }
    Vec::new()
}

/// Loads every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)?;
    load_certs_from_pem(&pem)
}

/// Loads certificates from PEM-encoded data.
pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut cursor = std::io::Cursor::new(pem);
    let certs = rustls_pemfile::certs(&mut cursor)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_err("invalid certificate PEM", e))?;
    if certs.is_empty() {
        return Err(TransportError::TlsError {
            reason: "no certificates found in PEM".to_string(),
        });
    }
    Ok(certs)
}

/// Loads the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)?;
    load_private_key_from_pem(&pem)
}

/// Loads a private key from PEM-encoded data.
pub fn load_private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    rustls_pemfile::private_key(&mut cursor)
        .map_err(|e| tls_err("invalid private key PEM", e))?
        .ok_or_else(|| TransportError::TlsError {
            reason: "no private key found in PEM".to_string(),
        })
}

/// Accepts any server certificate while still checking handshake signatures.
#[derive(Debug)]
struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
pub(crate) mod test_certs {
    use std::io::Write;
    use std::path::PathBuf;

    use tempfile::NamedTempFile;

    /// CA, server and client PEM files kept alive for the duration of a test.
    pub struct TestPki {
        pub ca: NamedTempFile,
        pub server_cert: NamedTempFile,
        pub server_key: NamedTempFile,
        pub client_cert: NamedTempFile,
        pub client_key: NamedTempFile,
    }

    fn write_pem(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::with_suffix(".pem").unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    pub fn path(file: &NamedTempFile) -> Option<PathBuf> {
        Some(file.path().to_path_buf())
    }

    pub fn generate() -> TestPki {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::default();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let server_key = rcgen::KeyPair::generate().unwrap();
        let server_cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .signed_by(&server_key, &ca_cert, &ca_key)
            .unwrap();

        let client_key = rcgen::KeyPair::generate().unwrap();
        let client_cert = rcgen::CertificateParams::new(vec!["client".to_string()])
            .unwrap()
            .signed_by(&client_key, &ca_cert, &ca_key)
            .unwrap();

        TestPki {
            ca: write_pem(&ca_cert.pem()),
            server_cert: write_pem(&server_cert.pem()),
            server_key: write_pem(&server_key.serialize_pem()),
            client_cert: write_pem(&client_cert.pem()),
            client_key: write_pem(&client_key.serialize_pem()),
        }
    }
}
