//! Client and server endpoint configuration.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// TLS protocol version pinned for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TlsVersion {
    /// TLS 1.2 only.
    #[serde(rename = "tls1.2")]
    Tls12,
    /// TLS 1.3 only.
    #[default]
    #[serde(rename = "tls1.3")]
    Tls13,
}

impl TlsVersion {
    /// Parse the textual form used in configuration files.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "tls1.2" => Ok(TlsVersion::Tls12),
            "tls1.3" => Ok(TlsVersion::Tls13),
            other => Err(TransportError::InvalidConfig(format!(
                "unsupported tls version: {}",
                other
            ))),
        }
    }

    /// Configuration spelling: `"tls1.2"` or `"tls1.3"`.
    pub fn as_str(self) -> &'static str {
        match self {
            TlsVersion::Tls12 => "tls1.2",
            TlsVersion::Tls13 => "tls1.3",
        }
    }
}

/// TLS settings shared by clients and servers.
///
/// When `insecure` is set every other field is ignored and the connection
/// runs in plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Plaintext connection, no TLS at all.
    pub insecure: bool,
    /// Accept any server certificate. Client only, diagnostic use.
    pub insecure_skip_verify: bool,
    /// PEM certificate chain presented to the peer.
    pub cert_file: Option<PathBuf>,
    /// PEM private key matching `cert_file`.
    pub key_file: Option<PathBuf>,
    /// PEM CA bundle used to verify the peer.
    pub ca_file: Option<PathBuf>,
    /// Protocol version.
    pub tls_version: TlsVersion,
    /// Also trust the system certificate store.
    pub include_system_ca_certs_pool: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            insecure: false,
            insecure_skip_verify: false,
            cert_file: None,
            key_file: None,
            ca_file: None,
            tls_version: TlsVersion::Tls13,
            include_system_ca_certs_pool: true,
        }
    }
}

impl TlsConfig {
    /// Plaintext configuration.
    pub fn insecure() -> Self {
        Self {
            insecure: true,
            ..Default::default()
        }
    }

    /// Check field combinations that are valid for a client.
    pub fn validate_client(&self) -> Result<()> {
        if self.insecure {
            return Ok(());
        }
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(TransportError::InvalidConfig(
                "cert_file and key_file must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// Check field combinations that are valid for a server.
    pub fn validate_server(&self) -> Result<()> {
        if self.insecure {
            return Ok(());
        }
        if self.insecure_skip_verify {
            return Err(TransportError::InvalidConfig(
                "insecure_skip_verify is only valid for clients".to_string(),
            ));
        }
        if self.cert_file.is_none() || self.key_file.is_none() {
            return Err(TransportError::InvalidConfig(
                "server TLS requires cert_file and key_file".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outbound connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// `host:port`, optionally prefixed with `http://` or `https://`.
    pub endpoint: String,
    /// TLS settings; plaintext unless configured.
    #[serde(default)]
    pub tls: TlsConfig,
}

impl ClientConfig {
    /// Client for `endpoint` with explicit TLS settings.
    pub fn new(endpoint: impl Into<String>, tls: TlsConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            tls,
        }
    }

    /// Plaintext client for `endpoint`.
    pub fn insecure(endpoint: impl Into<String>) -> Self {
        Self::new(endpoint, TlsConfig::insecure())
    }

    /// Socket address without any scheme prefix.
    pub fn address(&self) -> &str {
        strip_scheme(&self.endpoint)
    }

    /// Checks the endpoint and the client-side TLS settings.
    pub fn validate(&self) -> Result<()> {
        validate_endpoint(&self.endpoint)?;
        self.tls.validate_client()
    }

    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: Self = load_config(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `host:port` to bind.
    pub endpoint: String,
    /// TLS settings; plaintext unless configured.
    #[serde(default)]
    pub tls: TlsConfig,
}

impl ServerConfig {
    /// Server on `endpoint` with explicit TLS settings.
    pub fn new(endpoint: impl Into<String>, tls: TlsConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            tls,
        }
    }

    /// Plaintext server on `endpoint`.
    pub fn insecure(endpoint: impl Into<String>) -> Self {
        Self::new(endpoint, TlsConfig::insecure())
    }

    /// Bind address without any scheme prefix.
    pub fn address(&self) -> &str {
        strip_scheme(&self.endpoint)
    }

    /// Checks the endpoint; TLS servers need a certificate and a key.
    pub fn validate(&self) -> Result<()> {
        validate_endpoint(&self.endpoint)?;
        self.tls.validate_server()
    }

    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: Self = load_config(path)?;
        config.validate()?;
        Ok(config)
    }
}

fn strip_scheme(endpoint: &str) -> &str {
    endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"))
        .unwrap_or(endpoint)
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
    let addr = strip_scheme(endpoint);
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(TransportError::InvalidConfig(format!(
            "invalid endpoint: {:?}",
            endpoint
        ))),
    }
}

/// Deserialize a configuration file, picking the format from its extension.
pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    match ext.to_lowercase().as_str() {
        "toml" => toml::from_str(&contents)
            .map_err(|e| TransportError::InvalidConfig(format!("{}: {}", path.display(), e))),
        "json" => serde_json::from_str(&contents)
            .map_err(|e| TransportError::InvalidConfig(format!("{}: {}", path.display(), e))),
        _ => Err(TransportError::InvalidConfig(format!(
            "unsupported config file extension: {}",
            ext
        ))),
    }
}
