//! Routing node configuration file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use slim_transport::{load_config, ClientConfig, ServerConfig};

/// Node configuration, loaded from `.toml` or `.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Listeners to start.
    pub servers: Vec<ServerConfig>,
    /// Peers to dial once the listeners are up.
    pub clients: Vec<ClientConfig>,
    /// `EnvFilter` directives; `RUST_LOG` applies when unset.
    pub log_filter: Option<String>,
}

impl NodeConfig {
    /// Loads and validates a node configuration.
    pub fn from_file(path: &Path) -> slim_transport::Result<Self> {
        let config: Self = load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every server and client entry.
    pub fn validate(&self) -> slim_transport::Result<()> {
        for server in &self.servers {
            server.validate()?;
        }
        for client in &self.clients {
            client.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_toml_config() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
log_filter = "debug"

[[servers]]
endpoint = "127.0.0.1:46357"
tls = {{ insecure = true }}

[[clients]]
endpoint = "10.0.0.2:46357"
tls = {{ insecure = true }}
"#
        )
        .unwrap();
        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.clients[0].endpoint, "10.0.0.2:46357");
        assert_eq!(config.log_filter.as_deref(), Some("debug"));
    }

    #[test]
    fn test_json_defaults() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(file, "{{}}").unwrap();
        assert_eq!(NodeConfig::from_file(file.path()).unwrap(), NodeConfig::default());
    }

    #[test]
    fn test_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(NodeConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(
            file,
            r#"{{"clients": [{{"endpoint": "nowhere", "tls": {{"insecure": true}}}}]}}"#
        )
        .unwrap();
        assert!(NodeConfig::from_file(file.path()).is_err());
    }
}
