//! Session configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SlimError};

/// Default number of retransmissions after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Default wait for an acknowledgement before retransmitting.
pub const DEFAULT_INTERVAL_MS: u64 = 1000;
/// Capacity of each session's receive queue.
pub const RECEIVE_QUEUE_CAPACITY: usize = 1024;

/// Session kind. Discriminants are stable across the foreign boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    /// Two participants.
    #[default]
    PointToPoint,
    /// Moderated group of any size.
    Group,
}

impl SessionType {
    /// Stable integer code for foreign callers.
    pub fn discriminant(self) -> i32 {
        match self {
            SessionType::PointToPoint => 1,
            SessionType::Group => 2,
        }
    }

    /// Inverse of [`SessionType::discriminant`].
    pub fn from_discriminant(d: i32) -> Option<Self> {
        match d {
            1 => Some(SessionType::PointToPoint),
            2 => Some(SessionType::Group),
            _ => None,
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, not yet handshaking.
    Init,
    /// Waiting for the peer to accept.
    Handshaking,
    /// Open for traffic.
    Established,
    /// Close in progress.
    Closing,
    /// Terminal.
    Closed,
}

/// Per-session settings chosen by the creator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Point-to-point or group.
    pub session_type: SessionType,
    /// Retransmissions after the first attempt.
    pub max_retries: u32,
    /// Wait for an acknowledgement before retransmitting.
    pub interval_ms: u64,
    /// Encrypt payloads end to end.
    pub mls_enabled: bool,
    /// Sent to the peer with the handshake.
    pub metadata: HashMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_type: SessionType::PointToPoint,
            max_retries: DEFAULT_MAX_RETRIES,
            interval_ms: DEFAULT_INTERVAL_MS,
            mls_enabled: false,
            metadata: HashMap::new(),
        }
    }
}

impl SessionConfig {
    /// Default point-to-point settings.
    pub fn point_to_point() -> Self {
        Self::default()
    }

    /// Default group settings.
    pub fn group() -> Self {
        Self {
            session_type: SessionType::Group,
            ..Self::default()
        }
    }

    /// Sets the retry budget and interval.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, interval_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.interval_ms = interval_ms;
        self
    }

    /// Turns payload encryption on or off.
    #[must_use]
    pub fn with_mls(mut self, enabled: bool) -> Self {
        self.mls_enabled = enabled;
        self
    }

    /// Retransmission interval as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Total sends per reliable request: the first attempt plus retries.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Rejects a zero interval.
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(SlimError::InvalidArgument(
                "interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Loads a session config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SlimError::InvalidArgument(format!("{}: {}", path.display(), e)))?;
        let config: SessionConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .map_err(|e| SlimError::InvalidArgument(e.to_string()))?,
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| SlimError::InvalidArgument(e.to_string()))?,
            other => {
                return Err(SlimError::InvalidArgument(format!(
                    "unsupported config format: {:?}",
                    other
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.interval_ms, 1000);
        assert!(!config.mls_enabled);
        assert_eq!(config.attempts(), 6);
    }

    #[test]
    fn test_session_type_discriminants() {
        assert_eq!(SessionType::PointToPoint.discriminant(), 1);
        assert_eq!(SessionType::Group.discriminant(), 2);
        assert_eq!(SessionType::from_discriminant(2), Some(SessionType::Group));
        assert_eq!(SessionType::from_discriminant(3), None);
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "session_type = \"group\"\nmax_retries = 2\nmls_enabled = true\n[metadata]\nteam = \"blue\""
        )
        .unwrap();
        let config = SessionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.session_type, SessionType::Group);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.interval_ms, 1000);
        assert_eq!(config.metadata.get("team").map(String::as_str), Some("blue"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = SessionConfig::default().with_retries(1, 0);
        assert!(matches!(
            config.validate(),
            Err(SlimError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(SessionConfig::from_file(file.path()).is_err());
    }
}
