//! Session Configuration
//!
//! Tunables for the session controller. Loaded from TOML or JSON, every
//! field optional:
//!
//! ```toml
//! poll_interval_ms = 1000
//! teardown_timeout_ms = 5000
//! default_port = 1194
//! engine_order = ["native", "os_framework", "simulated"]
//! session_name = "OpenVPN"
//! simulated_local_address = "10.8.0.2"
//! ```

use crate::engine::EngineKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Polls faster than this would flood subscribers
pub const MIN_POLL_INTERVAL_MS: u64 = 100;

/// Session tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Stats poll period while connected
    pub poll_interval_ms: u64,
    /// How long to wait for an engine to confirm teardown
    pub teardown_timeout_ms: u64,
    /// Port assumed when the profile's `remote` line has none
    pub default_port: u16,
    /// Engine probing order
    pub engine_order: Vec<EngineKind>,
    /// Tunnel label used when the caller gives none
    pub session_name: String,
    /// Address the simulated engine reports for our end
    pub simulated_local_address: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            teardown_timeout_ms: 5000,
            default_port: crate::profile::DEFAULT_PORT,
            engine_order: EngineKind::priority_order().to_vec(),
            session_name: "OpenVPN".into(),
            simulated_local_address: "10.8.0.2".into(),
        }
    }
}

impl SessionConfig {
    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config = match ext {
            "toml" => Self::from_toml(&content)?,
            "json" => Self::from_json(&content)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Export as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(ConfigError::PollIntervalTooShort(self.poll_interval_ms));
        }
        if self.teardown_timeout_ms == 0 {
            return Err(ConfigError::ZeroTeardownTimeout);
        }
        if self.default_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.engine_order.is_empty() {
            return Err(ConfigError::EmptyEngineOrder);
        }

        let mut seen = HashSet::new();
        for kind in &self.engine_order {
            if !seen.insert(*kind) {
                return Err(ConfigError::DuplicateEngine(*kind));
            }
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Poll interval too short: {0}ms (minimum 100ms)")]
    PollIntervalTooShort(u64),

    #[error("Teardown timeout must be non-zero")]
    ZeroTeardownTimeout,

    #[error("Invalid default port")]
    InvalidPort,

    #[error("Engine order is empty")]
    EmptyEngineOrder,

    #[error("Engine listed twice: {0}")]
    DuplicateEngine(EngineKind),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format: '{0}'")]
    UnsupportedFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SessionConfig::default();

        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.default_port, 1194);
        assert_eq!(config.session_name, "OpenVPN");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = SessionConfig::from_toml(
            r#"
            poll_interval_ms = 250
            engine_order = ["simulated"]
            "#,
        )
        .unwrap();

        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.engine_order, vec![EngineKind::Simulated]);
        assert_eq!(config.teardown_timeout_ms, 5000);
    }

    #[test]
    fn test_json() {
        let config =
            SessionConfig::from_json(r#"{"session_name": "Work VPN", "default_port": 443}"#)
                .unwrap();
        assert_eq!(config.session_name, "Work VPN");
        assert_eq!(config.default_port, 443);
    }

    #[test]
    fn test_toml_export_reloads() {
        let mut config = SessionConfig::default();
        config.engine_order = vec![EngineKind::OsFramework, EngineKind::Simulated];

        let reloaded = SessionConfig::from_toml(&config.to_toml()).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_unknown_engine_rejected() {
        let err = SessionConfig::from_toml(r#"engine_order = ["wireguard"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validation() {
        let config = SessionConfig { poll_interval_ms: 50, ..SessionConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::PollIntervalTooShort(50)));

        let config = SessionConfig { teardown_timeout_ms: 0, ..SessionConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::ZeroTeardownTimeout));

        let config = SessionConfig { engine_order: vec![], ..SessionConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::EmptyEngineOrder));

        let config = SessionConfig {
            engine_order: vec![EngineKind::Simulated, EngineKind::Simulated],
            ..SessionConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::DuplicateEngine(EngineKind::Simulated)));
    }

    #[test]
    fn test_unsupported_extension() {
        let path = std::env::temp_dir().join("tunnelkit-config-test.yaml");
        std::fs::write(&path, "poll_interval_ms: 100").unwrap();

        let err = SessionConfig::from_file(&path).unwrap_err();
        assert_eq!(err, ConfigError::UnsupportedFormat("yaml".into()));

        let _ = std::fs::remove_file(path);
    }
}
