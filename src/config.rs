//! Configuration as an immutable value, handed to each task once at
//! construction. Parsing a config *file* from disk, watching it for
//! changes, or validating an operator-facing schema is out of scope here;
//! this is just the value shape plus a convenience constructor from a TOML
//! string, which the deploying binary is free to wire up however it likes.

use std::time::Duration;

use serde::Deserialize;

use crate::error::GatewayError;
use crate::model::LinkRole;

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    pub id: u16,
    pub path: String,
    pub baud: u32,
    pub role: LinkRoleConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkRoleConfig {
    Direct,
    Primary,
}

impl From<LinkRoleConfig> for LinkRole {
    fn from(v: LinkRoleConfig) -> Self {
        match v {
            LinkRoleConfig::Direct => LinkRole::Direct,
            LinkRoleConfig::Primary => LinkRole::Primary,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorrelatorSettings {
    #[serde(default = "default_match_window_secs")]
    pub match_window_secs: u64,
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,
}

fn default_match_window_secs() -> u64 {
    10
}

fn default_pending_capacity() -> usize {
    4096
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            match_window_secs: default_match_window_secs(),
            pending_capacity: default_pending_capacity(),
        }
    }
}

impl CorrelatorSettings {
    pub fn match_window(&self) -> Duration {
        Duration::from_secs(self.match_window_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    pub db_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublisherSettings {
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_topic_prefix() -> String {
    "wirefree-gateway".to_string()
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            topic_prefix: default_topic_prefix(),
        }
    }
}

/// Top-level, immutable configuration handed to `Gateway::build`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub correlator: CorrelatorSettings,
    pub store: StoreSettings,
    #[serde(default)]
    pub publisher: PublisherSettings,
}

impl Config {
    /// Parses a TOML document already read from disk (or anywhere else) into
    /// a `Config`. Does not read files, watch paths, or merge environment
    /// overrides — that belongs to the binary composition root.
    pub fn from_toml_str(input: &str) -> Result<Self, GatewayError> {
        toml::from_str(input).map_err(|e| GatewayError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
            [[links]]
            id = 0
            path = "/dev/ttyUSB0"
            baud = 115200
            role = "direct"

            [[links]]
            id = 1
            path = "/dev/ttyUSB1"
            baud = 115200
            role = "primary"

            [store]
            db_path = "gateway.db"
        "#;
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.links.len(), 2);
        assert_eq!(config.links[0].role, LinkRoleConfig::Direct);
        assert_eq!(config.correlator.match_window_secs, 10);
        assert_eq!(config.publisher.topic_prefix, "wirefree-gateway");
    }
}
