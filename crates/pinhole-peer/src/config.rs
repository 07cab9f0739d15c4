//! Peer configuration shared by the producer and consumer CLIs.
//!
//! Resolution order: explicit `--config` path → `./pinhole-peer.toml` →
//! built-in defaults. The defaults point at a local signaller and public
//! STUN servers, so the tools work out of the box.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_FILE: &str = "pinhole-peer.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub signaller: SignallerEndpoint,
    pub stun: StunConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignallerEndpoint {
    pub url: String,
}

impl Default for SignallerEndpoint {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StunConfig {
    pub servers: Vec<String>,
    pub local_port: u16,
    pub timeout_secs: u64,
}

impl StunConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                "stun.nextcloud.com:3478".into(),
                "global.stun.twilio.com:3478".into(),
                "stun.l.google.com:19302".into(),
            ],
            local_port: 50000,
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

impl PeerConfig {
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit_path {
            Some(p) => p.to_path_buf(),
            None => {
                let p = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !p.exists() {
                    return Ok(Self::default());
                }
                p
            }
        };
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = PeerConfig::default();
        assert_eq!(config.signaller.url, "http://localhost:8080");
        assert_eq!(config.stun.servers.len(), 3);
        assert_eq!(config.stun.local_port, 50000);
        assert_eq!(config.stun.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config: PeerConfig =
            toml::from_str("[signaller]\nurl = \"http://signal.example:9000\"\n").unwrap();
        assert_eq!(config.signaller.url, "http://signal.example:9000");
        assert_eq!(config.stun.local_port, 50000);
    }
}
