//! Configuration structures for split-relay.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Relay tuning.
    #[serde(default)]
    pub relay: RelayConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path, e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path, e)))
    }
}

/// Server binding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// SOCKS5 proxy port. Port 0 binds an ephemeral port.
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            socks_port: default_socks_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_socks_port() -> u16 {
    1080
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional).
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Relay tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Per-direction relay buffer size in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Idle timeout for a relayed session in seconds.
    ///
    /// RFC 5382 REQ-5 requires a timeout no shorter than 2 hours and
    /// 4 minutes for NAT-bound sessions.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Outbound connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Synthesize a connection reset after the first upload chunk on
    /// eligible connections. Used to validate retry logic
    /// deterministically; never set in production.
    #[serde(skip)]
    pub simulate_reset: bool,
}

impl RelayConfig {
    /// Idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            idle_timeout_secs: default_idle_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            simulate_reset: false,
        }
    }
}

fn default_buffer_size() -> usize {
    8192
}

fn default_idle_timeout() -> u64 {
    60 * (4 + 60 * 2)
}

fn default_connect_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.server.socks_port, 1080);
        assert_eq!(config.relay.buffer_size, 8192);
        assert_eq!(config.relay.idle_timeout_secs, 7440);
        assert!(!config.relay.simulate_reset);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            socks_port = 9050
            "#,
        )
        .unwrap();
        assert_eq!(config.server.socks_port, 9050);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.relay.connect_timeout_secs, 30);
    }
}
