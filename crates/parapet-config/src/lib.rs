//! Configuration management for parapet
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. CLI arguments (highest precedence, applied by the binary)
//! 2. Environment variables (PARAPET_* prefix, `__` between sections)
//! 3. parapet.local.toml (gitignored, local overrides)
//! 4. parapet.toml (project config)
//! 5. ~/.config/parapet/config.toml (user defaults)
//! 6. Built-in defaults (lowest precedence)

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use parapet_server::{Balance, ServerConfig, TlsEngine};
use serde::{Deserialize, Serialize};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Port the server listens on when nothing else is configured.
pub const DEFAULT_PORT: u16 = 8081;

/// Main parapet configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParapetConfig {
    pub server: ListenConfig,
    pub tls: TlsConfig,
    pub limits: LimitsConfig,
    pub workers: WorkersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub shutdown_timeout_secs: u64,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            backlog: parapet_server::DEFAULT_BACKLOG,
            shutdown_timeout_secs: parapet_server::DEFAULT_SHUTDOWN_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Must be set here or on the command line before the server can start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<TlsEngine>,
    pub subject_alt_names: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            engine: None,
            subject_alt_names: vec!["localhost".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_message_size: usize,
    pub max_head_size: usize,
    pub read_buffer_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: parapet_server::DEFAULT_MAX_MESSAGE_SIZE,
            max_head_size: parapet_http::DEFAULT_MAX_HEAD_SIZE,
            read_buffer_size: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Defaults to the available parallelism.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub io_workers: Option<usize>,
    /// Defaults to the available parallelism.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake_workers: Option<usize>,
    pub handshake_queue_capacity: usize,
    pub balance: Balance,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            io_workers: None,
            handshake_workers: None,
            handshake_queue_capacity: 1024,
            balance: Balance::default(),
        }
    }
}

impl ParapetConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// The socket address built from `server.host` and `server.port`.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.server.host.parse().map_err(|_| {
            ConfigError::ValidationError(format!(
                "server.host '{}' is not an IP address",
                self.server.host
            ))
        })?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    /// Converts into a validated [`ServerConfig`].
    pub fn to_server_config(&self) -> Result<ServerConfig, ConfigError> {
        let engine = self.tls.engine.ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "no TLS engine selected (expected one of: {})",
                TlsEngine::ALL.map(TlsEngine::as_str).join(", ")
            ))
        })?;

        let mut config = ServerConfig::new(self.bind_addr()?, engine)
            .with_backlog(self.server.backlog)
            .with_shutdown_timeout(Duration::from_secs(self.server.shutdown_timeout_secs))
            .with_subject_alt_names(self.tls.subject_alt_names.clone())
            .with_max_message_size(self.limits.max_message_size)
            .with_max_head_size(self.limits.max_head_size)
            .with_read_buffer_size(self.limits.read_buffer_size)
            .with_handshake_queue_capacity(self.workers.handshake_queue_capacity)
            .with_balance(self.workers.balance);
        if let Some(count) = self.workers.io_workers {
            config = config.with_io_workers(count);
        }
        if let Some(count) = self.workers.handshake_workers {
            config = config.with_handshake_workers(count);
        }

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(config)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ParapetConfig::default();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.server.backlog, 15 * 1024);
        assert_eq!(config.limits.max_message_size, 1024 * 1024);
        assert!(config.tls.engine.is_none());
        assert_eq!(config.workers.balance, Balance::RoundRobin);
    }

    #[test]
    fn test_server_config_requires_engine() {
        let err = ParapetConfig::default()
            .to_server_config()
            .expect_err("engine is unset");
        assert!(err.to_string().contains("aws-lc-rs, ring"));
    }

    #[test]
    fn test_server_config_conversion() {
        let mut config = ParapetConfig::default();
        config.tls.engine = Some(TlsEngine::Ring);
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 9443;
        config.workers.io_workers = Some(3);
        config.workers.balance = Balance::LeastLoaded;

        let server = config.to_server_config().expect("valid config");
        assert_eq!(server.bind_addr, "127.0.0.1:9443".parse().expect("addr"));
        assert_eq!(server.tls_engine, TlsEngine::Ring);
        assert_eq!(server.io_workers, 3);
        assert_eq!(server.balance, Balance::LeastLoaded);
        assert_eq!(server.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = ParapetConfig::default();
        config.tls.engine = Some(TlsEngine::AwsLcRs);
        config.limits.max_message_size = 0;
        assert!(matches!(
            config.to_server_config(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = ParapetConfig::default();
        config.tls.engine = Some(TlsEngine::AwsLcRs);
        config.server.host = "not-an-ip".to_string();
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_toml_rendering() {
        let mut config = ParapetConfig::default();
        config.tls.engine = Some(TlsEngine::AwsLcRs);
        let rendered = config.to_toml().expect("serializable");
        assert!(rendered.contains("engine = \"aws-lc-rs\""));
        assert!(rendered.contains("port = 8081"));
        assert!(!rendered.contains("io_workers"));
    }
}
