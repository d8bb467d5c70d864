//! Configuration loader with multi-source merging

use crate::{ConfigError, ParapetConfig, Paths};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    user_config: bool,
    env_vars: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "PARAPET".to_string(),
            user_config: true,
            env_vars: None,
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "PARAPET")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skip ~/.config/parapet/config.toml
    pub fn without_user_config(mut self) -> Self {
        self.user_config = false;
        self
    }

    /// Read variables from `vars` instead of the process environment
    pub fn with_env_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.env_vars = Some(vars);
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<ParapetConfig, ConfigError> {
        let toml_file = |path: PathBuf| {
            config::File::from(path)
                .required(false)
                .format(config::FileFormat::Toml)
        };
        let mut builder = config::Config::builder();

        // 1. Built-in defaults
        builder = builder.add_source(config::Config::try_from(&ParapetConfig::default())?);

        // 2. User config (~/.config/parapet/config.toml)
        let user_config_file = self
            .user_config
            .then(|| Paths::new().user_config_file().ok())
            .flatten();
        if let Some(user_config_file) = user_config_file {
            builder = builder.add_source(toml_file(user_config_file));
        }

        // 3-4. parapet.toml, then parapet.local.toml
        for file in Paths::project_files(&self.project_dir) {
            builder = builder.add_source(toml_file(file));
        }

        // 5. Environment variables (PARAPET_SERVER__PORT=9443)
        let environment = config::Environment::with_prefix(&self.env_prefix)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("tls.subject_alt_names")
            .source(
                self.env_vars
                    .map(|vars| vars.into_iter().collect::<config::Map<String, String>>()),
            );
        builder = builder.add_source(environment);

        let config: ParapetConfig = builder.build()?.try_deserialize()?;
        tracing::debug!(
            project_dir = %self.project_dir.display(),
            port = config.server.port,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(self) -> ParapetConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parapet_server::{Balance, TlsEngine};
    use std::fs;
    use tempfile::tempdir;

    fn loader(dir: &Path) -> ConfigLoader {
        ConfigLoader::new()
            .with_project_dir(dir)
            .without_user_config()
            .with_env_vars(HashMap::new())
    }

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = loader(temp_dir.path()).load().expect("Failed to load config");

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8081);
        assert!(config.tls.engine.is_none());
        assert_eq!(config.tls.subject_alt_names, vec!["localhost".to_string()]);
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[server]
port = 9443
backlog = 128

[tls]
engine = "ring"
subject_alt_names = ["localhost", "parapet.test"]

[workers]
io_workers = 2
balance = "least-loaded"
"#;
        fs::write(project_dir.join("parapet.toml"), config_content)
            .expect("Failed to write config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.server.port, 9443);
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.tls.engine, Some(TlsEngine::Ring));
        assert_eq!(config.tls.subject_alt_names.len(), 2);
        assert_eq!(config.workers.io_workers, Some(2));
        assert_eq!(config.workers.balance, Balance::LeastLoaded);
        // Untouched keys keep their defaults.
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn test_local_overrides() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("parapet.toml"),
            "[server]\nport = 9000\nhost = \"127.0.0.1\"\n",
        )
        .expect("Failed to write project config");
        fs::write(project_dir.join("parapet.local.toml"), "[server]\nport = 9999\n")
            .expect("Failed to write local config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_environment_overrides_files() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        fs::write(project_dir.join("parapet.toml"), "[server]\nport = 9000\n")
            .expect("Failed to write project config");

        let vars = HashMap::from([
            ("PARAPET_SERVER__PORT".to_string(), "7443".to_string()),
            ("PARAPET_TLS__ENGINE".to_string(), "aws-lc-rs".to_string()),
            (
                "PARAPET_LIMITS__MAX_MESSAGE_SIZE".to_string(),
                "4096".to_string(),
            ),
            ("OTHER_SERVER__PORT".to_string(), "1".to_string()),
        ]);
        let config = ConfigLoader::new()
            .with_project_dir(project_dir)
            .without_user_config()
            .with_env_vars(vars)
            .load()
            .expect("Failed to load config");

        assert_eq!(config.server.port, 7443);
        assert_eq!(config.tls.engine, Some(TlsEngine::AwsLcRs));
        assert_eq!(config.limits.max_message_size, 4096);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        fs::write(project_dir.join("parapet.toml"), "[server\nport = ")
            .expect("Failed to write project config");

        let err = loader(project_dir).load().expect_err("malformed TOML");
        assert!(matches!(err, ConfigError::MergeError(_)));
    }

    #[test]
    fn test_unknown_engine_is_an_error() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        fs::write(project_dir.join("parapet.toml"), "[tls]\nengine = \"openssl\"\n")
            .expect("Failed to write project config");

        assert!(loader(project_dir).load().is_err());
    }
}
