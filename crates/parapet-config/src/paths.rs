//! Where configuration files live.

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Project configuration file, usually checked in.
pub const PROJECT_FILE: &str = "parapet.toml";

/// Machine-local overrides, usually gitignored.
pub const LOCAL_FILE: &str = "parapet.local.toml";

/// Per-user defaults, inside the XDG config directory.
pub const USER_FILE: &str = "config.toml";

/// Resolves configuration file locations.
#[derive(Debug, Clone)]
pub struct Paths {
    user_dir: Option<PathBuf>,
}

impl Paths {
    /// Discovers the XDG user config directory (`~/.config/parapet` on Linux).
    pub fn new() -> Self {
        Self {
            user_dir: ProjectDirs::from("rs", "parapet", "parapet")
                .map(|dirs| dirs.config_dir().to_path_buf()),
        }
    }

    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        self.user_dir
            .as_ref()
            .map(|dir| dir.join(USER_FILE))
            .ok_or_else(|| ConfigError::XdgError("no home directory for user config".to_string()))
    }

    pub fn project_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join(PROJECT_FILE)
    }

    pub fn local_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join(LOCAL_FILE)
    }

    /// Files in `project_dir` in increasing precedence.
    pub fn project_files(project_dir: impl AsRef<Path>) -> [PathBuf; 2] {
        [
            Self::project_config_file(&project_dir),
            Self::local_config_file(&project_dir),
        ]
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
