//! Configuration loader with file and environment variable support.

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths, first hit wins.
const CONFIG_PATHS: &[&str] = &[
    "conveyor.toml",
    "config.toml",
    "./config/conveyor.toml",
    "/etc/conveyor/config.toml",
];

/// Loads [`AppConfig`] from a TOML file (when one is found) and applies
/// `CONVEYOR_AMQP_*` environment overrides on top.
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Loader pinned to a specific config file.
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        CONFIG_PATHS
            .iter()
            .copied()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        if let Ok(host) = env::var("CONVEYOR_AMQP_HOST") {
            config.connection.host = host;
        }
        if let Ok(port) = env::var("CONVEYOR_AMQP_PORT") {
            if let Ok(port) = port.parse() {
                config.connection.port = port;
            }
        }
        if let Ok(login) = env::var("CONVEYOR_AMQP_LOGIN") {
            config.connection.login = login;
        }
        if let Ok(password) = env::var("CONVEYOR_AMQP_PASSWORD") {
            config.connection.password = password;
        }
        if let Ok(vhost) = env::var("CONVEYOR_AMQP_VHOST") {
            config.connection.vhost = vhost;
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
