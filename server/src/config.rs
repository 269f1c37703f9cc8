//! Configuration management for the control plane server
//!
//! Mirrors the agent's `ConfigManager`: load (or default) `server.toml`,
//! merge in command-line overrides, validate, and persist the merged result.

use std::path::PathBuf;

use anyhow::{Context, Result};
use shared::ServerConfig;
use tracing::{debug, info};

const SERVER_CONFIG_FILE: &str = "server.toml";

pub struct ConfigManager {
    pub config_path: PathBuf,
    pub config: ServerConfig,
}

impl ConfigManager {
    /// `config_path` may point at a directory (in which case `server.toml`
    /// is appended) or directly at the config file.
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let config_path = if config_path.is_dir() {
            config_path.join(SERVER_CONFIG_FILE)
        } else {
            config_path
        };
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }
        let config = ServerConfig::load_or_default(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;

        debug!(
            listen_address = %config.listen_address,
            database_path = %config.database_path,
            "Server configuration loaded"
        );

        Ok(Self {
            config_path,
            config,
        })
    }

    pub fn reload(&mut self) -> Result<()> {
        let config = ServerConfig::load_or_default(&self.config_path)
            .with_context(|| format!("reloading {}", self.config_path.display()))?;
        self.config = config;
        info!("Server configuration reloaded from disk");
        Ok(())
    }

    /// Apply command-line overrides, persisting the merged result if
    /// anything changed. Returns `true` if the config file was rewritten.
    pub fn override_and_persist(
        &mut self,
        listen_address: Option<String>,
        api_key: Option<String>,
        database_path: Option<String>,
    ) -> Result<bool> {
        let mut changed = false;

        if let Some(addr) = listen_address {
            if self.config.listen_address != addr {
                info!(
                    "Overriding listen_address: {} -> {}",
                    self.config.listen_address, addr
                );
                self.config.listen_address = addr;
                changed = true;
            }
        }

        if let Some(key) = api_key {
            if self.config.api_key != key {
                info!("Overriding api_key (value hidden for security)");
                self.config.api_key = key;
                changed = true;
            }
        }

        if let Some(path) = database_path {
            if self.config.database_path != path {
                info!(
                    "Overriding database_path: {} -> {}",
                    self.config.database_path, path
                );
                self.config.database_path = path;
                changed = true;
            }
        }

        if changed {
            self.config
                .validate()
                .context("invalid configuration after applying command-line overrides")?;
            self.config
                .save(&self.config_path)
                .with_context(|| format!("writing {}", self.config_path.display()))?;
            info!("Server configuration updated and persisted to disk");
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn new_creates_default_config_when_missing() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(manager.config.api_key, "");
        assert!(!manager.config_path.exists());
    }

    #[test]
    fn new_accepts_direct_file_path() {
        let dir = TempDir::new().unwrap();
        let file_path = dir.path().join("custom.toml");
        let manager = ConfigManager::new(file_path.clone()).unwrap();
        assert_eq!(manager.config_path, file_path);
    }

    #[test]
    fn override_and_persist_writes_changed_api_key() {
        let dir = TempDir::new().unwrap();
        let mut manager = ConfigManager::new(dir.path().to_path_buf()).unwrap();
        let changed = manager
            .override_and_persist(None, Some("topsecret".to_string()), None)
            .unwrap();
        assert!(changed);
        assert!(manager.config_path.exists());

        let reloaded = ServerConfig::load_or_default(&manager.config_path).unwrap();
        assert_eq!(reloaded.api_key, "topsecret");
    }

    #[test]
    fn override_and_persist_is_noop_without_changes() {
        let dir = TempDir::new().unwrap();
        let mut manager = ConfigManager::new(dir.path().to_path_buf()).unwrap();
        let changed = manager.override_and_persist(None, None, None).unwrap();
        assert!(!changed);
        assert!(!manager.config_path.exists());
    }
}
