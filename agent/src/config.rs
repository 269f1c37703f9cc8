//! Configuration management for the endpoint agent
//!
//! Wraps [`shared::AgentConfig`] with the load/override/persist lifecycle: the
//! config file is read (or defaulted) at startup, any values supplied on the
//! command line are merged in, and the merged result is validated and written
//! back to disk before the agent proceeds.

use std::path::PathBuf;

use anyhow::{Context, Result};
use shared::AgentConfig;
use tracing::{debug, info};

const AGENT_CONFIG_FILE: &str = "agent.toml";

/// Owns the on-disk location and in-memory copy of the agent's configuration.
pub struct ConfigManager {
    pub config_path: PathBuf,
    pub config: AgentConfig,
}

impl ConfigManager {
    /// Load `agent.toml` from `config_dir`, or fall back to defaults if it
    /// does not exist yet (first run).
    pub fn new(config_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("creating config directory {}", config_dir.display()))?;
        let config_path = config_dir.join(AGENT_CONFIG_FILE);
        let config = AgentConfig::load_or_default(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;

        debug!(
            candidate_endpoints = ?config.candidate_endpoints,
            device_id = ?config.device_id,
            "Agent configuration loaded"
        );

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Reload the configuration from disk, replacing the in-memory copy.
    pub fn reload(&mut self) -> Result<()> {
        let config = AgentConfig::load_or_default(&self.config_path)
            .with_context(|| format!("reloading {}", self.config_path.display()))?;
        self.config = config;
        info!("Agent configuration reloaded from disk");
        Ok(())
    }

    /// Apply command-line overrides on top of the loaded configuration,
    /// persisting the merged result if anything changed. Returns `true` if
    /// the config file was rewritten.
    pub fn override_and_persist(
        &mut self,
        server_endpoint: Option<String>,
        agent_token: Option<String>,
        device_id: Option<uuid::Uuid>,
    ) -> Result<bool> {
        let mut changed = false;

        if let Some(endpoint) = server_endpoint {
            if self.config.candidate_endpoints.first() != Some(&endpoint) {
                info!(endpoint = %endpoint, "Overriding primary candidate endpoint");
                self.config.candidate_endpoints.insert(0, endpoint);
                changed = true;
            }
        }

        if let Some(token) = agent_token {
            if self.config.agent_token != token {
                info!("Overriding agent_token (value hidden for security)");
                self.config.agent_token = token;
                changed = true;
            }
        }

        if let Some(id) = device_id {
            if self.config.device_id != Some(id) {
                info!(device_id = %id, "Overriding device_id");
                self.config.device_id = Some(id);
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
            info!("Agent configuration updated and persisted to disk");
        }

        Ok(changed)
    }

    /// Persist the in-memory configuration as-is, e.g. after minting a fresh
    /// `device_id` on first run.
    pub fn persist(&self) -> Result<()> {
        self.config
            .save(&self.config_path)
            .with_context(|| format!("writing {}", self.config_path.display()))
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
        assert_eq!(manager.config.agent_token, "");
        assert!(!manager.config_path.exists());
    }

    #[test]
    fn override_and_persist_writes_changed_token() {
        let dir = TempDir::new().unwrap();
        let mut manager = ConfigManager::new(dir.path().to_path_buf()).unwrap();
        let changed = manager
            .override_and_persist(None, Some("s3cr3t".to_string()), None)
            .unwrap();
        assert!(changed);
        assert!(manager.config_path.exists());

        let reloaded = AgentConfig::load_or_default(&manager.config_path).unwrap();
        assert_eq!(reloaded.agent_token, "s3cr3t");
    }

    #[test]
    fn override_and_persist_is_noop_without_changes() {
        let dir = TempDir::new().unwrap();
        let mut manager = ConfigManager::new(dir.path().to_path_buf()).unwrap();
        let changed = manager.override_and_persist(None, None, None).unwrap();
        assert!(!changed);
        assert!(!manager.config_path.exists());
    }

    #[test]
    fn device_id_override_is_persisted() {
        let dir = TempDir::new().unwrap();
        let mut manager = ConfigManager::new(dir.path().to_path_buf()).unwrap();
        let id = uuid::Uuid::new_v4();
        manager.override_and_persist(None, None, Some(id)).unwrap();
        assert_eq!(manager.config.device_id, Some(id));
    }
}
