//! Durable local state: the small facts the agent must remember across restarts
//! that don't belong in `agent.toml` (a user-editable config file, not a cache).
//!
//! Persisted as `state.json` next to the outbox database. Writes are atomic
//! (temp file + rename) so a crash mid-write never leaves a corrupt file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentState {
    /// Endpoint the endpoint selector (C2) last settled on as reachable.
    #[serde(default)]
    pub active_endpoint: Option<String>,
    #[serde(default)]
    pub last_endpoint_probe: Option<DateTime<Utc>>,
    /// Opaque fingerprint of the local network (default gateway MAC, interface
    /// set) the event watcher (C7) last observed; a change is what fires
    /// `event_trigger=network_change` tasks.
    #[serde(default)]
    pub last_network_fingerprint: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
    /// Whether the last channel attempt left the agent considering itself
    /// offline; used only to log a "back online" transition, not gate behavior.
    #[serde(default)]
    pub was_offline: bool,
}

pub struct StateStore {
    path: PathBuf,
    pub state: AgentState,
}

impl StateStore {
    pub fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let path = data_dir.as_ref().join(STATE_FILE);
        let state = if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                    warn!(error = %e, "Corrupt state.json, starting fresh");
                    AgentState::default()
                }),
                Err(e) => {
                    warn!(error = %e, "Failed to read state.json, starting fresh");
                    AgentState::default()
                }
            }
        } else {
            AgentState::default()
        };

        Ok(Self { path, state })
    }

    /// Write the current state to disk via temp-file-then-rename so a crash
    /// mid-write never corrupts the previous good copy.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating state directory {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(&self.state).context("serializing agent state")?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming {} to {}", tmp_path.display(), self.path.display()))?;
        debug!("Agent state persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_missing_file_returns_default() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::load(dir.path()).unwrap();
        assert!(store.state.active_endpoint.is_none());
        assert!(!store.state.was_offline);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut store = StateStore::load(dir.path()).unwrap();
        store.state.active_endpoint = Some("https://rmm.example.com".to_string());
        store.state.mac_address = Some("aa:bb:cc:dd:ee:ff".to_string());
        store.save().unwrap();

        let reloaded = StateStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.state.active_endpoint, store.state.active_endpoint);
        assert_eq!(reloaded.state.mac_address, store.state.mac_address);
    }

    #[test]
    fn load_corrupt_file_falls_back_to_default() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("state.json"), "{not json").unwrap();
        let store = StateStore::load(dir.path()).unwrap();
        assert!(store.state.active_endpoint.is_none());
    }
}
