//! Persisted TOML configuration for the agent and server binaries
//!
//! Both configs follow the CLI override-and-persist pattern described in the
//! ambient stack: a `clap` flag, if supplied, overrides the value loaded from
//! disk and the merged result is written back before the run continues.

use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::defaults;

/// Agent-side configuration, persisted as `agent.toml` in the platform
/// shared-data directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Minted on first launch and persisted forever after; `None` only
    /// before the first run has completed.
    #[serde(default)]
    pub device_id: Option<Uuid>,

    /// Candidate check-in endpoints, local-first then fallback.
    #[serde(default)]
    pub candidate_endpoints: Vec<String>,

    /// Shared secret presented as `X-Agent-Token` at check-in and channel open.
    pub agent_token: String,

    #[serde(default = "defaults::default_disk_scan_interval_seconds")]
    pub disk_scan_interval_seconds: u64,

    #[serde(default = "defaults::default_endpoint_probe_timeout_seconds")]
    pub endpoint_probe_timeout_seconds: u64,

    #[serde(default = "defaults::default_endpoint_reprobe_age_seconds")]
    pub endpoint_reprobe_age_seconds: u64,

    #[serde(default = "defaults::default_channel_keepalive_seconds")]
    pub channel_keepalive_seconds: u64,

    #[serde(default = "defaults::default_channel_keepalive_timeout_seconds")]
    pub channel_keepalive_timeout_seconds: u64,

    #[serde(default = "defaults::default_channel_reconnect_backoff_seconds")]
    pub channel_reconnect_backoff_seconds: u64,

    #[serde(default = "defaults::default_event_watcher_interval_seconds")]
    pub event_watcher_interval_seconds: u64,

    #[serde(default = "defaults::default_executor_timeout_seconds")]
    pub executor_timeout_seconds: u64,

    #[serde(default = "defaults::default_task_stdout_cap")]
    pub task_stdout_cap: usize,

    #[serde(default = "defaults::default_task_stderr_cap")]
    pub task_stderr_cap: usize,

    #[serde(default = "defaults::default_task_probe_lead_minutes")]
    pub task_probe_lead_minutes: i64,

    #[serde(default = "defaults::default_graceful_shutdown_timeout_seconds")]
    pub graceful_shutdown_timeout_seconds: u64,

    #[serde(default = "defaults::default_outbox_busy_timeout_seconds")]
    pub outbox_busy_timeout_seconds: u64,

    #[serde(default = "defaults::default_agent_log_max_bytes")]
    pub agent_log_max_bytes: u64,

    #[serde(default = "defaults::default_agent_log_max_files")]
    pub agent_log_max_files: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            candidate_endpoints: vec!["http://127.0.0.1:8080".to_string()],
            agent_token: String::new(),
            disk_scan_interval_seconds: defaults::default_disk_scan_interval_seconds(),
            endpoint_probe_timeout_seconds: defaults::default_endpoint_probe_timeout_seconds(),
            endpoint_reprobe_age_seconds: defaults::default_endpoint_reprobe_age_seconds(),
            channel_keepalive_seconds: defaults::default_channel_keepalive_seconds(),
            channel_keepalive_timeout_seconds: defaults::default_channel_keepalive_timeout_seconds(
            ),
            channel_reconnect_backoff_seconds: defaults::default_channel_reconnect_backoff_seconds(
            ),
            event_watcher_interval_seconds: defaults::default_event_watcher_interval_seconds(),
            executor_timeout_seconds: defaults::default_executor_timeout_seconds(),
            task_stdout_cap: defaults::default_task_stdout_cap(),
            task_stderr_cap: defaults::default_task_stderr_cap(),
            task_probe_lead_minutes: defaults::default_task_probe_lead_minutes(),
            graceful_shutdown_timeout_seconds: defaults::default_graceful_shutdown_timeout_seconds(
            ),
            outbox_busy_timeout_seconds: defaults::default_outbox_busy_timeout_seconds(),
            agent_log_max_bytes: defaults::default_agent_log_max_bytes(),
            agent_log_max_files: defaults::default_agent_log_max_files(),
        }
    }
}

impl AgentConfig {
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::MonitoringError::Config(format!("reading {:?}: {}", path, e)))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::MonitoringError::Config(format!("parsing {:?}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::MonitoringError::Config(format!("serializing config: {}", e)))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.agent_token.is_empty() {
            return Err(crate::MonitoringError::Validation(
                "agent_token must not be empty".to_string(),
            )
            .into());
        }
        if self.candidate_endpoints.is_empty() {
            return Err(crate::MonitoringError::Validation(
                "candidate_endpoints must contain at least one endpoint".to_string(),
            )
            .into());
        }
        for endpoint in &self.candidate_endpoints {
            crate::utils::validate_url(endpoint, false)?;
        }
        Ok(())
    }
}

/// Server-side configuration, persisted as `server.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::default_listen_address")]
    pub listen_address: String,

    /// Shared secret agents present as `X-Agent-Token`.
    pub api_key: String,

    #[serde(default = "defaults::default_data_retention_days")]
    pub data_retention_days: u32,

    #[serde(default = "defaults::default_offline_minutes")]
    pub offline_minutes: i64,

    #[serde(default = "defaults::default_dispatcher_tick_seconds")]
    pub dispatcher_tick_seconds: u64,

    #[serde(default = "defaults::default_offline_detector_tick_seconds")]
    pub offline_detector_tick_seconds: u64,

    #[serde(default = "defaults::default_offline_detector_warmup_seconds")]
    pub offline_detector_warmup_seconds: u64,

    #[serde(default = "defaults::default_alert_engine_tick_seconds")]
    pub alert_engine_tick_seconds: u64,

    #[serde(default = "defaults::default_alert_engine_warmup_seconds")]
    pub alert_engine_warmup_seconds: u64,

    #[serde(default = "defaults::default_alert_throttle_minutes")]
    pub alert_throttle_minutes: i64,

    #[serde(default = "defaults::default_push_bridge_backoff_seconds")]
    pub push_bridge_backoff_seconds: u64,

    #[serde(default = "defaults::default_push_bridge_topic")]
    pub push_bridge_topic: String,

    #[serde(default = "defaults::default_metric_retention_days")]
    pub metric_retention_days: u32,

    #[serde(default = "defaults::default_agent_ws_idle_timeout_seconds")]
    pub agent_ws_idle_timeout_seconds: u64,

    #[serde(default = "defaults::default_dashboard_keepalive_seconds")]
    pub dashboard_keepalive_seconds: u64,

    #[serde(default = "defaults::default_graceful_shutdown_timeout_seconds")]
    pub graceful_shutdown_timeout_seconds: u64,

    #[serde(default = "defaults::default_database_busy_timeout_seconds")]
    pub database_busy_timeout_seconds: u64,

    #[serde(default = "defaults::default_wal_checkpoint_interval_seconds")]
    pub wal_checkpoint_interval_seconds: u64,

    #[serde(default = "defaults::default_database_path")]
    pub database_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: defaults::default_listen_address(),
            api_key: String::new(),
            data_retention_days: defaults::default_data_retention_days(),
            offline_minutes: defaults::default_offline_minutes(),
            dispatcher_tick_seconds: defaults::default_dispatcher_tick_seconds(),
            offline_detector_tick_seconds: defaults::default_offline_detector_tick_seconds(),
            offline_detector_warmup_seconds: defaults::default_offline_detector_warmup_seconds(),
            alert_engine_tick_seconds: defaults::default_alert_engine_tick_seconds(),
            alert_engine_warmup_seconds: defaults::default_alert_engine_warmup_seconds(),
            alert_throttle_minutes: defaults::default_alert_throttle_minutes(),
            push_bridge_backoff_seconds: defaults::default_push_bridge_backoff_seconds(),
            push_bridge_topic: defaults::default_push_bridge_topic(),
            metric_retention_days: defaults::default_metric_retention_days(),
            agent_ws_idle_timeout_seconds: defaults::default_agent_ws_idle_timeout_seconds(),
            dashboard_keepalive_seconds: defaults::default_dashboard_keepalive_seconds(),
            graceful_shutdown_timeout_seconds: defaults::default_graceful_shutdown_timeout_seconds(
            ),
            database_busy_timeout_seconds: defaults::default_database_busy_timeout_seconds(),
            wal_checkpoint_interval_seconds: defaults::default_wal_checkpoint_interval_seconds(),
            database_path: defaults::default_database_path(),
        }
    }
}

impl ServerConfig {
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::MonitoringError::Config(format!("reading {:?}: {}", path, e)))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::MonitoringError::Config(format!("parsing {:?}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::MonitoringError::Config(format!("serializing config: {}", e)))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.api_key.is_empty() {
            return Err(crate::MonitoringError::Validation(
                "api_key must not be empty".to_string(),
            )
            .into());
        }
        if self.listen_address.is_empty() {
            return Err(crate::MonitoringError::Validation(
                "listen_address must not be empty".to_string(),
            )
            .into());
        }
        if self.data_retention_days == 0 {
            return Err(crate::MonitoringError::Validation(
                "data_retention_days must be greater than zero".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_config_default_fails_validation_without_token() {
        let config = AgentConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn agent_config_with_token_and_endpoint_validates() {
        let mut config = AgentConfig::default();
        config.agent_token = "secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn server_config_default_fails_validation_without_api_key() {
        let config = ServerConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn server_config_round_trips_through_toml() {
        let mut config = ServerConfig::default();
        config.api_key = "secret".to_string();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: ServerConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.api_key, config.api_key);
        assert_eq!(parsed.listen_address, config.listen_address);
    }

    #[test]
    fn agent_config_load_or_default_returns_default_for_missing_file() {
        let config = AgentConfig::load_or_default("/nonexistent/path/agent.toml").unwrap();
        assert_eq!(config.agent_token, "");
    }
}
