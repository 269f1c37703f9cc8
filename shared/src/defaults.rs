//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the
//! configuration structures. These functions are used by serde when
//! deserializing configuration files that don't specify certain optional
//! fields, and by [`crate::model::PacingPolicy::default`].

// Pacing policy defaults (seconds), per the pacing table: plugged / 100-80 /
// 79-50 / 49-20 / 19-10 / 9-0.

pub fn default_pacing_plugged_seconds() -> u64 {
    30
}

pub fn default_pacing_100_80_seconds() -> u64 {
    60
}

pub fn default_pacing_79_50_seconds() -> u64 {
    180
}

pub fn default_pacing_49_20_seconds() -> u64 {
    300
}

pub fn default_pacing_19_10_seconds() -> u64 {
    600
}

pub fn default_pacing_9_0_seconds() -> u64 {
    900
}

/// Default disk-scan interval (7 days).
pub fn default_disk_scan_interval_seconds() -> u64 {
    7 * 24 * 60 * 60
}

/// Default offline threshold (10 minutes).
pub fn default_offline_minutes() -> i64 {
    10
}

/// Default endpoint-probe timeout (3 seconds).
pub fn default_endpoint_probe_timeout_seconds() -> u64 {
    3
}

/// Default endpoint reprobe age before a cached selection is considered
/// stale (7 days).
pub fn default_endpoint_reprobe_age_seconds() -> u64 {
    7 * 24 * 60 * 60
}

/// Default channel keepalive ping interval (30 seconds).
pub fn default_channel_keepalive_seconds() -> u64 {
    30
}

/// Default channel keepalive timeout (15 seconds).
pub fn default_channel_keepalive_timeout_seconds() -> u64 {
    15
}

/// Default channel reconnect backoff (30 seconds).
pub fn default_channel_reconnect_backoff_seconds() -> u64 {
    30
}

/// Default event watcher network fingerprint sampling interval (15 seconds).
pub fn default_event_watcher_interval_seconds() -> u64 {
    15
}

/// Default streaming executor wall-clock timeout (300 seconds).
pub fn default_executor_timeout_seconds() -> u64 {
    300
}

/// Bound on persisted task `stdout` (65,535 bytes).
pub fn default_task_stdout_cap() -> usize {
    65_535
}

/// Bound on persisted task `stderr` (16,383 bytes).
pub fn default_task_stderr_cap() -> usize {
    16_383
}

/// Default pre-run task-active probe lead time (5 minutes).
pub fn default_task_probe_lead_minutes() -> i64 {
    5
}

/// Default task dispatcher ticker interval (30 seconds).
pub fn default_dispatcher_tick_seconds() -> u64 {
    30
}

/// Default offline detector ticker interval (60 seconds).
pub fn default_offline_detector_tick_seconds() -> u64 {
    60
}

/// Default offline detector startup warm-up delay (60 seconds).
pub fn default_offline_detector_warmup_seconds() -> u64 {
    60
}

/// Default alert rule engine ticker interval (120 seconds).
pub fn default_alert_engine_tick_seconds() -> u64 {
    120
}

/// Default alert rule engine startup warm-up delay (90 seconds).
pub fn default_alert_engine_warmup_seconds() -> u64 {
    90
}

/// Default alert rule refire throttle window (60 minutes).
pub fn default_alert_throttle_minutes() -> i64 {
    60
}

/// Default push bridge reconnect backoff (5 seconds).
pub fn default_push_bridge_backoff_seconds() -> u64 {
    5
}

/// Default MetricSample retention window (30 days).
pub fn default_metric_retention_days() -> u32 {
    30
}

/// Default agent channel idle timeout as observed server-side before sending
/// a keepalive ping (120 seconds).
pub fn default_agent_ws_idle_timeout_seconds() -> u64 {
    120
}

/// Default dashboard fan-out keepalive ping interval (30 seconds).
pub fn default_dashboard_keepalive_seconds() -> u64 {
    30
}

/// Default graceful shutdown timeout shared by both binaries (30 seconds).
pub fn default_graceful_shutdown_timeout_seconds() -> u64 {
    30
}

/// Default SQLite database busy timeout (5 seconds).
pub fn default_database_busy_timeout_seconds() -> u64 {
    5
}

/// Default WAL checkpoint interval (60 seconds).
pub fn default_wal_checkpoint_interval_seconds() -> u64 {
    60
}

/// Default data retention for server-persisted rows, in days.
pub fn default_data_retention_days() -> u32 {
    90
}

/// Default agent log file rotation size (5 MiB).
pub fn default_agent_log_max_bytes() -> u64 {
    5 * 1024 * 1024
}

/// Default agent log rotation file count.
pub fn default_agent_log_max_files() -> u32 {
    3
}

/// Default agent local outbox database busy timeout (5 seconds), reused for
/// the agent's own SQLite-backed message outbox.
pub fn default_outbox_busy_timeout_seconds() -> u64 {
    5
}

/// Default server bind address.
pub fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

/// Default push bridge pub/sub topic name.
pub fn default_push_bridge_topic() -> String {
    "rmm.commands".to_string()
}

/// Default server SQLite database file path.
pub fn default_database_path() -> String {
    "server_monitoring.db".to_string()
}
