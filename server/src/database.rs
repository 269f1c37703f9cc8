//! Control-plane persistence
//!
//! A single SQLite database holding the device registry, task queue, task
//! results, metric history, alert rules, and dashboard-editable settings.
//! Each concern lives in its own submodule (one table, one set of queries);
//! this module just owns the connection lifecycle and the cross-cutting
//! maintenance jobs (retention cleanup, WAL checkpointing, stats).

mod db_alert_rules;
mod db_devices;
mod db_metrics;
mod db_settings;
mod db_task_results;
mod db_tasks;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use shared::model::{AlertRule, Device, DeviceStatus, MetricSample, Setting, Task, TaskResult, TaskStatus};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DATABASE_FILE: &str = "server_monitoring.db";

#[derive(Debug, Default, Clone)]
pub struct ServerDatabaseStats {
    pub device_count: i64,
    pub task_count: i64,
    pub task_result_count: i64,
    pub metric_sample_count: i64,
    pub alert_rule_count: i64,
    pub database_size_bytes: u64,
}

pub struct ServerDatabase {
    db_path: PathBuf,
    connection: Option<Connection>,
    busy_timeout_seconds: u64,
}

impl ServerDatabase {
    pub fn new<P: AsRef<Path>>(database_path: P, busy_timeout_seconds: u64) -> Result<Self> {
        let db_path = database_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create database directory: {}", parent.display()))?;
            }
        }

        Ok(Self {
            db_path,
            connection: None,
            busy_timeout_seconds,
        })
    }

    /// Convenience constructor matching the teacher's `data_dir`-relative
    /// layout, for callers that only have a directory, not a file path.
    pub fn in_dir<P: AsRef<Path>>(data_dir: P, busy_timeout_seconds: u64) -> Result<Self> {
        Self::new(data_dir.as_ref().join(DATABASE_FILE), busy_timeout_seconds)
    }

    pub fn initialize(&mut self) -> Result<()> {
        info!("Initializing server database at {}", self.db_path.display());
        let conn = self.get_connection()?;
        db_devices::create_table(conn)?;
        db_tasks::create_table(conn)?;
        db_task_results::create_table(conn)?;
        db_metrics::create_table(conn)?;
        db_alert_rules::create_table(conn)?;
        db_settings::create_table(conn)?;
        Ok(())
    }

    pub fn get_connection(&mut self) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;

            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .context("Failed to enable WAL mode")?;
            conn.query_row("PRAGMA wal_autocheckpoint=1000", [], |_| Ok(()))
                .context("Failed to set WAL auto-checkpoint")?;
            conn.execute("PRAGMA foreign_keys=ON", [])
                .context("Failed to enable foreign keys")?;
            conn.busy_timeout(std::time::Duration::from_secs(self.busy_timeout_seconds))
                .context("Failed to set busy timeout")?;

            self.connection = Some(conn);
        }
        Ok(self.connection.as_mut().unwrap())
    }

    // -- devices --------------------------------------------------------

    pub fn upsert_device(&mut self, device: &Device) -> Result<()> {
        let conn = self.get_connection()?;
        db_devices::upsert(conn, device)
    }

    pub fn get_device(&mut self, device_id: Uuid) -> Result<Option<Device>> {
        let conn = self.get_connection()?;
        db_devices::get(conn, device_id)
    }

    pub fn list_devices(&mut self) -> Result<Vec<Device>> {
        let conn = self.get_connection()?;
        db_devices::list_all(conn)
    }

    pub fn list_online_devices(&mut self) -> Result<Vec<Device>> {
        let conn = self.get_connection()?;
        db_devices::list_online(conn)
    }

    pub fn list_online_devices_in_group(&mut self, group_name: &str) -> Result<Vec<Device>> {
        let conn = self.get_connection()?;
        db_devices::list_online_in_group(conn, group_name)
    }

    pub fn list_stale_online_devices(&mut self, cutoff: DateTime<Utc>) -> Result<Vec<Device>> {
        let conn = self.get_connection()?;
        db_devices::list_stale_online(conn, cutoff)
    }

    pub fn set_device_status(&mut self, device_id: Uuid, status: DeviceStatus) -> Result<()> {
        let conn = self.get_connection()?;
        db_devices::set_status(conn, device_id, status)
    }

    // -- tasks ------------------------------------------------------------

    pub fn insert_task(&mut self, task: &Task) -> Result<()> {
        let conn = self.get_connection()?;
        db_tasks::insert(conn, task)
    }

    pub fn get_task(&mut self, task_id: Uuid) -> Result<Option<Task>> {
        let conn = self.get_connection()?;
        db_tasks::get(conn, task_id)
    }

    pub fn list_tasks(&mut self) -> Result<Vec<Task>> {
        let conn = self.get_connection()?;
        db_tasks::list_all(conn)
    }

    pub fn list_checkin_snapshot_tasks(&mut self) -> Result<Vec<Task>> {
        let conn = self.get_connection()?;
        db_tasks::list_checkin_snapshot(conn)
    }

    pub fn list_schedulable_tasks(&mut self) -> Result<Vec<Task>> {
        let conn = self.get_connection()?;
        db_tasks::list_schedulable(conn)
    }

    pub fn set_task_status(&mut self, task_id: Uuid, status: TaskStatus) -> Result<()> {
        let conn = self.get_connection()?;
        db_tasks::set_status(conn, task_id, status)
    }

    pub fn mark_task_last_run(&mut self, task_id: Uuid, when: DateTime<Utc>) -> Result<()> {
        let conn = self.get_connection()?;
        db_tasks::mark_last_run(conn, task_id, when)
    }

    pub fn cancel_task(&mut self, task_id: Uuid) -> Result<()> {
        let conn = self.get_connection()?;
        db_tasks::cancel(conn, task_id)
    }

    // -- task results ------------------------------------------------------

    pub fn insert_task_result(&mut self, result: &TaskResult) -> Result<()> {
        let conn = self.get_connection()?;
        db_task_results::insert(conn, result)
    }

    pub fn list_task_results_for_task(&mut self, task_id: Uuid) -> Result<Vec<TaskResult>> {
        let conn = self.get_connection()?;
        db_task_results::list_for_task(conn, task_id)
    }

    pub fn list_task_results_for_device(&mut self, device_id: Uuid, limit: usize) -> Result<Vec<TaskResult>> {
        let conn = self.get_connection()?;
        db_task_results::list_for_device(conn, device_id, limit)
    }

    // -- metrics ------------------------------------------------------------

    pub fn insert_metric_sample(&mut self, sample: &MetricSample) -> Result<()> {
        let conn = self.get_connection()?;
        db_metrics::insert(conn, sample)
    }

    pub fn list_recent_metrics(&mut self, device_id: Uuid, limit: usize) -> Result<Vec<MetricSample>> {
        let conn = self.get_connection()?;
        db_metrics::list_recent_for_device(conn, device_id, limit)
    }

    pub fn list_metrics_since(&mut self, device_id: Uuid, since: DateTime<Utc>) -> Result<Vec<MetricSample>> {
        let conn = self.get_connection()?;
        db_metrics::list_since(conn, device_id, since)
    }

    // -- alert rules ------------------------------------------------------

    pub fn insert_alert_rule(&mut self, rule: &AlertRule) -> Result<i64> {
        let conn = self.get_connection()?;
        db_alert_rules::insert(conn, rule)
    }

    pub fn get_alert_rule(&mut self, id: i64) -> Result<Option<AlertRule>> {
        let conn = self.get_connection()?;
        db_alert_rules::get(conn, id)
    }

    pub fn list_active_alert_rules(&mut self) -> Result<Vec<AlertRule>> {
        let conn = self.get_connection()?;
        db_alert_rules::list_active(conn)
    }

    pub fn list_alert_rules(&mut self) -> Result<Vec<AlertRule>> {
        let conn = self.get_connection()?;
        db_alert_rules::list_all(conn)
    }

    pub fn mark_alert_rule_fired(&mut self, id: i64, when: DateTime<Utc>) -> Result<()> {
        let conn = self.get_connection()?;
        db_alert_rules::mark_fired(conn, id, when)
    }

    pub fn delete_alert_rule(&mut self, id: i64) -> Result<()> {
        let conn = self.get_connection()?;
        db_alert_rules::delete(conn, id)
    }

    // -- settings ------------------------------------------------------------

    pub fn seed_default_setting(&mut self, setting: &Setting) -> Result<()> {
        let conn = self.get_connection()?;
        db_settings::seed_default(conn, setting)
    }

    pub fn get_setting(&mut self, key: &str) -> Result<Option<String>> {
        let conn = self.get_connection()?;
        db_settings::get(conn, key)
    }

    pub fn set_setting(&mut self, key: &str, value: &str) -> Result<()> {
        let conn = self.get_connection()?;
        db_settings::set(conn, key, value)
    }

    pub fn list_settings(&mut self) -> Result<Vec<Setting>> {
        let conn = self.get_connection()?;
        db_settings::list_all(conn)
    }

    // -- maintenance ------------------------------------------------------

    /// Purge data older than the configured retention windows. Devices that
    /// have gone offline and stayed quiet longer than `device_retention_days`
    /// are dropped along with their history.
    pub fn cleanup_old_data(&mut self, metric_retention_days: u32, result_retention_days: u32) -> Result<()> {
        let metric_cutoff = Utc::now() - chrono::Duration::days(metric_retention_days as i64);
        let result_cutoff = Utc::now() - chrono::Duration::days(result_retention_days as i64);

        let conn = self.get_connection()?;
        let metrics_removed = db_metrics::cleanup_old(conn, metric_cutoff)?;
        let results_removed = db_task_results::cleanup_old(conn, result_cutoff)?;
        let tasks_removed = db_tasks::cleanup_old_done(conn, result_cutoff)?;

        info!(
            metrics_removed,
            results_removed, tasks_removed, "Retention cleanup complete"
        );

        conn.execute("VACUUM", [])
            .context("Failed to vacuum database after cleanup")?;
        self.checkpoint_wal()?;

        Ok(())
    }

    pub fn checkpoint_wal(&mut self) -> Result<i64> {
        let conn = self.get_connection()?;
        let (busy, log_frames, checkpointed): (i64, i64, i64) =
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
        if busy > 0 {
            debug!(checkpointed, busy, log_frames, "Partial WAL checkpoint");
        } else {
            debug!(checkpointed, "WAL checkpoint complete, WAL truncated");
        }
        Ok(checkpointed)
    }

    pub fn get_stats(&mut self) -> Result<ServerDatabaseStats> {
        let db_path = self.db_path.clone();
        let conn = self.get_connection()?;
        let tx = conn.transaction()?;

        let device_count: i64 = tx.query_row("SELECT COUNT(*) FROM devices", [], |r| r.get(0))?;
        let task_count: i64 = tx.query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0))?;
        let task_result_count: i64 = tx.query_row("SELECT COUNT(*) FROM task_results", [], |r| r.get(0))?;
        let metric_sample_count: i64 =
            tx.query_row("SELECT COUNT(*) FROM metric_samples", [], |r| r.get(0))?;
        let alert_rule_count: i64 = tx.query_row("SELECT COUNT(*) FROM alert_rules", [], |r| r.get(0))?;

        tx.commit()?;

        let database_size_bytes = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

        Ok(ServerDatabaseStats {
            device_count,
            task_count,
            task_result_count,
            metric_sample_count,
            alert_rule_count,
            database_size_bytes,
        })
    }

    pub fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            if let Err((_, e)) = conn.close() {
                warn!("Error closing database connection: {:?}", e);
            } else {
                debug!("Database connection closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_db() -> (TempDir, ServerDatabase) {
        let dir = TempDir::new().unwrap();
        let mut db = ServerDatabase::in_dir(dir.path(), 5).unwrap();
        db.initialize().unwrap();
        (dir, db)
    }

    #[test]
    fn initialize_creates_all_tables() {
        let (_dir, mut db) = test_db();
        let stats = db.get_stats().unwrap();
        assert_eq!(stats.device_count, 0);
        assert_eq!(stats.task_count, 0);
    }

    #[test]
    fn upsert_and_fetch_device() {
        let (_dir, mut db) = test_db();
        let device = Device::bootstrap(Uuid::new_v4(), "host1".into(), "linux".into(), "Ubuntu".into());
        db.upsert_device(&device).unwrap();
        let fetched = db.get_device(device.device_id).unwrap().unwrap();
        assert_eq!(fetched.hostname, "host1");
    }

    #[test]
    fn cleanup_old_data_removes_stale_metrics_and_results() {
        let (_dir, mut db) = test_db();
        let device_id = Uuid::new_v4();
        db.insert_metric_sample(&MetricSample {
            device_id,
            recorded_at: Utc::now() - chrono::Duration::days(400),
            cpu: 1.0,
            ram: 1.0,
            disk: 1.0,
            battery: None,
        })
        .unwrap();

        db.cleanup_old_data(90, 90).unwrap();
        let stats = db.get_stats().unwrap();
        assert_eq!(stats.metric_sample_count, 0);
    }

    #[test]
    fn get_stats_reflects_database_size() {
        let (_dir, mut db) = test_db();
        let stats = db.get_stats().unwrap();
        assert!(stats.database_size_bytes > 0);
    }

    #[test]
    fn close_allows_reopening_connection() {
        let (_dir, mut db) = test_db();
        db.close();
        let devices = db.list_devices().unwrap();
        assert!(devices.is_empty());
    }
}
