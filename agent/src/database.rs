//! Local SQLite-backed outbox for the endpoint agent
//!
//! The agent keeps no historical metric store of its own; the only local
//! persistence it needs is a small outbox buffering `task_result` and
//! `heartbeat` frames the channel could not deliver immediately, so nothing
//! is lost while the device is offline.

mod db_outbox;

use anyhow::{Context, Result};
use rusqlite::Connection;
use shared::AgentMessage;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub use db_outbox::{OutboxEntry, OutboxStats};

const DATABASE_FILE: &str = "agent_outbox.db";

/// Maximum delivery attempts before an outbox entry is parked as
/// permanently failed and surfaced via [`AgentDatabase::get_stats`].
const MAX_RETRIES: i32 = 20;

pub struct AgentDatabase {
    db_path: PathBuf,
    connection: Option<Connection>,
    busy_timeout_seconds: u64,
}

impl AgentDatabase {
    pub fn new<P: AsRef<Path>>(data_dir: P, busy_timeout_seconds: u64) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).with_context(|| {
                format!("Failed to create data directory: {}", data_dir.display())
            })?;
        }

        Ok(Self {
            db_path: data_dir.join(DATABASE_FILE),
            connection: None,
            busy_timeout_seconds,
        })
    }

    pub fn initialize(&mut self) -> Result<()> {
        info!("Initializing agent outbox database at {}", self.db_path.display());
        let conn = self.get_connection()?;
        db_outbox::create_table(conn)?;
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
            conn.busy_timeout(std::time::Duration::from_secs(self.busy_timeout_seconds))
                .context("Failed to set busy timeout")?;

            self.connection = Some(conn);
        }
        Ok(self.connection.as_mut().unwrap())
    }

    /// Buffer a message that could not be sent over the live channel.
    pub fn enqueue(&mut self, message: &AgentMessage) -> Result<i64> {
        let conn = self.get_connection()?;
        db_outbox::enqueue(conn, message)
    }

    /// Fetch up to `batch_size` buffered messages due for (re-)delivery.
    pub fn get_pending(&mut self, batch_size: usize) -> Result<Vec<OutboxEntry>> {
        let conn = self.get_connection()?;
        db_outbox::get_pending(conn, batch_size)
    }

    pub fn mark_as_sending(&mut self, ids: &[i64]) -> Result<()> {
        let conn = self.get_connection()?;
        db_outbox::mark_as_sending(conn, ids)
    }

    pub fn mark_as_sent(&mut self, ids: &[i64]) -> Result<()> {
        let conn = self.get_connection()?;
        db_outbox::mark_as_sent(conn, ids)
    }

    pub fn mark_as_failed(&mut self, id: i64, error_msg: &str) -> Result<()> {
        let conn = self.get_connection()?;
        db_outbox::mark_as_failed(conn, id, error_msg, MAX_RETRIES)
    }

    pub fn cleanup_sent(&mut self, older_than_hours: i64) -> Result<usize> {
        let conn = self.get_connection()?;
        db_outbox::cleanup_sent(conn, older_than_hours)
    }

    pub fn cleanup_failed(&mut self, older_than_days: i64) -> Result<usize> {
        let conn = self.get_connection()?;
        db_outbox::cleanup_failed(conn, older_than_days)
    }

    pub fn get_stats(&mut self) -> Result<OutboxStats> {
        let conn = self.get_connection()?;
        db_outbox::get_stats(conn)
    }

    /// Checkpoint WAL to prevent unbounded growth; should be called
    /// periodically (see `default_wal_checkpoint_interval_seconds`).
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
    use shared::api::{LogLevel, LogPayload};
    use tempfile::TempDir;

    fn sample_message() -> AgentMessage {
        AgentMessage::Log(LogPayload {
            level: LogLevel::Info,
            message: "hi".to_string(),
        })
    }

    #[test]
    fn initialize_creates_outbox_table() {
        let dir = TempDir::new().unwrap();
        let mut db = AgentDatabase::new(dir.path(), 5).unwrap();
        db.initialize().unwrap();
        db.enqueue(&sample_message()).unwrap();
        let pending = db.get_pending(10).unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn stats_reflect_lifecycle() {
        let dir = TempDir::new().unwrap();
        let mut db = AgentDatabase::new(dir.path(), 5).unwrap();
        db.initialize().unwrap();
        let id = db.enqueue(&sample_message()).unwrap();
        db.mark_as_sending(&[id]).unwrap();
        db.mark_as_sent(&[id]).unwrap();
        let stats = db.get_stats().unwrap();
        assert_eq!(stats.sent, 1);
    }
}
