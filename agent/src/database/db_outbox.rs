//! Outbox queue for channel messages the agent could not send immediately
//!
//! When the channel to the control plane is down, `task_result` and
//! `heartbeat` frames are buffered here instead of being dropped. Delivery is
//! retried with exponential backoff once the channel reopens, following the
//! same backoff shape as the teacher's metric send queue.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use shared::AgentMessage;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum OutboxStatus {
    Pending,
    Sending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sending => "sending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
        }
    }
}

/// A buffered frame ready for (re-)delivery.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: i64,
    pub message: AgentMessage,
    pub retry_count: i32,
}

#[derive(Debug, Default, Clone)]
pub struct OutboxStats {
    pub pending: i64,
    pub sending: i64,
    pub sent: i64,
    pub failed: i64,
}

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS message_outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at INTEGER NOT NULL,
            sent_at INTEGER,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_retry_at INTEGER,
            last_error TEXT,
            next_retry_at INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create message_outbox table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_outbox_status
         ON message_outbox(status, next_retry_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_outbox_created
         ON message_outbox(created_at)",
        [],
    )?;

    Ok(())
}

/// Buffer a message for later delivery.
pub fn enqueue(conn: &Connection, message: &AgentMessage) -> Result<i64> {
    let now = current_timestamp();
    let payload = serde_json::to_string(message).context("serializing outbox message")?;

    conn.execute(
        r#"
        INSERT INTO message_outbox (payload, status, created_at, next_retry_at)
        VALUES (?1, ?2, ?3, ?3)
        "#,
        params![payload, OutboxStatus::Pending.as_str(), now as i64],
    )?;

    let id = conn.last_insert_rowid();
    debug!(outbox_id = id, "Buffered channel message in outbox");
    Ok(id)
}

/// Fetch up to `batch_size` entries due for a (re-)send attempt.
pub fn get_pending(conn: &Connection, batch_size: usize) -> Result<Vec<OutboxEntry>> {
    let now = current_timestamp();

    let mut stmt = conn.prepare(
        r#"
        SELECT id, payload, retry_count
        FROM message_outbox
        WHERE status = 'pending' AND next_retry_at <= ?1
        ORDER BY created_at ASC
        LIMIT ?2
        "#,
    )?;

    let rows = stmt.query_map(params![now as i64, batch_size as i64], |row| {
        let id: i64 = row.get(0)?;
        let payload: String = row.get(1)?;
        let retry_count: i32 = row.get(2)?;
        Ok((id, payload, retry_count))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (id, payload, retry_count) = row?;
        match serde_json::from_str::<AgentMessage>(&payload) {
            Ok(message) => entries.push(OutboxEntry {
                id,
                message,
                retry_count,
            }),
            Err(e) => {
                warn!(outbox_id = id, error = %e, "Dropping unparseable outbox entry");
                remove(conn, id)?;
            }
        }
    }

    Ok(entries)
}

pub fn mark_as_sending(conn: &Connection, ids: &[i64]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let now = current_timestamp();
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "UPDATE message_outbox SET status = 'sending', last_retry_at = ? WHERE id IN ({})",
        placeholders
    );
    let mut bound: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now as i64)];
    for id in ids {
        bound.push(Box::new(*id));
    }
    conn.execute(&sql, rusqlite::params_from_iter(bound))?;
    Ok(())
}

pub fn mark_as_sent(conn: &Connection, ids: &[i64]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let now = current_timestamp();
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "UPDATE message_outbox SET status = 'sent', sent_at = ? WHERE id IN ({})",
        placeholders
    );
    let mut bound: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now as i64)];
    for id in ids {
        bound.push(Box::new(*id));
    }
    conn.execute(&sql, rusqlite::params_from_iter(bound))?;
    debug!(count = ids.len(), "Marked outbox entries as sent");
    Ok(())
}

/// Mark a send attempt as failed, applying exponential backoff (2^n minutes,
/// capped at 60) until `max_retries` is reached, at which point the entry is
/// parked as permanently failed.
pub fn mark_as_failed(
    conn: &Connection,
    id: i64,
    error_msg: &str,
    max_retries: i32,
) -> Result<()> {
    let now = current_timestamp();

    let retry_count: i32 = conn.query_row(
        "SELECT retry_count FROM message_outbox WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    let new_retry_count = retry_count + 1;

    if new_retry_count >= max_retries {
        conn.execute(
            "UPDATE message_outbox
             SET status = 'failed', retry_count = ?1, last_retry_at = ?2, last_error = ?3
             WHERE id = ?4",
            params![new_retry_count, now as i64, error_msg, id],
        )?;
        warn!(
            outbox_id = id,
            "Message permanently failed after {} retries: {}", max_retries, error_msg
        );
    } else {
        let backoff_minutes = 2_i32.pow(new_retry_count as u32).min(60);
        let next_retry_at = now + (backoff_minutes as u64 * 60);
        conn.execute(
            "UPDATE message_outbox
             SET status = 'pending', retry_count = ?1, last_retry_at = ?2,
                 next_retry_at = ?3, last_error = ?4
             WHERE id = ?5",
            params![new_retry_count, now as i64, next_retry_at as i64, error_msg, id],
        )?;
        debug!(
            outbox_id = id,
            "Will retry in {} minutes (attempt {}/{})", backoff_minutes, new_retry_count, max_retries
        );
    }

    Ok(())
}

pub fn remove(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM message_outbox WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn cleanup_sent(conn: &Connection, older_than_hours: i64) -> Result<usize> {
    let cutoff = current_timestamp().saturating_sub(older_than_hours as u64 * 3600);
    let count = conn.execute(
        "DELETE FROM message_outbox WHERE status = 'sent' AND sent_at < ?1",
        params![cutoff as i64],
    )?;
    if count > 0 {
        debug!(count, "Cleaned up sent outbox entries");
    }
    Ok(count)
}

pub fn cleanup_failed(conn: &Connection, older_than_days: i64) -> Result<usize> {
    let cutoff = current_timestamp().saturating_sub(older_than_days as u64 * 86_400);
    let count = conn.execute(
        "DELETE FROM message_outbox WHERE status = 'failed' AND last_retry_at < ?1",
        params![cutoff as i64],
    )?;
    if count > 0 {
        debug!(count, "Cleaned up permanently failed outbox entries");
    }
    Ok(count)
}

pub fn get_stats(conn: &Connection) -> Result<OutboxStats> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM message_outbox GROUP BY status")?;
    let mut stats = OutboxStats::default();
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (status, count) = row?;
        match status.as_str() {
            "pending" => stats.pending = count,
            "sending" => stats.sending = count,
            "sent" => stats.sent = count,
            "failed" => stats.failed = count,
            _ => {}
        }
    }
    Ok(stats)
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::api::{LogLevel, LogPayload};

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        conn
    }

    fn sample_message() -> AgentMessage {
        AgentMessage::Log(LogPayload {
            level: LogLevel::Info,
            message: "hello".to_string(),
        })
    }

    #[test]
    fn enqueue_then_get_pending_round_trips() {
        let conn = test_conn();
        enqueue(&conn, &sample_message()).unwrap();
        let pending = get_pending(&conn, 10).unwrap();
        assert_eq!(pending.len(), 1);
        matches!(pending[0].message, AgentMessage::Log(_));
    }

    #[test]
    fn mark_as_failed_reschedules_until_max_retries() {
        let conn = test_conn();
        let id = enqueue(&conn, &sample_message()).unwrap();
        mark_as_failed(&conn, id, "boom", 3).unwrap();
        let stats = get_stats(&conn).unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 0);

        mark_as_failed(&conn, id, "boom", 1).unwrap();
        let stats = get_stats(&conn).unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn mark_as_sent_removes_from_pending_count() {
        let conn = test_conn();
        let id = enqueue(&conn, &sample_message()).unwrap();
        mark_as_sending(&conn, &[id]).unwrap();
        mark_as_sent(&conn, &[id]).unwrap();
        let stats = get_stats(&conn).unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn cleanup_sent_respects_age_window() {
        let conn = test_conn();
        let id = enqueue(&conn, &sample_message()).unwrap();
        mark_as_sent(&conn, &[id]).unwrap();
        let removed = cleanup_sent(&conn, 0).unwrap();
        assert_eq!(removed, 1);
    }
}
