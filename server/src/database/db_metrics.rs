//! Metric sample table: one row per agent heartbeat's telemetry snapshot
//!
//! Feeds both the dashboard's live charts (read path, most-recent-first) and
//! the alert engine (C12), which scans a rolling window per device.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use shared::model::MetricSample;
use uuid::Uuid;

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS metric_samples (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            cpu REAL NOT NULL,
            ram REAL NOT NULL,
            disk REAL NOT NULL,
            battery REAL
        )
        "#,
        [],
    )
    .context("Failed to create metric_samples table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_metric_samples_device
         ON metric_samples(device_id, recorded_at)",
        [],
    )?;

    Ok(())
}

fn row_to_sample(row: &Row) -> rusqlite::Result<MetricSample> {
    let device_id: String = row.get(1)?;
    let recorded_at: String = row.get(2)?;

    Ok(MetricSample {
        device_id: Uuid::parse_str(&device_id).unwrap_or_else(|_| Uuid::nil()),
        recorded_at: recorded_at.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
        cpu: row.get(3)?,
        ram: row.get(4)?,
        disk: row.get(5)?,
        battery: row.get(6)?,
    })
}

pub fn insert(conn: &Connection, sample: &MetricSample) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO metric_samples (device_id, recorded_at, cpu, ram, disk, battery)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            sample.device_id.to_string(),
            sample.recorded_at.to_rfc3339(),
            sample.cpu,
            sample.ram,
            sample.disk,
            sample.battery,
        ],
    )
    .context("Failed to insert metric sample")?;
    Ok(())
}

/// Most recent samples for a device, newest first, for dashboard charts.
pub fn list_recent_for_device(
    conn: &Connection,
    device_id: Uuid,
    limit: usize,
) -> Result<Vec<MetricSample>> {
    let mut stmt = conn.prepare(
        "SELECT id, device_id, recorded_at, cpu, ram, disk, battery
         FROM metric_samples WHERE device_id = ?1 ORDER BY recorded_at DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![device_id.to_string(), limit as i64], row_to_sample)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list recent metric samples")
}

/// Samples for a device recorded since `since`, oldest first; the window the
/// alert engine (C12) scans for sustained threshold violations.
pub fn list_since(conn: &Connection, device_id: Uuid, since: DateTime<Utc>) -> Result<Vec<MetricSample>> {
    let mut stmt = conn.prepare(
        "SELECT id, device_id, recorded_at, cpu, ram, disk, battery
         FROM metric_samples WHERE device_id = ?1 AND recorded_at >= ?2 ORDER BY recorded_at ASC",
    )?;
    let rows = stmt.query_map(params![device_id.to_string(), since.to_rfc3339()], row_to_sample)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list metric samples since cutoff")
}

pub fn cleanup_old(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    let count = conn.execute(
        "DELETE FROM metric_samples WHERE recorded_at < ?1",
        params![cutoff.to_rfc3339()],
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        conn
    }

    fn sample(device_id: Uuid, recorded_at: DateTime<Utc>) -> MetricSample {
        MetricSample {
            device_id,
            recorded_at,
            cpu: 42.0,
            ram: 55.0,
            disk: 70.0,
            battery: Some(88.0),
        }
    }

    #[test]
    fn insert_then_list_recent() {
        let conn = test_conn();
        let device_id = Uuid::new_v4();
        insert(&conn, &sample(device_id, Utc::now())).unwrap();
        let recent = list_recent_for_device(&conn, device_id, 10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].cpu, 42.0);
    }

    #[test]
    fn list_since_excludes_older_samples() {
        let conn = test_conn();
        let device_id = Uuid::new_v4();
        insert(&conn, &sample(device_id, Utc::now() - chrono::Duration::hours(2))).unwrap();
        insert(&conn, &sample(device_id, Utc::now())).unwrap();

        let window = list_since(&conn, device_id, Utc::now() - chrono::Duration::minutes(30)).unwrap();
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn cleanup_old_respects_cutoff() {
        let conn = test_conn();
        let device_id = Uuid::new_v4();
        insert(&conn, &sample(device_id, Utc::now() - chrono::Duration::days(40))).unwrap();
        let removed = cleanup_old(&conn, Utc::now() - chrono::Duration::days(30)).unwrap();
        assert_eq!(removed, 1);
    }
}
