//! Task result table: one row per device's completed (or timed-out) execution
//!
//! `stdout`/`stderr` arrive already capped by the agent's executor (C5) at
//! [`shared::model::TASK_RESULT_STDOUT_CAP`]/`TASK_RESULT_STDERR_CAP`; this
//! table stores them as-is rather than re-truncating.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use shared::model::{TaskResult, TaskResultStatus};
use uuid::Uuid;

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS task_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            exit_code INTEGER NOT NULL,
            stdout TEXT NOT NULL,
            stderr TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            completed_at TEXT NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create task_results table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_task_results_task ON task_results(task_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_task_results_device ON task_results(device_id, completed_at)",
        [],
    )?;

    Ok(())
}

fn row_to_result(row: &Row) -> rusqlite::Result<TaskResult> {
    let task_id: String = row.get(1)?;
    let device_id: String = row.get(2)?;
    let status: String = row.get(6)?;
    let started_at: String = row.get(7)?;
    let completed_at: String = row.get(8)?;

    Ok(TaskResult {
        task_id: Uuid::parse_str(&task_id).unwrap_or_else(|_| Uuid::nil()),
        device_id: Uuid::parse_str(&device_id).unwrap_or_else(|_| Uuid::nil()),
        exit_code: row.get(3)?,
        stdout: row.get(4)?,
        stderr: row.get(5)?,
        status: if status == "success" {
            TaskResultStatus::Success
        } else {
            TaskResultStatus::Failed
        },
        started_at: started_at.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
        completed_at: completed_at.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
    })
}

pub fn insert(conn: &Connection, result: &TaskResult) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO task_results
            (task_id, device_id, exit_code, stdout, stderr, status, started_at, completed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            result.task_id.to_string(),
            result.device_id.to_string(),
            result.exit_code,
            result.stdout,
            result.stderr,
            match result.status {
                TaskResultStatus::Success => "success",
                TaskResultStatus::Failed => "failed",
            },
            result.started_at.to_rfc3339(),
            result.completed_at.to_rfc3339(),
        ],
    )
    .context("Failed to insert task result")?;
    Ok(())
}

pub fn list_for_task(conn: &Connection, task_id: Uuid) -> Result<Vec<TaskResult>> {
    let mut stmt = conn.prepare(
        "SELECT id, task_id, device_id, exit_code, stdout, stderr, status, started_at, completed_at
         FROM task_results WHERE task_id = ?1 ORDER BY completed_at DESC",
    )?;
    let rows = stmt.query_map(params![task_id.to_string()], row_to_result)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list task results")
}

pub fn list_for_device(conn: &Connection, device_id: Uuid, limit: usize) -> Result<Vec<TaskResult>> {
    let mut stmt = conn.prepare(
        "SELECT id, task_id, device_id, exit_code, stdout, stderr, status, started_at, completed_at
         FROM task_results WHERE device_id = ?1 ORDER BY completed_at DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![device_id.to_string(), limit as i64], row_to_result)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list task results for device")
}

pub fn cleanup_old(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    let count = conn.execute(
        "DELETE FROM task_results WHERE completed_at < ?1",
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

    fn sample_result(task_id: Uuid, device_id: Uuid) -> TaskResult {
        TaskResult {
            task_id,
            device_id,
            exit_code: 0,
            stdout: "ok".to_string(),
            stderr: String::new(),
            status: TaskResultStatus::Success,
            started_at: Utc::now(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn insert_then_list_for_task() {
        let conn = test_conn();
        let task_id = Uuid::new_v4();
        insert(&conn, &sample_result(task_id, Uuid::new_v4())).unwrap();
        let results = list_for_task(&conn, task_id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].exit_code, 0);
    }

    #[test]
    fn list_for_device_respects_limit() {
        let conn = test_conn();
        let device_id = Uuid::new_v4();
        for _ in 0..5 {
            insert(&conn, &sample_result(Uuid::new_v4(), device_id)).unwrap();
        }
        let results = list_for_device(&conn, device_id, 2).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn cleanup_old_removes_stale_rows() {
        let conn = test_conn();
        insert(&conn, &sample_result(Uuid::new_v4(), Uuid::new_v4())).unwrap();
        let removed = cleanup_old(&conn, Utc::now() + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(removed, 1);
    }
}
