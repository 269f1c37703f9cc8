//! Task table: the work distributed to devices
//!
//! Every trigger type is persisted, including `now`: the dispatcher still
//! needs a durable row to flip to `dispatched` as its commit point. The
//! check-in snapshot query is what excludes `now` tasks (they are only ever
//! delivered live, never bootstrapped), not the table itself.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::model::{EventTrigger, ScriptType, Task, TargetType, TaskStatus, TriggerType};
use uuid::Uuid;

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            script_type TEXT NOT NULL,
            script_body TEXT NOT NULL,
            trigger_type TEXT NOT NULL,
            scheduled_at TEXT,
            interval_seconds INTEGER,
            cron_expression TEXT,
            event_trigger TEXT,
            target_type TEXT NOT NULL,
            target_id TEXT,
            status TEXT NOT NULL,
            cancelled INTEGER NOT NULL DEFAULT 0,
            last_run TEXT,
            created_at TEXT NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create tasks table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, trigger_type)",
        [],
    )?;

    Ok(())
}

fn script_type_str(t: ScriptType) -> &'static str {
    match t {
        ScriptType::Powershell => "powershell",
        ScriptType::Cmd => "cmd",
        ScriptType::Python => "python",
        ScriptType::Bash => "bash",
        ScriptType::Unknown => "unknown",
    }
}

fn parse_script_type(s: &str) -> ScriptType {
    match s {
        "powershell" => ScriptType::Powershell,
        "cmd" => ScriptType::Cmd,
        "python" => ScriptType::Python,
        "bash" => ScriptType::Bash,
        _ => ScriptType::Unknown,
    }
}

fn trigger_type_str(t: TriggerType) -> &'static str {
    match t {
        TriggerType::Now => "now",
        TriggerType::Once => "once",
        TriggerType::Interval => "interval",
        TriggerType::Cron => "cron",
        TriggerType::Event => "event",
    }
}

fn parse_trigger_type(s: &str) -> TriggerType {
    match s {
        "now" => TriggerType::Now,
        "once" => TriggerType::Once,
        "interval" => TriggerType::Interval,
        "cron" => TriggerType::Cron,
        _ => TriggerType::Event,
    }
}

fn target_type_str(t: TargetType) -> &'static str {
    match t {
        TargetType::All => "all",
        TargetType::Device => "device",
        TargetType::Group => "group",
    }
}

fn parse_target_type(s: &str) -> TargetType {
    match s {
        "device" => TargetType::Device,
        "group" => TargetType::Group,
        _ => TargetType::All,
    }
}

fn status_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::Pending => "pending",
        TaskStatus::Dispatched => "dispatched",
        TaskStatus::Done => "done",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn parse_status(s: &str) -> TaskStatus {
    match s {
        "pending" => TaskStatus::Pending,
        "dispatched" => TaskStatus::Dispatched,
        "cancelled" => TaskStatus::Cancelled,
        _ => TaskStatus::Done,
    }
}

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    let task_id: String = row.get(0)?;
    let script_type: String = row.get(2)?;
    let trigger_type: String = row.get(4)?;
    let scheduled_at: Option<String> = row.get(5)?;
    let event_trigger: Option<String> = row.get(8)?;
    let target_type: String = row.get(9)?;
    let status: String = row.get(11)?;
    let last_run: Option<String> = row.get(13)?;

    Ok(Task {
        task_id: Uuid::parse_str(&task_id).unwrap_or_else(|_| Uuid::nil()),
        name: row.get(1)?,
        script_type: parse_script_type(&script_type),
        script_body: row.get(3)?,
        trigger_type: parse_trigger_type(&trigger_type),
        scheduled_at: scheduled_at.and_then(|s| s.parse::<DateTime<Utc>>().ok()),
        interval_seconds: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
        cron_expression: row.get(7)?,
        event_trigger: event_trigger.map(|s| match s.as_str() {
            _ => EventTrigger::NetworkChange,
        }),
        target_type: parse_target_type(&target_type),
        target_id: row.get(10)?,
        status: parse_status(&status),
        cancelled: row.get::<_, i64>(12)? != 0,
        last_run: last_run.and_then(|s| s.parse::<DateTime<Utc>>().ok()),
    })
}

const SELECT_COLUMNS: &str = "task_id, name, script_type, script_body, trigger_type,
     scheduled_at, interval_seconds, cron_expression, event_trigger, target_type,
     target_id, status, cancelled, last_run";

pub fn insert(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO tasks ({cols}, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            cols = SELECT_COLUMNS
        ),
        params![
            task.task_id.to_string(),
            task.name,
            script_type_str(task.script_type),
            task.script_body,
            trigger_type_str(task.trigger_type),
            task.scheduled_at.map(|d| d.to_rfc3339()),
            task.interval_seconds.map(|v| v as i64),
            task.cron_expression,
            task.event_trigger.map(|_| "network_change"),
            target_type_str(task.target_type),
            task.target_id,
            status_str(task.status),
            task.cancelled as i64,
            task.last_run.map(|d| d.to_rfc3339()),
            Utc::now().to_rfc3339(),
        ],
    )
    .context("Failed to insert task")?;
    Ok(())
}

pub fn get(conn: &Connection, task_id: Uuid) -> Result<Option<Task>> {
    let sql = format!("SELECT {} FROM tasks WHERE task_id = ?1", SELECT_COLUMNS);
    conn.query_row(&sql, params![task_id.to_string()], row_to_task)
        .optional()
        .context("Failed to query task")
}

pub fn list_all(conn: &Connection) -> Result<Vec<Task>> {
    let sql = format!("SELECT {} FROM tasks ORDER BY created_at DESC", SELECT_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_task)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().context("Failed to list tasks")
}

/// Tasks eligible for inclusion in a device's check-in bootstrap snapshot:
/// pending, not cancelled, and not `trigger_type=now`.
pub fn list_checkin_snapshot(conn: &Connection) -> Result<Vec<Task>> {
    let sql = format!(
        "SELECT {} FROM tasks WHERE status = 'pending' AND cancelled = 0 AND trigger_type != 'now'",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_task)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().context("Failed to list checkin snapshot tasks")
}

/// Tasks the dispatcher (C9) should evaluate for firing: every still-pending,
/// non-cancelled task. Only `now`/`once` ever come back due from C9's
/// `is_due`; interval/cron/event tasks are listed here too but stay pending
/// server-side forever (the agent evaluates and runs them locally).
pub fn list_schedulable(conn: &Connection) -> Result<Vec<Task>> {
    let sql = format!(
        "SELECT {} FROM tasks WHERE status = 'pending' AND cancelled = 0",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_task)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().context("Failed to list schedulable tasks")
}

pub fn set_status(conn: &Connection, task_id: Uuid, status: TaskStatus) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET status = ?1 WHERE task_id = ?2",
        params![status_str(status), task_id.to_string()],
    )?;
    Ok(())
}

pub fn mark_last_run(conn: &Connection, task_id: Uuid, when: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET last_run = ?1 WHERE task_id = ?2",
        params![when.to_rfc3339(), task_id.to_string()],
    )?;
    Ok(())
}

pub fn cancel(conn: &Connection, task_id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET cancelled = 1, status = 'cancelled' WHERE task_id = ?1",
        params![task_id.to_string()],
    )?;
    Ok(())
}

pub fn cleanup_old_done(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    let count = conn.execute(
        "DELETE FROM tasks WHERE status IN ('done', 'cancelled') AND created_at < ?1
         AND trigger_type IN ('now', 'once')",
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

    fn sample_task(trigger: TriggerType) -> Task {
        Task {
            task_id: Uuid::new_v4(),
            name: "cleanup temp".to_string(),
            script_type: ScriptType::Bash,
            script_body: "rm -rf /tmp/*".to_string(),
            trigger_type: trigger,
            scheduled_at: None,
            interval_seconds: Some(3600),
            cron_expression: None,
            event_trigger: None,
            target_type: TargetType::All,
            target_id: None,
            status: TaskStatus::Pending,
            cancelled: false,
            last_run: None,
        }
    }

    #[test]
    fn insert_then_get_round_trips() {
        let conn = test_conn();
        let task = sample_task(TriggerType::Interval);
        insert(&conn, &task).unwrap();
        let fetched = get(&conn, task.task_id).unwrap().unwrap();
        assert_eq!(fetched.name, "cleanup temp");
        assert_eq!(fetched.interval_seconds, Some(3600));
    }

    #[test]
    fn checkin_snapshot_excludes_now_triggered_tasks() {
        let conn = test_conn();
        insert(&conn, &sample_task(TriggerType::Now)).unwrap();
        insert(&conn, &sample_task(TriggerType::Interval)).unwrap();
        let snapshot = list_checkin_snapshot(&conn).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].trigger_type, TriggerType::Interval);
    }

    #[test]
    fn cancel_excludes_task_from_snapshot() {
        let conn = test_conn();
        let task = sample_task(TriggerType::Once);
        insert(&conn, &task).unwrap();
        cancel(&conn, task.task_id).unwrap();
        let snapshot = list_checkin_snapshot(&conn).unwrap();
        assert_eq!(snapshot.len(), 0);
    }

    #[test]
    fn schedulable_includes_now_and_excludes_dispatched() {
        let conn = test_conn();
        let now_task = sample_task(TriggerType::Now);
        insert(&conn, &now_task).unwrap();
        let once_task = sample_task(TriggerType::Once);
        insert(&conn, &once_task).unwrap();
        set_status(&conn, once_task.task_id, TaskStatus::Dispatched).unwrap();

        let schedulable = list_schedulable(&conn).unwrap();
        assert_eq!(schedulable.len(), 1);
        assert_eq!(schedulable[0].task_id, now_task.task_id);
    }

    #[test]
    fn mark_last_run_updates_timestamp() {
        let conn = test_conn();
        let task = sample_task(TriggerType::Cron);
        insert(&conn, &task).unwrap();
        let now = Utc::now();
        mark_last_run(&conn, task.task_id, now).unwrap();
        let fetched = get(&conn, task.task_id).unwrap().unwrap();
        assert!(fetched.last_run.is_some());
    }
}
