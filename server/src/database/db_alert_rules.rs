//! Alert rule table
//!
//! Rules are small and few relative to metric volume, so the alert engine
//! (C12) simply loads the active set on every evaluation tick rather than
//! caching it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::model::{AlertAction, AlertMetric, AlertOperator, AlertRule, TargetType};

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS alert_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            metric TEXT NOT NULL,
            operator TEXT NOT NULL,
            threshold REAL NOT NULL,
            duration_minutes INTEGER NOT NULL,
            target_type TEXT NOT NULL,
            target_id TEXT,
            action TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            last_fired TEXT
        )
        "#,
        [],
    )
    .context("Failed to create alert_rules table")?;
    Ok(())
}

fn metric_str(m: AlertMetric) -> &'static str {
    match m {
        AlertMetric::Cpu => "cpu",
        AlertMetric::Ram => "ram",
        AlertMetric::Disk => "disk",
        AlertMetric::Battery => "battery",
    }
}

fn parse_metric(s: &str) -> AlertMetric {
    match s {
        "ram" => AlertMetric::Ram,
        "disk" => AlertMetric::Disk,
        "battery" => AlertMetric::Battery,
        _ => AlertMetric::Cpu,
    }
}

fn operator_str(o: AlertOperator) -> &'static str {
    match o {
        AlertOperator::Gt => "gt",
        AlertOperator::Lt => "lt",
        AlertOperator::Eq => "eq",
    }
}

fn parse_operator(s: &str) -> AlertOperator {
    match s {
        "lt" => AlertOperator::Lt,
        "eq" => AlertOperator::Eq,
        _ => AlertOperator::Gt,
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

fn action_str(a: AlertAction) -> &'static str {
    match a {
        AlertAction::Email => "email",
        AlertAction::Log => "log",
    }
}

fn parse_action(s: &str) -> AlertAction {
    match s {
        "email" => AlertAction::Email,
        _ => AlertAction::Log,
    }
}

fn row_to_rule(row: &Row) -> rusqlite::Result<AlertRule> {
    let metric: String = row.get(2)?;
    let operator: String = row.get(3)?;
    let target_type: String = row.get(6)?;
    let action: String = row.get(8)?;
    let last_fired: Option<String> = row.get(10)?;

    Ok(AlertRule {
        id: row.get(0)?,
        name: row.get(1)?,
        metric: parse_metric(&metric),
        operator: parse_operator(&operator),
        threshold: row.get(4)?,
        duration_minutes: row.get::<_, i64>(5)? as u32,
        target_type: parse_target_type(&target_type),
        target_id: row.get(7)?,
        action: parse_action(&action),
        active: row.get::<_, i64>(9)? != 0,
        last_fired: last_fired.and_then(|s| s.parse::<DateTime<Utc>>().ok()),
    })
}

const SELECT_COLUMNS: &str = "id, name, metric, operator, threshold, duration_minutes,
     target_type, target_id, action, active, last_fired";

pub fn insert(conn: &Connection, rule: &AlertRule) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO alert_rules
            (name, metric, operator, threshold, duration_minutes, target_type, target_id,
             action, active, last_fired)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            rule.name,
            metric_str(rule.metric),
            operator_str(rule.operator),
            rule.threshold,
            rule.duration_minutes as i64,
            target_type_str(rule.target_type),
            rule.target_id,
            action_str(rule.action),
            rule.active as i64,
            rule.last_fired.map(|d| d.to_rfc3339()),
        ],
    )
    .context("Failed to insert alert rule")?;
    Ok(conn.last_insert_rowid())
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<AlertRule>> {
    let sql = format!("SELECT {} FROM alert_rules WHERE id = ?1", SELECT_COLUMNS);
    conn.query_row(&sql, params![id], row_to_rule)
        .optional()
        .context("Failed to query alert rule")
}

pub fn list_active(conn: &Connection) -> Result<Vec<AlertRule>> {
    let sql = format!("SELECT {} FROM alert_rules WHERE active = 1", SELECT_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_rule)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().context("Failed to list active alert rules")
}

pub fn list_all(conn: &Connection) -> Result<Vec<AlertRule>> {
    let sql = format!("SELECT {} FROM alert_rules ORDER BY id", SELECT_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_rule)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().context("Failed to list alert rules")
}

pub fn mark_fired(conn: &Connection, id: i64, when: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE alert_rules SET last_fired = ?1 WHERE id = ?2",
        params![when.to_rfc3339(), id],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM alert_rules WHERE id = ?1", params![id])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        conn
    }

    fn sample_rule() -> AlertRule {
        AlertRule {
            id: 0,
            name: "high cpu".to_string(),
            metric: AlertMetric::Cpu,
            operator: AlertOperator::Gt,
            threshold: 90.0,
            duration_minutes: 5,
            target_type: TargetType::All,
            target_id: None,
            action: AlertAction::Log,
            active: true,
            last_fired: None,
        }
    }

    #[test]
    fn insert_then_get_round_trips() {
        let conn = test_conn();
        let id = insert(&conn, &sample_rule()).unwrap();
        let fetched = get(&conn, id).unwrap().unwrap();
        assert_eq!(fetched.name, "high cpu");
        assert_eq!(fetched.threshold, 90.0);
    }

    #[test]
    fn mark_fired_is_reflected_in_throttle_check() {
        let conn = test_conn();
        let id = insert(&conn, &sample_rule()).unwrap();
        let now = Utc::now();
        mark_fired(&conn, id, now).unwrap();
        let fetched = get(&conn, id).unwrap().unwrap();
        assert!(fetched.is_throttled(now));
    }

    #[test]
    fn list_active_excludes_disabled_rules() {
        let conn = test_conn();
        let mut rule = sample_rule();
        rule.active = false;
        insert(&conn, &rule).unwrap();
        insert(&conn, &sample_rule()).unwrap();
        assert_eq!(list_active(&conn).unwrap().len(), 1);
        assert_eq!(list_all(&conn).unwrap().len(), 2);
    }
}
