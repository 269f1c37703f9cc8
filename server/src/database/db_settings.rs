//! Settings table: a flat key/value store for dashboard-editable server knobs
//!
//! Values are always stored and returned as strings; callers parse into the
//! type they expect. Missing keys fall back to the defaults seeded by
//! [`seed_defaults`].

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use shared::model::Setting;

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            label TEXT NOT NULL,
            category TEXT NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create settings table")?;
    Ok(())
}

/// Seed a setting only if it is not already present, so existing operator
/// edits survive a server upgrade that adds new default keys.
pub fn seed_default(conn: &Connection, setting: &Setting) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO settings (key, value, label, category) VALUES (?1, ?2, ?3, ?4)",
        params![setting.key, setting.value, setting.label, setting.category],
    )
    .context("Failed to seed default setting")?;
    Ok(())
}

pub fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| {
        row.get(0)
    })
    .optional()
    .context("Failed to query setting")
}

pub fn set(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "UPDATE settings SET value = ?1 WHERE key = ?2",
        params![value, key],
    )
    .context("Failed to update setting")?;
    Ok(())
}

pub fn list_all(conn: &Connection) -> Result<Vec<Setting>> {
    let mut stmt = conn.prepare("SELECT key, value, label, category FROM settings ORDER BY category, key")?;
    let rows = stmt.query_map([], |row| {
        Ok(Setting {
            key: row.get(0)?,
            value: row.get(1)?,
            label: row.get(2)?,
            category: row.get(3)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().context("Failed to list settings")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        conn
    }

    fn sample() -> Setting {
        Setting {
            key: "heartbeat_interval_seconds".to_string(),
            value: "60".to_string(),
            label: "Heartbeat interval".to_string(),
            category: "pacing".to_string(),
        }
    }

    #[test]
    fn seed_then_get_round_trips() {
        let conn = test_conn();
        seed_default(&conn, &sample()).unwrap();
        assert_eq!(get(&conn, "heartbeat_interval_seconds").unwrap(), Some("60".to_string()));
    }

    #[test]
    fn seed_default_does_not_clobber_existing_value() {
        let conn = test_conn();
        seed_default(&conn, &sample()).unwrap();
        set(&conn, "heartbeat_interval_seconds", "120").unwrap();
        seed_default(&conn, &sample()).unwrap();
        assert_eq!(get(&conn, "heartbeat_interval_seconds").unwrap(), Some("120".to_string()));
    }

    #[test]
    fn get_missing_key_returns_none() {
        let conn = test_conn();
        assert_eq!(get(&conn, "nonexistent").unwrap(), None);
    }
}
