//! Device registry table
//!
//! One row per device that has ever checked in. Rows are upserted on every
//! check-in and heartbeat; nothing here is append-only.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::model::{Device, DeviceStatus};
use uuid::Uuid;

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS devices (
            device_id TEXT PRIMARY KEY,
            hostname TEXT NOT NULL,
            platform TEXT NOT NULL,
            os_info TEXT NOT NULL,
            ip_address TEXT,
            mac_address TEXT,
            agent_version TEXT,
            status TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            cpu_percent REAL,
            ram_percent REAL,
            disk_percent REAL,
            battery_percent REAL,
            battery_charging INTEGER,
            group_name TEXT,
            locked_down INTEGER NOT NULL DEFAULT 0
        )
        "#,
        [],
    )
    .context("Failed to create devices table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_devices_last_seen ON devices(last_seen)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_devices_group ON devices(group_name)",
        [],
    )?;

    Ok(())
}

fn row_to_device(row: &Row) -> rusqlite::Result<Device> {
    let device_id: String = row.get(0)?;
    let status: String = row.get(7)?;
    let last_seen: String = row.get(8)?;
    let battery_charging: Option<i64> = row.get(13)?;

    Ok(Device {
        device_id: Uuid::parse_str(&device_id).unwrap_or_else(|_| Uuid::nil()),
        hostname: row.get(1)?,
        platform: row.get(2)?,
        os_info: row.get(3)?,
        ip_address: row.get(4)?,
        mac_address: row.get(5)?,
        agent_version: row.get(6)?,
        status: if status == "online" {
            DeviceStatus::Online
        } else {
            DeviceStatus::Offline
        },
        last_seen: last_seen
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        cpu_percent: row.get(9)?,
        ram_percent: row.get(10)?,
        disk_percent: row.get(11)?,
        battery_percent: row.get(12)?,
        battery_charging: battery_charging.map(|v| v != 0),
        group_name: row.get(14)?,
        locked_down: row.get::<_, i64>(15)? != 0,
    })
}

const SELECT_COLUMNS: &str = "device_id, hostname, platform, os_info, ip_address, mac_address,
     agent_version, status, last_seen, cpu_percent, ram_percent, disk_percent,
     battery_percent, battery_charging, group_name, locked_down";

pub fn upsert(conn: &Connection, device: &Device) -> Result<()> {
    conn.execute(
        &format!(
            r#"
            INSERT INTO devices ({cols})
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(device_id) DO UPDATE SET
                hostname = excluded.hostname,
                platform = excluded.platform,
                os_info = excluded.os_info,
                ip_address = excluded.ip_address,
                mac_address = excluded.mac_address,
                agent_version = excluded.agent_version,
                status = excluded.status,
                last_seen = excluded.last_seen,
                cpu_percent = excluded.cpu_percent,
                ram_percent = excluded.ram_percent,
                disk_percent = excluded.disk_percent,
                battery_percent = excluded.battery_percent,
                battery_charging = excluded.battery_charging,
                group_name = excluded.group_name,
                locked_down = excluded.locked_down
            "#,
            cols = SELECT_COLUMNS
        ),
        params![
            device.device_id.to_string(),
            device.hostname,
            device.platform,
            device.os_info,
            device.ip_address,
            device.mac_address,
            device.agent_version,
            match device.status {
                DeviceStatus::Online => "online",
                DeviceStatus::Offline => "offline",
            },
            device.last_seen.to_rfc3339(),
            device.cpu_percent,
            device.ram_percent,
            device.disk_percent,
            device.battery_percent,
            device.battery_charging.map(|v| v as i64),
            device.group_name,
            device.locked_down as i64,
        ],
    )
    .context("Failed to upsert device")?;
    Ok(())
}

pub fn get(conn: &Connection, device_id: Uuid) -> Result<Option<Device>> {
    let sql = format!("SELECT {} FROM devices WHERE device_id = ?1", SELECT_COLUMNS);
    conn.query_row(&sql, params![device_id.to_string()], row_to_device)
        .optional()
        .context("Failed to query device")
}

pub fn list_all(conn: &Connection) -> Result<Vec<Device>> {
    let sql = format!("SELECT {} FROM devices ORDER BY last_seen DESC", SELECT_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_device)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list devices")
}

/// Online devices belonging to the given group, for group-targeted dispatch.
pub fn list_online_in_group(conn: &Connection, group_name: &str) -> Result<Vec<Device>> {
    let sql = format!(
        "SELECT {} FROM devices WHERE status = 'online' AND group_name = ?1",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![group_name], row_to_device)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list online devices in group")
}

pub fn list_online(conn: &Connection) -> Result<Vec<Device>> {
    let sql = format!("SELECT {} FROM devices WHERE status = 'online'", SELECT_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_device)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list online devices")
}

/// Devices whose `last_seen` predates `cutoff` and are still marked online;
/// these are the offline detector's (C11) candidates.
pub fn list_stale_online(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Vec<Device>> {
    let sql = format!(
        "SELECT {} FROM devices WHERE status = 'online' AND last_seen < ?1",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![cutoff.to_rfc3339()], row_to_device)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list stale devices")
}

pub fn set_status(conn: &Connection, device_id: Uuid, status: DeviceStatus) -> Result<()> {
    conn.execute(
        "UPDATE devices SET status = ?1 WHERE device_id = ?2",
        params![
            match status {
                DeviceStatus::Online => "online",
                DeviceStatus::Offline => "offline",
            },
            device_id.to_string()
        ],
    )?;
    Ok(())
}

pub fn cleanup_old(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    let count = conn.execute(
        "DELETE FROM devices WHERE status = 'offline' AND last_seen < ?1",
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

    #[test]
    fn upsert_then_get_round_trips() {
        let conn = test_conn();
        let device = Device::bootstrap(Uuid::new_v4(), "host1".into(), "linux".into(), "Ubuntu 24.04".into());
        upsert(&conn, &device).unwrap();
        let fetched = get(&conn, device.device_id).unwrap().unwrap();
        assert_eq!(fetched.hostname, "host1");
        assert_eq!(fetched.status, DeviceStatus::Online);
    }

    #[test]
    fn upsert_is_idempotent_by_device_id() {
        let conn = test_conn();
        let mut device = Device::bootstrap(Uuid::new_v4(), "host1".into(), "linux".into(), "Ubuntu".into());
        upsert(&conn, &device).unwrap();
        device.hostname = "renamed".to_string();
        upsert(&conn, &device).unwrap();

        let all = list_all(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].hostname, "renamed");
    }

    #[test]
    fn list_online_in_group_filters_correctly() {
        let conn = test_conn();
        let mut a = Device::bootstrap(Uuid::new_v4(), "a".into(), "linux".into(), "os".into());
        a.group_name = Some("workstations".to_string());
        let mut b = Device::bootstrap(Uuid::new_v4(), "b".into(), "linux".into(), "os".into());
        b.group_name = Some("servers".to_string());
        upsert(&conn, &a).unwrap();
        upsert(&conn, &b).unwrap();

        let workstations = list_online_in_group(&conn, "workstations").unwrap();
        assert_eq!(workstations.len(), 1);
        assert_eq!(workstations[0].hostname, "a");
    }

    #[test]
    fn list_stale_online_respects_cutoff() {
        let conn = test_conn();
        let mut device = Device::bootstrap(Uuid::new_v4(), "host1".into(), "linux".into(), "os".into());
        device.last_seen = Utc::now() - chrono::Duration::hours(1);
        upsert(&conn, &device).unwrap();

        let stale = list_stale_online(&conn, Utc::now() - chrono::Duration::minutes(10)).unwrap();
        assert_eq!(stale.len(), 1);

        let not_stale = list_stale_online(&conn, Utc::now() - chrono::Duration::hours(2)).unwrap();
        assert_eq!(not_stale.len(), 0);
    }
}
