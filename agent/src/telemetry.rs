//! Local telemetry sampling
//!
//! Produces the [`TelemetrySnapshot`] carried by every heartbeat and by the
//! check-in request. Battery state has no corresponding crate anywhere in
//! the dependency stack, so it is read directly from `/sys/class/power_supply`
//! on Linux and reported as `None` everywhere else — callers already treat an
//! unknown battery reading as "plugged in" (see `PacingPolicy::interval_for`).

use std::net::UdpSocket;

use shared::api::TelemetrySnapshot;
use sysinfo::{Disks, System};

/// Best-effort local (non-loopback) IPv4 address, found without sending any
/// packets: connecting a UDP socket only resolves routing, it never
/// transmits anything.
fn local_ip_address() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

#[cfg(target_os = "linux")]
fn battery_state() -> (Option<f64>, Option<bool>) {
    let base = std::path::Path::new("/sys/class/power_supply");
    let Ok(entries) = std::fs::read_dir(base) else {
        return (None, None);
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("BAT") {
            continue;
        }
        let capacity = std::fs::read_to_string(path.join("capacity"))
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok());
        let status = std::fs::read_to_string(path.join("status")).ok();
        let charging = status.map(|s| s.trim().eq_ignore_ascii_case("charging"));
        return (capacity, charging);
    }
    (None, None)
}

#[cfg(not(target_os = "linux"))]
fn battery_state() -> (Option<f64>, Option<bool>) {
    (None, None)
}

fn disk_percent() -> f64 {
    let disks = Disks::new_with_refreshed_list();
    let root = disks
        .iter()
        .find(|d| d.mount_point().as_os_str() == "/")
        .or_else(|| disks.iter().next());
    match root {
        Some(disk) => {
            let total = disk.total_space();
            if total == 0 {
                0.0
            } else {
                let used = total.saturating_sub(disk.available_space());
                (used as f64 / total as f64) * 100.0
            }
        }
        None => 0.0,
    }
}

/// Sample current system state into a wire-ready snapshot.
pub fn snapshot(agent_version: Option<String>) -> TelemetrySnapshot {
    let mut system = System::new_all();
    system.refresh_cpu_usage();
    system.refresh_memory();

    let cpu_percent = system.global_cpu_usage() as f64;
    let ram_percent = if system.total_memory() == 0 {
        0.0
    } else {
        (system.used_memory() as f64 / system.total_memory() as f64) * 100.0
    };
    let (battery_percent, battery_charging) = battery_state();

    TelemetrySnapshot {
        hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
        ip_address: local_ip_address(),
        os_info: format!(
            "{} {}",
            System::name().unwrap_or_else(|| "unknown".to_string()),
            System::os_version().unwrap_or_default()
        ),
        battery_percent,
        battery_charging,
        cpu_percent,
        ram_percent,
        disk_percent: disk_percent(),
        agent_version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_plausible_percentages() {
        let snap = snapshot(Some("0.1.0".to_string()));
        assert!(snap.cpu_percent >= 0.0);
        assert!(snap.ram_percent >= 0.0 && snap.ram_percent <= 100.0);
        assert!(!snap.hostname.is_empty());
    }
}
