//! Local collectors invoked by inbound channel requests
//!
//! Each function here answers one `ServerMessage` variant: process listing
//! and termination, the disk/hardware/software scanners, and the quick
//! action (shutdown/restart/lock/sleep) shell-out. All are best-effort: a
//! platform without a given capability returns an empty result rather than
//! an error, since the channel receive loop must never stall on one
//! collector's failure.

use shared::api::{
    DiskDetail, DiskScanPayload, HwReportPayload, ProcessEntry, QuickAction, SoftwareEntry,
    SoftwareReportPayload,
};
use sysinfo::{Disks, Pid, ProcessesToUpdate, System};
use tracing::{info, warn};

pub fn list_processes() -> Vec<ProcessEntry> {
    let mut system = System::new_all();
    system.refresh_processes(ProcessesToUpdate::All, true);

    system
        .processes()
        .values()
        .map(|process| ProcessEntry {
            pid: process.pid().as_u32(),
            name: process.name().to_string_lossy().to_string(),
            cpu: process.cpu_usage(),
            mem_mb: process.memory() as f64 / (1024.0 * 1024.0),
            path: process.exe().map(|p| p.to_string_lossy().to_string()),
        })
        .collect()
}

pub fn kill_process(pid: u32) -> bool {
    let mut system = System::new_all();
    system.refresh_processes(ProcessesToUpdate::All, true);
    match system.process(Pid::from_u32(pid)) {
        Some(process) => {
            let killed = process.kill();
            if killed {
                info!(pid, "Killed process");
            } else {
                warn!(pid, "Failed to kill process");
            }
            killed
        }
        None => {
            warn!(pid, "Process not found for kill request");
            false
        }
    }
}

pub fn scan_disks() -> DiskScanPayload {
    let disks = Disks::new_with_refreshed_list();
    let details = disks
        .iter()
        .map(|disk| DiskDetail {
            mount_point: disk.mount_point().to_string_lossy().to_string(),
            total_bytes: disk.total_space(),
            used_bytes: disk.total_space().saturating_sub(disk.available_space()),
        })
        .collect();
    DiskScanPayload { details }
}

pub fn report_hardware() -> HwReportPayload {
    let mut system = System::new_all();
    system.refresh_cpu_usage();
    system.refresh_memory();

    let cpu_model = system
        .cpus()
        .first()
        .map(|cpu| cpu.brand().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let cpu_cores = system.cpus().len() as u32;
    let total_ram_mb = system.total_memory() / (1024 * 1024);

    let disks = Disks::new_with_refreshed_list();
    let total_disk_mb = disks.iter().map(|d| d.total_space()).sum::<u64>() / (1024 * 1024);

    HwReportPayload {
        cpu_model,
        cpu_cores,
        total_ram_mb,
        total_disk_mb,
    }
}

/// Installed software inventory. No crate in the dependency stack surfaces
/// this portably, so each platform shells out to its native package
/// listing; an unsupported platform (or a failed shell-out) returns an
/// empty inventory rather than erroring.
pub fn report_software() -> SoftwareReportPayload {
    let apps = installed_packages();
    SoftwareReportPayload { apps }
}

#[cfg(target_os = "linux")]
fn installed_packages() -> Vec<SoftwareEntry> {
    use std::process::Command;

    let output = Command::new("dpkg-query")
        .args(["-W", "-f=${Package}\\t${Version}\\t${Maintainer}\\n"])
        .output();
    let Ok(output) = output else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(3, '\t');
            let name = fields.next()?.to_string();
            let version = fields.next().map(|s| s.to_string()).filter(|s| !s.is_empty());
            let publisher = fields.next().map(|s| s.to_string()).filter(|s| !s.is_empty());
            Some(SoftwareEntry {
                name,
                version,
                publisher,
                install_date: None,
            })
        })
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn installed_packages() -> Vec<SoftwareEntry> {
    Vec::new()
}

/// Run the platform shutdown/restart/lock/sleep command for a quick action.
/// Best-effort: a failure is logged, never propagated, since the caller has
/// no meaningful recovery beyond reporting the outcome.
pub fn run_quick_action(action: QuickAction) {
    let result = spawn_quick_action(action);
    match result {
        Ok(_) => info!(?action, "Quick action dispatched"),
        Err(e) => warn!(?action, error = %e, "Quick action failed to spawn"),
    }
}

#[cfg(target_os = "linux")]
fn spawn_quick_action(action: QuickAction) -> std::io::Result<std::process::Child> {
    use std::process::Command;
    match action {
        QuickAction::Shutdown => Command::new("shutdown").args(["-h", "now"]).spawn(),
        QuickAction::Restart => Command::new("shutdown").args(["-r", "now"]).spawn(),
        QuickAction::Lock => Command::new("loginctl").arg("lock-session").spawn(),
        QuickAction::Sleep => Command::new("systemctl").arg("suspend").spawn(),
    }
}

#[cfg(target_os = "windows")]
fn spawn_quick_action(action: QuickAction) -> std::io::Result<std::process::Child> {
    use std::process::Command;
    match action {
        QuickAction::Shutdown => Command::new("shutdown").args(["/s", "/t", "0"]).spawn(),
        QuickAction::Restart => Command::new("shutdown").args(["/r", "/t", "0"]).spawn(),
        QuickAction::Lock => Command::new("rundll32.exe")
            .args(["user32.dll,LockWorkStation"])
            .spawn(),
        QuickAction::Sleep => Command::new("rundll32.exe")
            .args(["powrprof.dll,SetSuspendState", "0,1,0"])
            .spawn(),
    }
}

#[cfg(target_os = "macos")]
fn spawn_quick_action(action: QuickAction) -> std::io::Result<std::process::Child> {
    use std::process::Command;
    match action {
        QuickAction::Shutdown => Command::new("shutdown").args(["-h", "now"]).spawn(),
        QuickAction::Restart => Command::new("shutdown").args(["-r", "now"]).spawn(),
        QuickAction::Lock => Command::new("pmset").arg("displaysleepnow").spawn(),
        QuickAction::Sleep => Command::new("pmset").arg("sleepnow").spawn(),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
fn spawn_quick_action(_action: QuickAction) -> std::io::Result<std::process::Child> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "quick actions are not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_processes_includes_current_process() {
        let processes = list_processes();
        let pid = std::process::id();
        assert!(processes.iter().any(|p| p.pid == pid));
    }

    #[test]
    fn scan_disks_returns_at_least_one_mount() {
        let payload = scan_disks();
        assert!(!payload.details.is_empty());
    }

    #[test]
    fn report_hardware_reports_nonzero_cores() {
        let report = report_hardware();
        assert!(report.cpu_cores > 0);
    }
}
