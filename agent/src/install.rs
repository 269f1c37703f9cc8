//! Boot-entry registration and single-instance guard
//!
//! Backs the agent's `--install`/`--uninstall`/`--status` CLI surface and the
//! default (no-arg) single-instance check. Installer *packaging* (MSI/deb/
//! zip) is out of scope; this only stages the already-built binary into the
//! shared data directory and registers it with the platform's native
//! boot-time start mechanism, shelling out to the platform's own tool the
//! same way `collectors::run_quick_action` does for its platform-specific
//! commands, since no crate in the dependency stack covers service
//! registration portably.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{info, warn};

const SERVICE_NAME: &str = "rmm-agent";
const LOCK_FILE: &str = "agent.lock";

/// Platform-appropriate shared (per-machine) data directory for state,
/// the task cache, the outbox database, and logs.
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let base = std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_string());
        PathBuf::from(base).join(SERVICE_NAME)
    }
    #[cfg(target_os = "macos")]
    {
        PathBuf::from("/Library/Application Support").join(SERVICE_NAME)
    }
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib").join(SERVICE_NAME)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        std::env::temp_dir().join(SERVICE_NAME)
    }
}

/// `Ok(true)` if the lock was acquired (no other live instance holds it).
/// `Ok(false)` means a process matching the recorded pid is still alive and
/// the caller must exit immediately without starting any background loop.
pub fn acquire_single_instance_guard(data_dir: &Path) -> Result<bool> {
    let lock_path = data_dir.join(LOCK_FILE);

    if let Ok(existing) = std::fs::read_to_string(&lock_path) {
        if let Ok(pid) = existing.trim().parse::<u32>() {
            if pid != std::process::id() {
                let mut system = System::new_all();
                system.refresh_processes(ProcessesToUpdate::All, true);
                if system.process(Pid::from_u32(pid)).is_some() {
                    warn!(pid, "Another agent instance is already running");
                    return Ok(false);
                }
            }
        }
    }

    std::fs::create_dir_all(data_dir).with_context(|| format!("creating data directory {}", data_dir.display()))?;
    std::fs::write(&lock_path, std::process::id().to_string())
        .with_context(|| format!("writing {}", lock_path.display()))?;
    Ok(true)
}

/// Stage the current binary into `data_dir`, register a boot-time start
/// entry, and launch the staged copy immediately.
pub fn install(data_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(data_dir).with_context(|| format!("creating data directory {}", data_dir.display()))?;

    let current_exe = std::env::current_exe().context("locating current executable")?;
    let staged_path = data_dir.join(staged_binary_name());
    std::fs::copy(&current_exe, &staged_path)
        .with_context(|| format!("staging binary to {}", staged_path.display()))?;
    info!(path = %staged_path.display(), "Agent binary staged");

    register_boot_entry(&staged_path)?;
    info!("Boot-time start entry registered");

    Command::new(&staged_path).spawn().context("launching staged agent")?;
    info!("Agent launched");
    Ok(())
}

pub fn uninstall() -> Result<()> {
    deregister_boot_entry()?;
    info!("Boot-time start entry removed");
    Ok(())
}

pub fn status() {
    match boot_entry_status() {
        Ok(true) => println!("{SERVICE_NAME}: installed (boot entry present)"),
        Ok(false) => println!("{SERVICE_NAME}: not installed"),
        Err(e) => println!("{SERVICE_NAME}: status check failed: {e}"),
    }
}

#[cfg(target_os = "windows")]
fn staged_binary_name() -> &'static str {
    "agent.exe"
}

#[cfg(not(target_os = "windows"))]
fn staged_binary_name() -> &'static str {
    "agent"
}

#[cfg(target_os = "windows")]
const RUN_KEY: &str = r"HKCU\Software\Microsoft\Windows\CurrentVersion\Run";

#[cfg(target_os = "windows")]
fn register_boot_entry(staged_path: &Path) -> Result<()> {
    let value = format!("\"{}\"", staged_path.display());
    let status = Command::new("reg")
        .args(["add", RUN_KEY, "/v", SERVICE_NAME, "/t", "REG_SZ", "/d", &value, "/f"])
        .status()
        .context("invoking reg.exe")?;
    anyhow::ensure!(status.success(), "reg add exited with {status}");
    Ok(())
}

#[cfg(target_os = "windows")]
fn deregister_boot_entry() -> Result<()> {
    let _ = Command::new("reg").args(["delete", RUN_KEY, "/v", SERVICE_NAME, "/f"]).status();
    Ok(())
}

#[cfg(target_os = "windows")]
fn boot_entry_status() -> Result<bool> {
    let output = Command::new("reg")
        .args(["query", RUN_KEY, "/v", SERVICE_NAME])
        .output()
        .context("invoking reg.exe")?;
    Ok(output.status.success())
}

#[cfg(target_os = "linux")]
fn unit_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    PathBuf::from(home).join(".config/systemd/user").join(format!("{SERVICE_NAME}.service"))
}

#[cfg(target_os = "linux")]
fn register_boot_entry(staged_path: &Path) -> Result<()> {
    let unit = unit_path();
    if let Some(parent) = unit.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let contents = format!(
        "[Unit]\nDescription=RMM endpoint agent\n\n[Service]\nExecStart={}\nRestart=always\n\n[Install]\nWantedBy=default.target\n",
        staged_path.display()
    );
    std::fs::write(&unit, contents).with_context(|| format!("writing {}", unit.display()))?;

    let status = Command::new("systemctl")
        .args(["--user", "enable", "--now", SERVICE_NAME])
        .status()
        .context("invoking systemctl")?;
    anyhow::ensure!(status.success(), "systemctl enable exited with {status}");
    Ok(())
}

#[cfg(target_os = "linux")]
fn deregister_boot_entry() -> Result<()> {
    let _ = Command::new("systemctl").args(["--user", "disable", "--now", SERVICE_NAME]).status();
    let _ = std::fs::remove_file(unit_path());
    Ok(())
}

#[cfg(target_os = "linux")]
fn boot_entry_status() -> Result<bool> {
    Ok(unit_path().exists())
}

#[cfg(target_os = "macos")]
fn plist_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/var/root".to_string());
    PathBuf::from(home).join("Library/LaunchAgents").join(format!("com.{SERVICE_NAME}.plist"))
}

#[cfg(target_os = "macos")]
fn register_boot_entry(staged_path: &Path) -> Result<()> {
    let plist = plist_path();
    if let Some(parent) = plist.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let contents = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n<plist version=\"1.0\"><dict>\n<key>Label</key><string>com.{SERVICE_NAME}</string>\n<key>ProgramArguments</key><array><string>{}</string></array>\n<key>RunAtLoad</key><true/>\n<key>KeepAlive</key><true/>\n</dict></plist>\n",
        staged_path.display()
    );
    std::fs::write(&plist, contents).with_context(|| format!("writing {}", plist.display()))?;

    let status = Command::new("launchctl").args(["load", "-w"]).arg(&plist).status().context("invoking launchctl")?;
    anyhow::ensure!(status.success(), "launchctl load exited with {status}");
    Ok(())
}

#[cfg(target_os = "macos")]
fn deregister_boot_entry() -> Result<()> {
    let plist = plist_path();
    let _ = Command::new("launchctl").args(["unload"]).arg(&plist).status();
    let _ = std::fs::remove_file(plist);
    Ok(())
}

#[cfg(target_os = "macos")]
fn boot_entry_status() -> Result<bool> {
    Ok(plist_path().exists())
}

#[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
fn register_boot_entry(_staged_path: &Path) -> Result<()> {
    anyhow::bail!("boot-entry registration is not supported on this platform")
}

#[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
fn deregister_boot_entry() -> Result<()> {
    Ok(())
}

#[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
fn boot_entry_status() -> Result<bool> {
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn guard_acquired_when_no_lock_file_present() {
        let dir = TempDir::new().unwrap();
        assert!(acquire_single_instance_guard(dir.path()).unwrap());
    }

    #[test]
    fn guard_acquired_again_when_lock_holds_our_own_pid() {
        let dir = TempDir::new().unwrap();
        assert!(acquire_single_instance_guard(dir.path()).unwrap());
        assert!(acquire_single_instance_guard(dir.path()).unwrap());
    }

    #[test]
    fn guard_rejects_lock_held_by_another_live_pid() {
        let dir = TempDir::new().unwrap();
        let mut system = System::new_all();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let Some(other_pid) = system.processes().keys().find(|pid| pid.as_u32() != std::process::id()).map(|pid| pid.as_u32()) else {
            return;
        };
        std::fs::write(dir.path().join(LOCK_FILE), other_pid.to_string()).unwrap();
        assert!(!acquire_single_instance_guard(dir.path()).unwrap());
    }
}
