//! Core data model shared by the agent and the server
//!
//! These types are the ones that cross the wire (embedded inside
//! [`crate::api::AgentMessage`]/[`crate::api::ServerMessage`] variants and the
//! check-in request/response) as well as the ones persisted by the server's
//! SQLite database and the agent's local JSON caches.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Liveness status of a device as tracked by the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// A fleet endpoint (workstation, server, handheld).
///
/// `device_id` is minted by the agent on first launch and is immutable for
/// the lifetime of the device; the server never deletes a device row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: Uuid,
    pub hostname: String,
    pub platform: String,
    pub os_info: String,
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
    pub agent_version: Option<String>,
    pub status: DeviceStatus,
    pub last_seen: chrono::DateTime<chrono::Utc>,
    pub cpu_percent: Option<f64>,
    pub ram_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub battery_percent: Option<f64>,
    pub battery_charging: Option<bool>,
    pub group_name: Option<String>,
    pub locked_down: bool,
}

impl Device {
    /// A freshly-seen device record for a first-time check-in, not yet persisted.
    pub fn bootstrap(device_id: Uuid, hostname: String, platform: String, os_info: String) -> Self {
        Self {
            device_id,
            hostname,
            platform,
            os_info,
            ip_address: None,
            mac_address: None,
            agent_version: None,
            status: DeviceStatus::Online,
            last_seen: chrono::Utc::now(),
            cpu_percent: None,
            ram_percent: None,
            disk_percent: None,
            battery_percent: None,
            battery_charging: None,
            group_name: None,
            locked_down: false,
        }
    }
}

/// The shell a task's `script_body` is executed with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    Powershell,
    Cmd,
    Python,
    Bash,
    #[serde(other)]
    Unknown,
}

/// The rule that decides when a task is eligible to fire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Now,
    Once,
    Interval,
    Cron,
    Event,
}

/// Device-observable conditions that can gate an `event`-triggered task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventTrigger {
    NetworkChange,
}

/// Which devices a task's `run_task` envelope is fanned out to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    All,
    Device,
    Group,
}

/// Server-side lifecycle of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Done,
    Cancelled,
}

/// A unit of work distributed to one device, a group, or the whole fleet.
///
/// `trigger_type` determines which of the optional scheduling fields are
/// meaningful: `scheduled_at` only for `once`, `interval_seconds` only for
/// `interval`, `cron_expression` only for `cron`, `event_trigger` only for
/// `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub name: String,
    pub script_type: ScriptType,
    pub script_body: String,
    pub trigger_type: TriggerType,
    pub scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
    pub interval_seconds: Option<u64>,
    pub cron_expression: Option<String>,
    pub event_trigger: Option<EventTrigger>,
    pub target_type: TargetType,
    pub target_id: Option<String>,
    pub status: TaskStatus,
    pub cancelled: bool,
    pub last_run: Option<chrono::DateTime<chrono::Utc>>,
}

impl Task {
    /// Whether this task should be included in a check-in bootstrap snapshot.
    ///
    /// `trigger_type=now` tasks are deliberately excluded: they are only ever
    /// delivered live over the channel, never via the check-in snapshot.
    pub fn eligible_for_checkin_snapshot(&self) -> bool {
        self.status == TaskStatus::Pending
            && !self.cancelled
            && matches!(
                self.trigger_type,
                TriggerType::Once | TriggerType::Interval | TriggerType::Cron | TriggerType::Event
            )
    }
}

/// Outcome of a completed (or timed-out) task execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskResultStatus {
    Success,
    Failed,
}

/// Sentinel exit code used for a task killed by the executor's timeout, or one
/// that never spawned at all.
pub const EXIT_CODE_TIMEOUT_OR_SPAWN_FAILURE: i32 = -1;

/// Bound on persisted `stdout` (tail, in bytes).
pub const TASK_RESULT_STDOUT_CAP: usize = 65_535;
/// Bound on persisted `stderr` (tail, in bytes).
pub const TASK_RESULT_STDERR_CAP: usize = 16_383;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub device_id: Uuid,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub status: TaskResultStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

impl TaskResult {
    /// Exit code 0 is success; anything else (including the timeout sentinel)
    /// is failed.
    pub fn status_for_exit_code(exit_code: i32) -> TaskResultStatus {
        if exit_code == 0 {
            TaskResultStatus::Success
        } else {
            TaskResultStatus::Failed
        }
    }
}

/// One whole-device telemetry snapshot, recorded on each agent heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub device_id: Uuid,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
    pub cpu: f64,
    pub ram: f64,
    pub disk: f64,
    pub battery: Option<f64>,
}

/// Which telemetry field an alert rule watches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    Cpu,
    Ram,
    Disk,
    Battery,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertOperator {
    Gt,
    Lt,
    Eq,
}

impl AlertOperator {
    /// Equality comparisons use a tolerance of 0.5 to avoid false negatives
    /// from floating point telemetry jitter.
    const EQ_TOLERANCE: f64 = 0.5;

    pub fn evaluate(self, observed: f64, threshold: f64) -> bool {
        match self {
            AlertOperator::Gt => observed > threshold,
            AlertOperator::Lt => observed < threshold,
            AlertOperator::Eq => (observed - threshold).abs() <= Self::EQ_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertAction {
    Email,
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    pub name: String,
    pub metric: AlertMetric,
    pub operator: AlertOperator,
    pub threshold: f64,
    pub duration_minutes: u32,
    pub target_type: TargetType,
    pub target_id: Option<String>,
    pub action: AlertAction,
    pub active: bool,
    pub last_fired: Option<chrono::DateTime<chrono::Utc>>,
}

impl AlertRule {
    /// Throttle invariant: a rule that fired within the last hour never
    /// refires regardless of continued threshold violation.
    pub fn is_throttled(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        match self.last_fired {
            Some(last) => now - last < chrono::Duration::hours(1),
            None => false,
        }
    }
}

/// A process-wide configuration key/value row, read-through with
/// default-seeded values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub label: String,
    pub category: String,
}

/// Mapping of battery/charging state to agent heartbeat interval.
///
/// Computed server-side as the default policy, pushed at check-in and via
/// `update_policy`, and honored by the agent's check-in pacer (C1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PacingPolicy {
    pub checkin_plugged_seconds: u64,
    pub checkin_battery_100_80_seconds: u64,
    pub checkin_battery_79_50_seconds: u64,
    pub checkin_battery_49_20_seconds: u64,
    pub checkin_battery_19_10_seconds: u64,
    pub checkin_battery_9_0_seconds: u64,
}

impl PacingPolicy {
    /// A pure function of battery percentage and charging flag to an
    /// interval in seconds. Never interpolates; an unknown percentage or a
    /// charging device always uses the plugged interval.
    pub fn interval_for(&self, battery_percent: Option<f64>, charging: bool) -> u64 {
        let percent = match (charging, battery_percent) {
            (true, _) | (_, None) => return self.checkin_plugged_seconds,
            (false, Some(p)) => p,
        };

        if percent >= 80.0 {
            self.checkin_battery_100_80_seconds
        } else if percent >= 50.0 {
            self.checkin_battery_79_50_seconds
        } else if percent >= 20.0 {
            self.checkin_battery_49_20_seconds
        } else if percent >= 10.0 {
            self.checkin_battery_19_10_seconds
        } else {
            self.checkin_battery_9_0_seconds
        }
    }

    /// Merge a partial policy update (from `update_policy`) over this one,
    /// keeping fields the update didn't specify.
    pub fn merge(&mut self, partial: &PartialPacingPolicy) {
        if let Some(v) = partial.checkin_plugged_seconds {
            self.checkin_plugged_seconds = v;
        }
        if let Some(v) = partial.checkin_battery_100_80_seconds {
            self.checkin_battery_100_80_seconds = v;
        }
        if let Some(v) = partial.checkin_battery_79_50_seconds {
            self.checkin_battery_79_50_seconds = v;
        }
        if let Some(v) = partial.checkin_battery_49_20_seconds {
            self.checkin_battery_49_20_seconds = v;
        }
        if let Some(v) = partial.checkin_battery_19_10_seconds {
            self.checkin_battery_19_10_seconds = v;
        }
        if let Some(v) = partial.checkin_battery_9_0_seconds {
            self.checkin_battery_9_0_seconds = v;
        }
    }
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            checkin_plugged_seconds: crate::defaults::default_pacing_plugged_seconds(),
            checkin_battery_100_80_seconds: crate::defaults::default_pacing_100_80_seconds(),
            checkin_battery_79_50_seconds: crate::defaults::default_pacing_79_50_seconds(),
            checkin_battery_49_20_seconds: crate::defaults::default_pacing_49_20_seconds(),
            checkin_battery_19_10_seconds: crate::defaults::default_pacing_19_10_seconds(),
            checkin_battery_9_0_seconds: crate::defaults::default_pacing_9_0_seconds(),
        }
    }
}

/// A partial pacing policy carried by an `update_policy` message; `None`
/// fields are left unchanged by [`PacingPolicy::merge`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialPacingPolicy {
    #[serde(default)]
    pub checkin_plugged_seconds: Option<u64>,
    #[serde(default)]
    pub checkin_battery_100_80_seconds: Option<u64>,
    #[serde(default)]
    pub checkin_battery_79_50_seconds: Option<u64>,
    #[serde(default)]
    pub checkin_battery_49_20_seconds: Option<u64>,
    #[serde(default)]
    pub checkin_battery_19_10_seconds: Option<u64>,
    #[serde(default)]
    pub checkin_battery_9_0_seconds: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacing_plugged_overrides_battery() {
        let policy = PacingPolicy::default();
        assert_eq!(policy.interval_for(Some(5.0), true), policy.checkin_plugged_seconds);
    }

    #[test]
    fn pacing_unknown_battery_uses_plugged() {
        let policy = PacingPolicy::default();
        assert_eq!(policy.interval_for(None, false), policy.checkin_plugged_seconds);
    }

    #[test]
    fn pacing_buckets_are_inclusive_of_lower_bound() {
        let policy = PacingPolicy::default();
        assert_eq!(
            policy.interval_for(Some(80.0), false),
            policy.checkin_battery_100_80_seconds
        );
        assert_eq!(
            policy.interval_for(Some(79.9), false),
            policy.checkin_battery_79_50_seconds
        );
    }

    #[test]
    fn alert_eq_operator_has_tolerance() {
        assert!(AlertOperator::Eq.evaluate(90.3, 90.0));
        assert!(!AlertOperator::Eq.evaluate(91.0, 90.0));
    }

    #[test]
    fn alert_rule_throttle_window_is_one_hour() {
        let now = chrono::Utc::now();
        let mut rule = AlertRule {
            id: 1,
            name: "cpu high".into(),
            metric: AlertMetric::Cpu,
            operator: AlertOperator::Gt,
            threshold: 90.0,
            duration_minutes: 0,
            target_type: TargetType::All,
            target_id: None,
            action: AlertAction::Log,
            active: true,
            last_fired: None,
        };
        assert!(!rule.is_throttled(now));
        rule.last_fired = Some(now - chrono::Duration::minutes(30));
        assert!(rule.is_throttled(now));
        rule.last_fired = Some(now - chrono::Duration::hours(2));
        assert!(!rule.is_throttled(now));
    }

    #[test]
    fn checkin_snapshot_excludes_now_trigger() {
        let base = Task {
            task_id: Uuid::new_v4(),
            name: "t".into(),
            script_type: ScriptType::Bash,
            script_body: "echo hi".into(),
            trigger_type: TriggerType::Now,
            scheduled_at: None,
            interval_seconds: None,
            cron_expression: None,
            event_trigger: None,
            target_type: TargetType::All,
            target_id: None,
            status: TaskStatus::Pending,
            cancelled: false,
            last_run: None,
        };
        assert!(!base.eligible_for_checkin_snapshot());

        let mut once = base.clone();
        once.trigger_type = TriggerType::Once;
        assert!(once.eligible_for_checkin_snapshot());
    }
}
