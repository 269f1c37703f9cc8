//! Wire types for the agent/server duplex channel and check-in handshake
//!
//! Every channel frame is framed JSON carrying a `type` discriminant and an
//! optional `data` object. [`ServerMessage`] is the closed tagged enum the
//! server sends to an agent; [`AgentMessage`] is the one the agent sends back.
//! Both use `#[serde(tag = "type", content = "data", rename_all = "snake_case")]`
//! so an unrecognized `type` fails to deserialize into a known variant rather
//! than silently matching the wrong one — callers are expected to catch and
//! log the deserialization error per frame, never let it tear down the
//! connection.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{PacingPolicy, PartialPacingPolicy, Task};

/// A telemetry snapshot carried by `heartbeat` and by the check-in request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub hostname: String,
    pub ip_address: Option<String>,
    pub os_info: String,
    pub battery_percent: Option<f64>,
    pub battery_charging: Option<bool>,
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub disk_percent: f64,
    pub agent_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTaskPayload {
    pub task_id: Uuid,
    pub name: String,
    pub script_type: crate::model::ScriptType,
    pub script_body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelTaskPayload {
    pub task_id: Uuid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuickAction {
    Shutdown,
    Restart,
    Lock,
    Sleep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickActionPayload {
    pub action: QuickAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillProcessPayload {
    pub pid: u32,
    #[serde(default)]
    pub name: Option<String>,
}

/// Messages the server sends down the channel to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    RunTask(RunTaskPayload),
    ScheduleTask(Task),
    CancelTask(CancelTaskPayload),
    UpdatePolicy(PartialPacingPolicy),
    DiskScanRequest {},
    GetProcesses {},
    KillProcess(KillProcessPayload),
    QuickAction(QuickActionPayload),
    SoftwareScan {},
    HwScanRequest {},
    Ping {},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultPayload {
    pub task_id: Uuid,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutputPayload {
    pub task_id: Uuid,
    pub output: String,
    pub progress: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskDetail {
    pub mount_point: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskScanPayload {
    pub details: Vec<DiskDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HwReportPayload {
    pub cpu_model: String,
    pub cpu_cores: u32,
    pub total_ram_mb: u64,
    pub total_disk_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftwareEntry {
    pub name: String,
    pub version: Option<String>,
    pub publisher: Option<String>,
    pub install_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftwareReportPayload {
    pub apps: Vec<SoftwareEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub cpu: f32,
    pub mem_mb: f64,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPayload {
    pub level: LogLevel,
    pub message: String,
}

/// Messages an agent sends up the channel to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AgentMessage {
    Heartbeat(TelemetrySnapshot),
    TaskResult(TaskResultPayload),
    TaskOutput(TaskOutputPayload),
    DiskScan(DiskScanPayload),
    HwReport(HwReportPayload),
    SoftwareReport(SoftwareReportPayload),
    ProcessList(Vec<ProcessEntry>),
    Log(LogPayload),
}

/// Body of the check-in `POST`, authenticated by the `X-Agent-Token` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckinRequest {
    pub device_id: Uuid,
    pub hostname: String,
    pub platform: String,
    pub os_info: String,
    pub ip_address: Option<String>,
    pub agent_version: Option<String>,
    pub battery_level: Option<f64>,
    pub battery_charging: Option<bool>,
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub disk_percent: f64,
    #[serde(default)]
    pub mac: Option<String>,
}

/// Response to a successful check-in: bootstrap material for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckinResponse {
    pub status: String,
    pub ws_url: String,
    pub scheduled_tasks: Vec<Task>,
    pub policy: PacingPolicy,
}

impl CheckinResponse {
    pub fn ok(ws_url: String, scheduled_tasks: Vec<Task>, policy: PacingPolicy) -> Self {
        Self {
            status: "ok".to_string(),
            ws_url,
            scheduled_tasks,
            policy,
        }
    }
}

/// Response to the pre-run task-active probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskActiveProbeResponse {
    pub cancelled: bool,
}

/// HTTP headers used for channel and check-in authentication.
pub mod headers {
    pub const AGENT_TOKEN: &str = "X-Agent-Token";
}

/// API endpoint paths.
pub mod endpoints {
    pub const CHECKIN: &str = "/api/v1/checkin";
    /// Format with the task UUID substituted for `{task_id}`.
    pub const TASK_ACTIVE_PROBE_PREFIX: &str = "/api/v1/tasks/";
    pub const AGENT_WS: &str = "/api/v1/agent/ws";
    pub const DASHBOARD_WS: &str = "/api/v1/dashboard/ws";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_message_wire_shape_matches_type_content_envelope() {
        let msg = ServerMessage::CancelTask(CancelTaskPayload {
            task_id: Uuid::nil(),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "cancel_task");
        assert_eq!(json["data"]["task_id"], Uuid::nil().to_string());
    }

    #[test]
    fn unknown_message_type_fails_to_deserialize_without_panicking() {
        let raw = r#"{"type":"not_a_real_type","data":{}}"#;
        let result: Result<ServerMessage, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }

    #[test]
    fn ping_round_trips_with_empty_data() {
        let msg = ServerMessage::Ping {};
        let json = serde_json::to_string(&msg).unwrap();
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        matches!(back, ServerMessage::Ping {});
    }
}
