//! Check-in endpoint (C13)
//!
//! The HTTP bootstrap handshake: authenticate by shared secret, upsert the
//! device row, mark it online, and hand back everything the agent needs to
//! start operating before its WebSocket channel is even open — the channel
//! URL, the pacing policy, and a snapshot of every task it should schedule
//! locally while offline.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use shared::api::{endpoints, headers, CheckinRequest, CheckinResponse, TaskActiveProbeResponse};
use shared::model::{Device, DeviceStatus, PacingPolicy, TaskStatus};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{ApiError, AppState};

fn authenticate(headers: &HeaderMap, expected_token: &str) -> Result<(), ApiError> {
    use subtle::ConstantTimeEq;

    let provided = headers
        .get(headers::AGENT_TOKEN)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    let matches = provided.len() == expected_token.len()
        && bool::from(provided.as_bytes().ct_eq(expected_token.as_bytes()));
    if matches {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

fn ws_url_for(state: &AppState, request: &HeaderMap, device_id: Uuid) -> String {
    let host = request
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(&state.public_listen_address);
    format!("ws://{host}{}?device_id={device_id}", endpoints::AGENT_WS)
}

pub async fn handle_checkin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CheckinRequest>,
) -> Result<Json<CheckinResponse>, ApiError> {
    authenticate(&headers, &state.config.api_key)?;

    if request.device_id.is_nil() {
        return Err(ApiError::BadRequest("device_id is required".to_string()));
    }

    let ws_url = ws_url_for(&state, &headers, request.device_id);

    let mut database = state.database.lock().await;
    let existing = database.get_device(request.device_id).map_err(ApiError::Internal)?;

    let mut device = existing.unwrap_or_else(|| {
        Device::bootstrap(
            request.device_id,
            request.hostname.clone(),
            request.platform.clone(),
            request.os_info.clone(),
        )
    });
    device.hostname = request.hostname;
    device.platform = request.platform;
    device.os_info = request.os_info;
    device.ip_address = request.ip_address;
    device.agent_version = request.agent_version;
    device.battery_percent = request.battery_level;
    device.battery_charging = request.battery_charging;
    device.cpu_percent = Some(request.cpu_percent);
    device.ram_percent = Some(request.ram_percent);
    device.disk_percent = Some(request.disk_percent);
    device.mac_address = request.mac;
    device.status = DeviceStatus::Online;
    device.last_seen = Utc::now();

    database.upsert_device(&device).map_err(ApiError::Internal)?;

    let scheduled_tasks = database
        .list_checkin_snapshot_tasks()
        .map_err(ApiError::Internal)?;

    let policy_raw = database.get_setting("pacing_policy").map_err(ApiError::Internal)?;
    let policy: PacingPolicy = policy_raw
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    info!(device_id = %device.device_id, hostname = %device.hostname, "Device checked in");

    Ok(Json(CheckinResponse::ok(ws_url, scheduled_tasks, policy)))
}

pub async fn handle_task_active_probe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskActiveProbeResponse>, ApiError> {
    authenticate(&headers, &state.config.api_key)?;

    let mut database = state.database.lock().await;
    let task = database.get_task(task_id).map_err(ApiError::Internal)?;

    let cancelled = match task {
        Some(task) => task.cancelled || task.status == TaskStatus::Cancelled,
        None => {
            warn!(%task_id, "Task-active probe for unknown task, reporting not-cancelled");
            false
        }
    };

    Ok(Json(TaskActiveProbeResponse { cancelled }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticate_rejects_missing_header() {
        let headers = HeaderMap::new();
        assert!(authenticate(&headers, "secret").is_err());
    }

    #[test]
    fn authenticate_accepts_matching_token() {
        let mut headers = HeaderMap::new();
        headers.insert(headers::AGENT_TOKEN, "secret".parse().unwrap());
        assert!(authenticate(&headers, "secret").is_ok());
    }

    #[test]
    fn authenticate_rejects_mismatched_token() {
        let mut headers = HeaderMap::new();
        headers.insert(headers::AGENT_TOKEN, "wrong".parse().unwrap());
        assert!(authenticate(&headers, "secret").is_err());
    }
}
