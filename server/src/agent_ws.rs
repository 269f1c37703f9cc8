//! Agent WebSocket handler (C14)
//!
//! Accepts the authenticated duplex channel for one agent: registers it in
//! the connection registry, demultiplexes every [`AgentMessage`] variant to
//! its persistence/fan-out side effect, and tears the registration down
//! again (marking the device offline) on close or error. Every per-message
//! handler is independent — a failure handling one frame is logged and the
//! loop continues, it never closes the socket.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use shared::api::{headers, AgentMessage};
use shared::model::{DeviceStatus, MetricSample, TaskResultStatus};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::email::{notify_best_effort, AlertNotification};

const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
pub struct AgentWsQuery {
    device_id: Uuid,
    #[serde(default)]
    token: Option<String>,
}

/// The channel's shared secret can arrive either as a header (the agent's
/// normal path, matching the check-in request) or as a query parameter,
/// since not every WebSocket client library can set custom headers on the
/// upgrade request.
fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    headers
        .get(headers::AGENT_TOKEN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query_token.map(str::to_string))
}

pub async fn handle_agent_ws(
    State(state): State<AppState>,
    Query(query): Query<AgentWsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    use subtle::ConstantTimeEq;

    let Some(token) = extract_token(&headers, query.token.as_deref()) else {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    };
    let expected = state.config.api_key.as_bytes();
    if token.len() != expected.len() || !bool::from(token.as_bytes().ct_eq(expected)) {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, query.device_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, device_id: Uuid) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<shared::api::ServerMessage>();
    state.registry.register_agent(device_id, tx);

    {
        let mut db = state.database.lock().await;
        if let Err(e) = db.set_device_status(device_id, DeviceStatus::Online) {
            warn!(%device_id, error = %e, "Failed to mark device online on channel open");
        }
    }
    info!(%device_id, "Agent channel opened");

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(message) => {
                        if send_json(&mut sink, &message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            frame = tokio::time::timeout(IDLE_TIMEOUT, stream.next()) => {
                match frame {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        handle_inbound(&state, device_id, &text).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        warn!(%device_id, error = %e, "Agent channel read error");
                        break;
                    }
                    Err(_elapsed) => {
                        if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    state.registry.deregister_agent(device_id);
    let mut db = state.database.lock().await;
    if let Err(e) = db.set_device_status(device_id, DeviceStatus::Offline) {
        warn!(%device_id, error = %e, "Failed to mark device offline on channel close");
    }
    info!(%device_id, "Agent channel closed");
}

async fn send_json(
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    message: &shared::api::ServerMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(message).unwrap_or_default();
    sink.send(Message::Text(json.into())).await
}

async fn handle_inbound(state: &AppState, device_id: Uuid, text: &str) {
    let message: AgentMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(%device_id, error = %e, "Failed to decode inbound agent frame, skipping");
            return;
        }
    };

    match message {
        AgentMessage::Heartbeat(snapshot) => {
            let mut db = state.database.lock().await;
            if let Ok(Some(mut device)) = db.get_device(device_id) {
                device.cpu_percent = Some(snapshot.cpu_percent);
                device.ram_percent = Some(snapshot.ram_percent);
                device.disk_percent = Some(snapshot.disk_percent);
                device.battery_percent = snapshot.battery_percent;
                device.battery_charging = snapshot.battery_charging;
                device.ip_address = snapshot.ip_address.clone();
                device.agent_version = snapshot.agent_version.clone();
                device.status = DeviceStatus::Online;
                device.last_seen = Utc::now();
                let _ = db.upsert_device(&device);
            }
            let _ = db.insert_metric_sample(&MetricSample {
                device_id,
                recorded_at: Utc::now(),
                cpu: snapshot.cpu_percent,
                ram: snapshot.ram_percent,
                disk: snapshot.disk_percent,
                battery: snapshot.battery_percent,
            });
            drop(db);
            state.registry.broadcast_to_dashboards(&serde_json::json!({
                "type": "device_update",
                "device_id": device_id,
            }));
        }
        AgentMessage::TaskResult(payload) => {
            let status = shared::model::TaskResult::status_for_exit_code(payload.exit_code);
            let result = shared::model::TaskResult {
                task_id: payload.task_id,
                device_id,
                exit_code: payload.exit_code,
                stdout: payload.stdout,
                stderr: payload.stderr,
                status,
                started_at: payload.started_at,
                completed_at: Utc::now(),
            };
            let mut db = state.database.lock().await;
            if let Err(e) = db.insert_task_result(&result) {
                warn!(%device_id, error = %e, "Failed to persist task result");
            }
            if let Err(e) = db.set_task_status(payload.task_id, shared::model::TaskStatus::Done) {
                debug!(%device_id, error = %e, "Failed to mark task done (may be a now-task with no row)");
            }
            drop(db);

            state.registry.broadcast_to_dashboards(&serde_json::json!({
                "type": "task_result",
                "task_id": result.task_id,
                "device_id": device_id,
                "status": result.status,
            }));

            if result.status == TaskResultStatus::Failed {
                notify_best_effort(
                    state.notifier.as_ref(),
                    AlertNotification::TaskFailed {
                        task_id: result.task_id,
                        device_id,
                        exit_code: result.exit_code,
                    },
                )
                .await;
            }
        }
        AgentMessage::TaskOutput(payload) => {
            state.registry.broadcast_to_dashboards(&serde_json::json!({
                "type": "task_output",
                "device_id": device_id,
                "task_id": payload.task_id,
                "output": payload.output,
                "progress": payload.progress,
            }));
        }
        AgentMessage::DiskScan(payload) => {
            debug!(%device_id, disks = payload.details.len(), "Disk scan received");
            state.registry.broadcast_to_dashboards(&serde_json::json!({
                "type": "disk_scan",
                "device_id": device_id,
                "details": payload.details,
            }));
        }
        AgentMessage::HwReport(payload) => {
            debug!(%device_id, cores = payload.cpu_cores, "Hardware report received");
            state.registry.broadcast_to_dashboards(&serde_json::json!({
                "type": "hw_report",
                "device_id": device_id,
                "report": payload,
            }));
        }
        AgentMessage::SoftwareReport(payload) => {
            debug!(%device_id, apps = payload.apps.len(), "Software inventory received");
        }
        AgentMessage::ProcessList(processes) => {
            state.registry.broadcast_to_dashboards(&serde_json::json!({
                "type": "process_list",
                "device_id": device_id,
                "processes": processes,
            }));
        }
        AgentMessage::Log(payload) => {
            info!(%device_id, level = ?payload.level, message = %payload.message, "Agent log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_token_prefers_header_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(headers::AGENT_TOKEN, "from-header".parse().unwrap());
        assert_eq!(extract_token(&headers, Some("from-query")).as_deref(), Some("from-header"));
    }

    #[test]
    fn extract_token_falls_back_to_query() {
        let headers = HeaderMap::new();
        assert_eq!(extract_token(&headers, Some("from-query")).as_deref(), Some("from-query"));
    }
}
