//! Agent channel client (C6)
//!
//! Owns the persistent duplex connection to the control plane: a check-in
//! HTTP round trip to obtain the channel URL and bootstrap task/policy
//! snapshot, then a WebSocket with an application-level keepalive, a
//! heartbeat sender paced by [`PacingPolicy`], and a receive loop that
//! dispatches every inbound [`ServerMessage`] variant. Any channel error
//! invalidates the cached endpoint selection and retries after a fixed
//! backoff; reconnection is unbounded.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use shared::api::{endpoints, headers, CheckinRequest, CheckinResponse, ServerMessage, TaskActiveProbeResponse};
use shared::model::{PacingPolicy, Task};
use shared::AgentMessage;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collectors;
use crate::database::AgentDatabase;
use crate::endpoint;
use crate::executor;
use crate::state::StateStore;
use crate::task_store::TaskStore;
use crate::telemetry;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no reachable endpoint selected")]
    NoEndpoint,
    #[error("check-in request failed: {0}")]
    Checkin(#[from] reqwest::Error),
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("keepalive timed out waiting for server activity")]
    KeepaliveTimeout,
}

/// Everything the channel client needs, shared by `Arc`/`Mutex` with the
/// rest of the agent's long-lived tasks (the local task runner in
/// particular, which schedules through `tasks` and reports through
/// `outbound_tx`).
pub struct ChannelContext {
    pub device_id: Uuid,
    pub agent_token: String,
    pub agent_version: Option<String>,
    pub candidate_endpoints: Vec<String>,
    pub endpoint_probe_timeout: Duration,
    pub endpoint_reprobe_age: Duration,
    pub channel_keepalive: Duration,
    pub channel_keepalive_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub executor_timeout_seconds: u64,
    pub state: Arc<Mutex<StateStore>>,
    pub tasks: Arc<Mutex<TaskStore>>,
    pub policy: Arc<Mutex<PacingPolicy>>,
    pub outbox: Arc<Mutex<AgentDatabase>>,
    pub http: reqwest::Client,
}

/// Drive the reconnect loop until `shutdown_rx` fires. `outbound_rx` carries
/// frames produced elsewhere in the agent (primarily `task_result`/
/// `task_output` from the local task runner) that should be forwarded over
/// the live socket when one exists.
pub async fn run(
    ctx: Arc<ChannelContext>,
    mut outbound_rx: mpsc::UnboundedReceiver<AgentMessage>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Channel client shutting down");
                return;
            }
            result = connect_and_serve(&ctx, &mut outbound_rx, shutdown_rx.resubscribe()) => {
                match result {
                    Ok(()) => debug!("Channel session ended cleanly"),
                    Err(e) => warn!(error = %e, "Channel session ended with error"),
                }
            }
        }

        {
            let mut state = ctx.state.lock().await;
            state.state.last_endpoint_probe = None;
            state.state.was_offline = true;
            let _ = state.save();
        }

        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = tokio::time::sleep(ctx.reconnect_backoff) => {}
        }
    }
}

async fn connect_and_serve(
    ctx: &Arc<ChannelContext>,
    outbound_rx: &mut mpsc::UnboundedReceiver<AgentMessage>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ChannelError> {
    let endpoint = {
        let mut state = ctx.state.lock().await;
        endpoint::select(
            &ctx.candidate_endpoints,
            &mut state,
            false,
            ctx.endpoint_probe_timeout,
            ctx.endpoint_reprobe_age,
        )
        .await
        .ok_or(ChannelError::NoEndpoint)?
    };

    let checkin = do_checkin(ctx, &endpoint).await?;
    {
        let mut tasks = ctx.tasks.lock().await;
        let _ = tasks.replace_all(checkin.scheduled_tasks);
    }
    {
        let mut policy = ctx.policy.lock().await;
        *policy = checkin.policy;
    }

    let mut request = checkin.ws_url.clone().into_client_request()?;
    request
        .headers_mut()
        .insert(headers::AGENT_TOKEN, ctx.agent_token.parse().expect("agent token is valid header value"));

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
    info!(endpoint, "Channel connected");

    let was_offline = {
        let mut state = ctx.state.lock().await;
        let was_offline = state.state.was_offline;
        state.state.was_offline = false;
        let _ = state.save();
        was_offline
    };
    if was_offline {
        notify_reconnected();
    }

    let (sink, mut stream) = ws_stream.split();
    let sink = Arc::new(Mutex::new(sink));

    flush_outbox(ctx, &sink).await;

    let heartbeat_handle = tokio::spawn(heartbeat_loop(ctx.clone(), sink.clone(), shutdown_rx.resubscribe()));
    let keepalive_handle = tokio::spawn(keepalive_loop(sink.clone(), ctx.channel_keepalive));

    let mut last_activity = tokio::time::Instant::now();
    let idle_ceiling = ctx.channel_keepalive + ctx.channel_keepalive_timeout;

    let result = loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break Ok(()),
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(msg) => forward_or_enqueue(ctx, &sink, msg).await,
                    None => break Ok(()),
                }
            }
            frame = tokio::time::timeout(idle_ceiling, stream.next()) => {
                match frame {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        last_activity = tokio::time::Instant::now();
                        handle_inbound(ctx, &sink, &text).await;
                    }
                    Ok(Some(Ok(Message::Pong(_)))) | Ok(Some(Ok(Message::Ping(_)))) => {
                        last_activity = tokio::time::Instant::now();
                    }
                    Ok(Some(Ok(Message::Close(_)))) => break Ok(()),
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => break Err(ChannelError::Handshake(e)),
                    Ok(None) => break Ok(()),
                    Err(_elapsed) => {
                        if last_activity.elapsed() >= idle_ceiling {
                            break Err(ChannelError::KeepaliveTimeout);
                        }
                    }
                }
            }
        }
    };

    heartbeat_handle.abort();
    keepalive_handle.abort();
    result
}

async fn do_checkin(ctx: &Arc<ChannelContext>, endpoint: &str) -> Result<CheckinResponse, ChannelError> {
    let snapshot = telemetry::snapshot(ctx.agent_version.clone());
    let request = CheckinRequest {
        device_id: ctx.device_id,
        hostname: snapshot.hostname,
        platform: std::env::consts::OS.to_string(),
        os_info: snapshot.os_info,
        ip_address: snapshot.ip_address,
        agent_version: ctx.agent_version.clone(),
        battery_level: snapshot.battery_percent,
        battery_charging: snapshot.battery_charging,
        cpu_percent: snapshot.cpu_percent,
        ram_percent: snapshot.ram_percent,
        disk_percent: snapshot.disk_percent,
        mac: None,
    };

    let url = format!("{}{}", base_url(endpoint), endpoints::CHECKIN);
    let response = ctx
        .http
        .post(url)
        .header(headers::AGENT_TOKEN, &ctx.agent_token)
        .json(&request)
        .send()
        .await?
        .error_for_status()?
        .json::<CheckinResponse>()
        .await?;
    Ok(response)
}

fn base_url(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

async fn heartbeat_loop(ctx: Arc<ChannelContext>, sink: Arc<Mutex<WsSink>>, mut shutdown_rx: broadcast::Receiver<()>) {
    loop {
        let interval_seconds = {
            let snapshot = telemetry::snapshot(ctx.agent_version.clone());
            let policy = ctx.policy.lock().await;
            let interval = policy.interval_for(snapshot.battery_percent, snapshot.battery_charging.unwrap_or(false));
            send_frame(&sink, &AgentMessage::Heartbeat(snapshot)).await;
            interval
        };

        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = tokio::time::sleep(Duration::from_secs(interval_seconds)) => {}
        }
    }
}

async fn keepalive_loop(sink: Arc<Mutex<WsSink>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let mut guard = sink.lock().await;
        if guard.send(Message::Ping(Vec::new().into())).await.is_err() {
            return;
        }
    }
}

async fn send_frame(sink: &Arc<Mutex<WsSink>>, message: &AgentMessage) -> bool {
    let Ok(json) = serde_json::to_string(message) else {
        return false;
    };
    let mut guard = sink.lock().await;
    guard.send(Message::Text(json.into())).await.is_ok()
}

/// Forward a locally-produced frame over the live socket; on failure, buffer
/// it in the durable outbox for the next successful connection.
async fn forward_or_enqueue(ctx: &Arc<ChannelContext>, sink: &Arc<Mutex<WsSink>>, message: AgentMessage) {
    if send_frame(sink, &message).await {
        return;
    }
    let mut outbox = ctx.outbox.lock().await;
    if let Err(e) = outbox.enqueue(&message) {
        warn!(error = %e, "Failed to buffer undeliverable channel frame");
    }
}

async fn flush_outbox(ctx: &Arc<ChannelContext>, sink: &Arc<Mutex<WsSink>>) {
    let pending = {
        let mut outbox = ctx.outbox.lock().await;
        outbox.get_pending(100)
    };
    let Ok(pending) = pending else { return };
    if pending.is_empty() {
        return;
    }

    let mut delivered_ids = Vec::new();
    for entry in &pending {
        if send_frame(sink, &entry.message).await {
            delivered_ids.push(entry.id);
        }
    }
    if !delivered_ids.is_empty() {
        let mut outbox = ctx.outbox.lock().await;
        let _ = outbox.mark_as_sent(&delivered_ids);
    }
}

fn notify_reconnected() {
    let _ = notify_rust::Notification::new()
        .summary("Reconnected")
        .body("Connection to the management server has been restored")
        .show();
}

async fn handle_inbound(ctx: &Arc<ChannelContext>, sink: &Arc<Mutex<WsSink>>, text: &str) {
    let message: ServerMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Failed to decode inbound channel frame, skipping");
            return;
        }
    };

    match message {
        ServerMessage::RunTask(payload) => {
            let ctx = ctx.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                let output_tx = forwarding_sender(ctx.clone(), sink);
                let result = executor::execute(
                    ctx.device_id,
                    payload.task_id,
                    payload.script_type,
                    &payload.script_body,
                    ctx.executor_timeout_seconds,
                    Some(output_tx),
                )
                .await;
                let mut tasks = ctx.tasks.lock().await;
                let _ = tasks.record_run(payload.task_id);
                drop(tasks);

                let message = AgentMessage::TaskResult(shared::api::TaskResultPayload {
                    task_id: result.task_id,
                    exit_code: result.exit_code,
                    stdout: result.stdout,
                    stderr: result.stderr,
                    started_at: result.started_at,
                });
                let mut outbox = ctx.outbox.lock().await;
                if let Err(e) = outbox.enqueue(&message) {
                    warn!(error = %e, "Failed to buffer task result");
                }
            });
        }
        ServerMessage::ScheduleTask(task) => {
            let mut tasks = ctx.tasks.lock().await;
            if let Err(e) = tasks.upsert(task) {
                warn!(error = %e, "Failed to persist scheduled task");
            }
        }
        ServerMessage::CancelTask(payload) => {
            let mut tasks = ctx.tasks.lock().await;
            if let Err(e) = tasks.mark_cancelled(payload.task_id) {
                warn!(error = %e, "Failed to mark task cancelled");
            }
        }
        ServerMessage::UpdatePolicy(partial) => {
            let mut policy = ctx.policy.lock().await;
            policy.merge(&partial);
        }
        ServerMessage::DiskScanRequest {} => {
            let payload = collectors::scan_disks();
            send_frame(sink, &AgentMessage::DiskScan(payload)).await;
        }
        ServerMessage::GetProcesses {} => {
            let payload = collectors::list_processes();
            send_frame(sink, &AgentMessage::ProcessList(payload)).await;
        }
        ServerMessage::KillProcess(payload) => {
            collectors::kill_process(payload.pid);
        }
        ServerMessage::QuickAction(payload) => {
            collectors::run_quick_action(payload.action);
        }
        ServerMessage::SoftwareScan {} => {
            let payload = collectors::report_software();
            send_frame(sink, &AgentMessage::SoftwareReport(payload)).await;
        }
        ServerMessage::HwScanRequest {} => {
            let payload = collectors::report_hardware();
            send_frame(sink, &AgentMessage::HwReport(payload)).await;
        }
        ServerMessage::Ping {} => {}
    }
}

/// An mpsc sender the executor can stream `task_output` frames into, backed
/// by the live socket for the duration of this connection.
fn forwarding_sender(ctx: Arc<ChannelContext>, sink: Arc<Mutex<WsSink>>) -> mpsc::UnboundedSender<AgentMessage> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            forward_or_enqueue(&ctx, &sink, message).await;
        }
    });
    tx
}

/// Five minutes (by default) before firing a non-`now` task, confirm
/// server-side it hasn't been cancelled. Failures (timeout, connection
/// refused) fail open: the task runs.
pub async fn probe_task_active(ctx: &ChannelContext, endpoint: &str, task: &Task) -> bool {
    let url = format!(
        "{}{}{}",
        base_url(endpoint),
        endpoints::TASK_ACTIVE_PROBE_PREFIX,
        task.task_id
    );
    match ctx
        .http
        .get(url)
        .header(headers::AGENT_TOKEN, &ctx.agent_token)
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(response) => match response.json::<TaskActiveProbeResponse>().await {
            Ok(body) => !body.cancelled,
            Err(_) => true,
        },
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_adds_scheme_when_missing() {
        assert_eq!(base_url("127.0.0.1:8080"), "http://127.0.0.1:8080");
        assert_eq!(base_url("https://rmm.example.com"), "https://rmm.example.com");
    }
}
