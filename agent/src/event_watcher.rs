//! Event watcher (C7)
//!
//! Samples the local network fingerprint on a fixed interval. A change
//! invalidates the cached endpoint selection (forcing the channel client to
//! reprobe on its next reconnect) and fires every `event`-triggered task
//! whose `event_trigger` is `network_change` and that isn't cancelled.

use std::sync::Arc;
use std::time::Duration;

use shared::model::{EventTrigger, TriggerType};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::info;
use uuid::Uuid;

use crate::channel_client::ChannelContext;
use crate::endpoint;
use crate::executor;
use crate::state::StateStore;
use crate::task_store::TaskStore;
use shared::AgentMessage;

pub async fn run(
    ctx: Arc<ChannelContext>,
    tasks: Arc<Mutex<TaskStore>>,
    state: Arc<Mutex<StateStore>>,
    interval: Duration,
    outbound_tx: mpsc::UnboundedSender<AgentMessage>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = ticker.tick() => {}
        }

        let current = endpoint::network_fingerprint();
        let changed = {
            let mut guard = state.lock().await;
            let changed = guard
                .state
                .last_network_fingerprint
                .as_deref()
                .is_some_and(|cached| cached != current);
            if changed || guard.state.last_network_fingerprint.is_none() {
                guard.state.last_network_fingerprint = Some(current.clone());
                let _ = guard.save();
            }
            changed
        };

        if !changed {
            continue;
        }

        info!("Network fingerprint changed, invalidating endpoint cache");
        {
            let mut guard = state.lock().await;
            guard.state.last_endpoint_probe = None;
            let _ = guard.save();
        }

        fire_network_change_tasks(&ctx, &tasks, outbound_tx.clone()).await;
    }
}

async fn fire_network_change_tasks(
    ctx: &Arc<ChannelContext>,
    tasks: &Arc<Mutex<TaskStore>>,
    outbound_tx: mpsc::UnboundedSender<AgentMessage>,
) {
    let due: Vec<(Uuid, shared::model::ScriptType, String)> = {
        let guard = tasks.lock().await;
        guard
            .list()
            .iter()
            .filter(|t| {
                t.trigger_type == TriggerType::Event
                    && t.event_trigger == Some(EventTrigger::NetworkChange)
                    && !t.cancelled
            })
            .map(|t| (t.task_id, t.script_type, t.script_body.clone()))
            .collect()
    };

    for (task_id, script_type, script_body) in due {
        let ctx = ctx.clone();
        let tasks = tasks.clone();
        let outbound_tx = outbound_tx.clone();
        tokio::spawn(async move {
            let result = executor::execute(
                ctx.device_id,
                task_id,
                script_type,
                &script_body,
                ctx.executor_timeout_seconds,
                Some(outbound_tx.clone()),
            )
            .await;
            {
                let mut guard = tasks.lock().await;
                let _ = guard.record_run(task_id);
            }
            let _ = outbound_tx.send(AgentMessage::TaskResult(shared::api::TaskResultPayload {
                task_id: result.task_id,
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
                started_at: result.started_at,
            }));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_fingerprint_is_deterministic_within_one_call() {
        let a = endpoint::network_fingerprint();
        let b = endpoint::network_fingerprint();
        assert_eq!(a, b);
    }
}
