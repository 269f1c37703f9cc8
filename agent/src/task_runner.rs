//! Local task runner (C4 + C5 driver)
//!
//! Ticks the trigger evaluator (C4) against every task in the local cache,
//! runs whatever is due through the streaming executor (C5), and reports the
//! result back over the channel client's outbound queue (delivered live if
//! connected, buffered in the outbox otherwise). Event-triggered tasks are
//! excluded here; the event watcher (C7) fires those directly when the
//! watched condition occurs, not on this tick.
//!
//! Anything other than a `now` trigger gets a pre-run probe against the
//! control plane first, per the fail-open policy: a probe failure (offline,
//! timeout) means the task runs anyway, since availability beats
//! consistency for a device that may be disconnected for good reason.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shared::model::{Task, TriggerType};
use shared::AgentMessage;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::channel_client::{self, ChannelContext};
use crate::executor;
use crate::trigger;

const TICK_INTERVAL: Duration = Duration::from_secs(15);

pub async fn run(
    ctx: Arc<ChannelContext>,
    outbound_tx: mpsc::UnboundedSender<AgentMessage>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = ticker.tick() => {}
        }

        tick(&ctx, &outbound_tx).await;
    }
}

async fn tick(ctx: &Arc<ChannelContext>, outbound_tx: &mpsc::UnboundedSender<AgentMessage>) {
    let now = Utc::now();
    let due: Vec<Task> = {
        let guard = ctx.tasks.lock().await;
        guard
            .list()
            .iter()
            .filter(|t| t.trigger_type != TriggerType::Event && trigger::is_due(t, now))
            .cloned()
            .collect()
    };

    if due.is_empty() {
        return;
    }

    let endpoint = {
        let state = ctx.state.lock().await;
        state.state.active_endpoint.clone()
    };

    for task in due {
        let should_run = match (task.trigger_type, &endpoint) {
            (TriggerType::Now, _) => true,
            (_, Some(endpoint)) => channel_client::probe_task_active(ctx, endpoint, &task).await,
            (_, None) => true,
        };

        if !should_run {
            info!(task_id = %task.task_id, "Task cancelled server-side, skipping local run");
            let mut tasks = ctx.tasks.lock().await;
            let _ = tasks.mark_cancelled(task.task_id);
            continue;
        }

        spawn_run(ctx.clone(), task, outbound_tx.clone());
    }
}

fn spawn_run(ctx: Arc<ChannelContext>, task: Task, outbound_tx: mpsc::UnboundedSender<AgentMessage>) {
    tokio::spawn(async move {
        let result = executor::execute(
            ctx.device_id,
            task.task_id,
            task.script_type,
            &task.script_body,
            ctx.executor_timeout_seconds,
            Some(outbound_tx.clone()),
        )
        .await;

        {
            let mut tasks = ctx.tasks.lock().await;
            match task.trigger_type {
                // A one-shot task that fires again would re-run forever
                // (trigger::is_due has no way to tell "already ran" for
                // `now`/`once` short of removing it from the cache).
                TriggerType::Now | TriggerType::Once => {
                    let _ = tasks.remove(task.task_id);
                }
                _ => {
                    let _ = tasks.record_run(task.task_id);
                }
            }
        }

        let message = AgentMessage::TaskResult(shared::api::TaskResultPayload {
            task_id: result.task_id,
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            started_at: result.started_at,
        });
        if outbound_tx.send(message).is_err() {
            warn!(task_id = %task.task_id, "Outbound queue closed, task result dropped");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::AgentDatabase;
    use crate::state::StateStore;
    use crate::task_store::TaskStore;
    use shared::model::{PacingPolicy, ScriptType, TargetType, TaskStatus};
    use tempfile::TempDir;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    fn test_ctx(dir: &TempDir) -> Arc<ChannelContext> {
        let state = StateStore::load(dir.path()).unwrap();
        let tasks = TaskStore::load(dir.path()).unwrap();
        let mut outbox = AgentDatabase::new(dir.path(), 5).unwrap();
        outbox.initialize().unwrap();

        Arc::new(ChannelContext {
            device_id: Uuid::new_v4(),
            agent_token: "token".to_string(),
            agent_version: None,
            candidate_endpoints: Vec::new(),
            endpoint_probe_timeout: Duration::from_millis(50),
            endpoint_reprobe_age: Duration::from_secs(60),
            channel_keepalive: Duration::from_secs(30),
            channel_keepalive_timeout: Duration::from_secs(10),
            reconnect_backoff: Duration::from_secs(5),
            executor_timeout_seconds: 5,
            state: Arc::new(Mutex::new(state)),
            tasks: Arc::new(Mutex::new(tasks)),
            policy: Arc::new(Mutex::new(PacingPolicy::default())),
            outbox: Arc::new(Mutex::new(outbox)),
            http: reqwest::Client::new(),
        })
    }

    fn now_task() -> Task {
        Task {
            task_id: Uuid::new_v4(),
            name: "echo".to_string(),
            script_type: ScriptType::Bash,
            script_body: "echo hi".to_string(),
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
        }
    }

    #[tokio::test]
    async fn tick_runs_due_now_task_and_removes_it() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let task = now_task();
        {
            let mut guard = ctx.tasks.lock().await;
            guard.upsert(task.clone()).unwrap();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        tick(&ctx, &tx).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(ctx.tasks.lock().await.list().len(), 0);
        let received = rx.try_recv().expect("task result should have been sent");
        match received {
            AgentMessage::TaskResult(payload) => assert_eq!(payload.task_id, task.task_id),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn tick_skips_tasks_not_yet_due() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let mut task = now_task();
        task.trigger_type = TriggerType::Interval;
        task.interval_seconds = Some(3600);
        task.last_run = Some(Utc::now());
        {
            let mut guard = ctx.tasks.lock().await;
            guard.upsert(task.clone()).unwrap();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        tick(&ctx, &tx).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(ctx.tasks.lock().await.list().len(), 1);
        assert!(rx.try_recv().is_err());
    }
}
