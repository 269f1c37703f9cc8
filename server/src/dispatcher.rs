//! Task dispatcher (C9)
//!
//! Every 30 s, scans pending/not-cancelled tasks, evaluates due-ness with
//! the same trigger rules C4 uses on the agent (server-side evaluation only
//! matters for `now`/`once` tasks — recurring ones are shipped to agents at
//! check-in and evaluated there), flips due tasks to `dispatched`, and fans
//! the `run_task` envelope out to the resolved target set. The status flip
//! is the commit point: a one-shot task is never sent twice regardless of
//! how many targets fail to receive it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shared::api::{RunTaskPayload, ServerMessage};
use shared::model::{Task, TargetType, TriggerType};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection_registry::ConnectionRegistry;
use crate::database::ServerDatabase;

/// Mirrors the agent's C4 `is_due` predicate, restricted to the trigger
/// kinds the dispatcher is responsible for firing server-side: `now` fires
/// immediately (it is only ever delivered live, never through the check-in
/// snapshot), `once` fires once `scheduled_at` has passed. Interval/cron/
/// event tasks are left to the agent; the dispatcher never dispatches them.
fn is_due(task: &Task, now: chrono::DateTime<Utc>) -> bool {
    match task.trigger_type {
        TriggerType::Now => true,
        TriggerType::Once => task.scheduled_at.is_some_and(|at| now >= at),
        TriggerType::Interval | TriggerType::Cron | TriggerType::Event => false,
    }
}

fn resolve_targets(database: &mut ServerDatabase, registry: &ConnectionRegistry, task: &Task) -> Vec<Uuid> {
    match task.target_type {
        TargetType::Device => {
            let Some(target_id) = &task.target_id else {
                return Vec::new();
            };
            let Ok(device_id) = target_id.parse::<Uuid>() else {
                warn!(target_id, "Task target_id is not a valid device uuid");
                return Vec::new();
            };
            if registry.is_agent_connected(device_id) {
                vec![device_id]
            } else {
                Vec::new()
            }
        }
        TargetType::Group => {
            let Some(group_name) = &task.target_id else {
                return Vec::new();
            };
            database
                .list_online_devices_in_group(group_name)
                .unwrap_or_default()
                .into_iter()
                .map(|d| d.device_id)
                .filter(|id| registry.is_agent_connected(*id))
                .collect()
        }
        TargetType::All => registry.agent_ids(),
    }
}

async fn tick(database: &Arc<Mutex<ServerDatabase>>, registry: &ConnectionRegistry) {
    let pending = {
        let mut db = database.lock().await;
        match db.list_schedulable_tasks() {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Failed to list schedulable tasks");
                return;
            }
        }
    };

    let now = Utc::now();
    for task in pending {
        if !is_due(&task, now) {
            continue;
        }

        let mut db = database.lock().await;
        if let Err(e) = db.set_task_status(task.task_id, shared::model::TaskStatus::Dispatched) {
            warn!(task_id = %task.task_id, error = %e, "Failed to flip task to dispatched, skipping this tick");
            continue;
        }
        let _ = db.mark_task_last_run(task.task_id, now);
        drop(db);

        let targets = resolve_targets(&mut *database.lock().await, registry, &task);
        let envelope = ServerMessage::RunTask(RunTaskPayload {
            task_id: task.task_id,
            name: task.name.clone(),
            script_type: task.script_type,
            script_body: task.script_body.clone(),
        });

        let mut delivered = 0usize;
        for device_id in &targets {
            if registry.send_to_agent(*device_id, envelope.clone()) {
                delivered += 1;
            }
        }
        info!(
            task_id = %task.task_id,
            targets = targets.len(),
            delivered,
            "Dispatched task"
        );
    }
}

pub async fn run(
    database: Arc<Mutex<ServerDatabase>>,
    registry: ConnectionRegistry,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Task dispatcher shutting down");
                return;
            }
            _ = ticker.tick() => {
                tick(&database, &registry).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::model::{ScriptType, TaskStatus};

    fn base_task(trigger_type: TriggerType) -> Task {
        Task {
            task_id: Uuid::new_v4(),
            name: "t".into(),
            script_type: ScriptType::Bash,
            script_body: "echo hi".into(),
            trigger_type,
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

    #[test]
    fn now_tasks_are_always_due() {
        assert!(is_due(&base_task(TriggerType::Now), Utc::now()));
    }

    #[test]
    fn once_tasks_are_due_only_after_scheduled_at() {
        let mut task = base_task(TriggerType::Once);
        let now = Utc::now();
        task.scheduled_at = Some(now + chrono::Duration::minutes(5));
        assert!(!is_due(&task, now));
        task.scheduled_at = Some(now - chrono::Duration::minutes(1));
        assert!(is_due(&task, now));
    }

    #[test]
    fn recurring_tasks_are_never_server_side_due() {
        assert!(!is_due(&base_task(TriggerType::Interval), Utc::now()));
        assert!(!is_due(&base_task(TriggerType::Cron), Utc::now()));
        assert!(!is_due(&base_task(TriggerType::Event), Utc::now()));
    }

    #[tokio::test]
    async fn resolve_targets_for_all_returns_registered_agents() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut database = ServerDatabase::in_dir(dir.path(), 5).unwrap();
        database.initialize().unwrap();
        let registry = ConnectionRegistry::new();
        let device_id = Uuid::new_v4();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        registry.register_agent(device_id, tx);

        let task = base_task(TriggerType::Now);
        let targets = resolve_targets(&mut database, &registry, &task);
        assert_eq!(targets, vec![device_id]);
    }
}
