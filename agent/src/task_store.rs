//! Local task cache (C3)
//!
//! The agent's durable copy of every task it has been told about: the
//! check-in bootstrap snapshot plus anything pushed live afterwards via
//! `schedule_task`/`cancel_task`. Persisted as `scheduled_tasks.json`, atomic
//! write (temp file + rename). If the file is corrupt it is renamed aside
//! rather than discarded, so a broken upgrade or disk fault doesn't silently
//! erase tasks the operator could otherwise have inspected.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use shared::model::{Task, TaskStatus};
use tracing::{debug, warn};
use uuid::Uuid;

const TASK_STORE_FILE: &str = "scheduled_tasks.json";

pub struct TaskStore {
    path: PathBuf,
    tasks: Vec<Task>,
}

impl TaskStore {
    pub fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let path = data_dir.as_ref().join(TASK_STORE_FILE);
        let tasks = if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(tasks) => tasks,
                    Err(e) => {
                        Self::quarantine_corrupt_file(&path, &e.to_string());
                        Vec::new()
                    }
                },
                Err(e) => {
                    warn!(error = %e, "Failed to read scheduled_tasks.json, starting empty");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Ok(Self { path, tasks })
    }

    fn quarantine_corrupt_file(path: &Path, error: &str) {
        let quarantine_path = path.with_extension("json.corrupt");
        warn!(
            error,
            quarantine_path = %quarantine_path.display(),
            "Corrupt scheduled_tasks.json, moving aside and starting empty"
        );
        if let Err(e) = std::fs::rename(path, &quarantine_path) {
            warn!(error = %e, "Failed to quarantine corrupt task store file");
        }
    }

    pub fn list(&self) -> &[Task] {
        &self.tasks
    }

    /// Replace the whole cache with a fresh check-in bootstrap snapshot.
    pub fn replace_all(&mut self, tasks: Vec<Task>) -> Result<()> {
        self.tasks = tasks;
        self.save()
    }

    /// Insert a new task, or replace it in place if `task_id` already exists
    /// (an interval/cron task re-pushed after an `update_policy`-style edit).
    pub fn upsert(&mut self, task: Task) -> Result<()> {
        match self.tasks.iter_mut().find(|t| t.task_id == task.task_id) {
            Some(existing) => *existing = task,
            None => self.tasks.push(task),
        }
        self.save()
    }

    pub fn remove(&mut self, task_id: Uuid) -> Result<()> {
        self.tasks.retain(|t| t.task_id != task_id);
        self.save()
    }

    pub fn mark_cancelled(&mut self, task_id: Uuid) -> Result<()> {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.task_id == task_id) {
            task.cancelled = true;
            task.status = TaskStatus::Cancelled;
            self.save()?;
        }
        Ok(())
    }

    pub fn record_run(&mut self, task_id: Uuid) -> Result<()> {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.task_id == task_id) {
            task.last_run = Some(Utc::now());
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating task store directory {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(&self.tasks).context("serializing task cache")?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming {} to {}", tmp_path.display(), self.path.display()))?;
        debug!(count = self.tasks.len(), "Task cache persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::model::{ScriptType, TargetType, TriggerType};
    use tempfile::TempDir;

    fn sample_task() -> Task {
        Task {
            task_id: Uuid::new_v4(),
            name: "disk cleanup".to_string(),
            script_type: ScriptType::Bash,
            script_body: "rm -rf /tmp/cache".to_string(),
            trigger_type: TriggerType::Interval,
            scheduled_at: None,
            interval_seconds: Some(3600),
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
    fn load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::load(dir.path()).unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn upsert_then_reload_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut store = TaskStore::load(dir.path()).unwrap();
        let task = sample_task();
        store.upsert(task.clone()).unwrap();

        let reloaded = TaskStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.list().len(), 1);
        assert_eq!(reloaded.list()[0].task_id, task.task_id);
    }

    #[test]
    fn upsert_replaces_existing_task_id() {
        let dir = TempDir::new().unwrap();
        let mut store = TaskStore::load(dir.path()).unwrap();
        let mut task = sample_task();
        store.upsert(task.clone()).unwrap();
        task.name = "renamed".to_string();
        store.upsert(task.clone()).unwrap();

        assert_eq!(store.list().len(), 1);
        assert_eq!(store.list()[0].name, "renamed");
    }

    #[test]
    fn mark_cancelled_sets_status() {
        let dir = TempDir::new().unwrap();
        let mut store = TaskStore::load(dir.path()).unwrap();
        let task = sample_task();
        store.upsert(task.clone()).unwrap();
        store.mark_cancelled(task.task_id).unwrap();

        assert!(store.list()[0].cancelled);
        assert_eq!(store.list()[0].status, TaskStatus::Cancelled);
    }

    #[test]
    fn remove_drops_task_from_cache() {
        let dir = TempDir::new().unwrap();
        let mut store = TaskStore::load(dir.path()).unwrap();
        let task = sample_task();
        store.upsert(task.clone()).unwrap();
        store.remove(task.task_id).unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn corrupt_file_is_quarantined_not_discarded_silently() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("scheduled_tasks.json"), "{not json").unwrap();
        let store = TaskStore::load(dir.path()).unwrap();
        assert!(store.list().is_empty());
        assert!(dir.path().join("scheduled_tasks.json.corrupt").exists());
    }
}
