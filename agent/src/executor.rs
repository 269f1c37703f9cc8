//! Streaming task executor (C5)
//!
//! Spawns a task's `script_body` under the shell its `script_type` calls for,
//! forwards stdout line-by-line as `task_output` frames while the process
//! runs, and returns one `TaskResult` once it exits or is killed for running
//! past its wall-clock budget. Channel-send failures while streaming are
//! swallowed: the result returned to the caller is the durable record, the
//! streamed lines are a best-effort progress indicator only.

use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use shared::api::{AgentMessage, TaskOutputPayload};
use shared::model::{
    ScriptType, TaskResult, EXIT_CODE_TIMEOUT_OR_SPAWN_FAILURE, TASK_RESULT_STDERR_CAP,
    TASK_RESULT_STDOUT_CAP,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};
use uuid::Uuid;

/// Accumulates output, keeping only the most recent `cap` bytes (a tail, not
/// a head) once the budget is exceeded.
struct TailBuffer {
    cap: usize,
    buf: String,
}

impl TailBuffer {
    fn new(cap: usize) -> Self {
        Self { cap, buf: String::new() }
    }

    fn push_line(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
        if self.buf.len() > self.cap {
            let excess = self.buf.len() - self.cap;
            let mut boundary = excess;
            while boundary < self.buf.len() && !self.buf.is_char_boundary(boundary) {
                boundary += 1;
            }
            self.buf.drain(..boundary);
        }
    }

    fn push_str(&mut self, extra: &str) {
        self.buf.push_str(extra);
    }

    fn into_string(self) -> String {
        self.buf
    }
}

fn build_command(script_type: ScriptType, script_body: &str) -> Command {
    let mut cmd = match script_type {
        ScriptType::Powershell | ScriptType::Unknown => {
            let mut c = Command::new("powershell");
            c.args(["-NonInteractive", "-NoProfile", "-Command", script_body]);
            c
        }
        ScriptType::Cmd => {
            let mut c = Command::new("cmd");
            c.args(["/c", script_body]);
            c
        }
        ScriptType::Python => {
            let mut c = Command::new("python");
            c.args(["-c", script_body]);
            c
        }
        ScriptType::Bash => {
            let mut c = Command::new("bash");
            c.args(["-c", script_body]);
            c
        }
    };
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd
}

/// Run `task_id`'s script to completion (or timeout) and return the
/// resulting [`TaskResult`]. `output_sink`, if present, receives a
/// `task_output` frame per stdout line plus a final `progress=100` frame;
/// send failures are ignored.
pub async fn execute(
    device_id: Uuid,
    task_id: Uuid,
    script_type: ScriptType,
    script_body: &str,
    timeout_seconds: u64,
    output_sink: Option<UnboundedSender<AgentMessage>>,
) -> TaskResult {
    let started_at = Utc::now();
    let (exit_code, stdout, stderr) =
        run_with_timeout(task_id, script_type, script_body, timeout_seconds, output_sink.clone()).await;

    if let Some(sink) = &output_sink {
        let _ = sink.send(AgentMessage::TaskOutput(TaskOutputPayload {
            task_id,
            output: String::new(),
            progress: 100,
        }));
    }

    let completed_at = Utc::now();
    let status = TaskResult::status_for_exit_code(exit_code);
    let result = TaskResult {
        task_id,
        device_id,
        exit_code,
        stdout,
        stderr,
        status,
        started_at,
        completed_at,
    };

    notify_completion(&result);
    result
}

async fn run_with_timeout(
    task_id: Uuid,
    script_type: ScriptType,
    script_body: &str,
    timeout_seconds: u64,
    output_sink: Option<UnboundedSender<AgentMessage>>,
) -> (i32, String, String) {
    let mut cmd = build_command(script_type, script_body);
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return (
                EXIT_CODE_TIMEOUT_OR_SPAWN_FAILURE,
                String::new(),
                format!("failed to spawn process: {e}"),
            )
        }
    };

    let stdout = child.stdout.take().expect("stdout piped at spawn");
    let stderr = child.stderr.take().expect("stderr piped at spawn");

    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let mut tail = TailBuffer::new(TASK_RESULT_STDOUT_CAP);
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(sink) = &output_sink {
                        let _ = sink.send(AgentMessage::TaskOutput(TaskOutputPayload {
                            task_id,
                            output: line.clone(),
                            progress: 50,
                        }));
                    }
                    tail.push_line(&line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, %task_id, "Error reading task stdout");
                    break;
                }
            }
        }
        tail.into_string()
    });

    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut tail = TailBuffer::new(TASK_RESULT_STDERR_CAP);
        while let Ok(Some(line)) = lines.next_line().await {
            tail.push_line(&line);
        }
        tail.into_string()
    });

    match tokio::time::timeout(Duration::from_secs(timeout_seconds), child.wait()).await {
        Ok(Ok(status)) => {
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            (status.code().unwrap_or(EXIT_CODE_TIMEOUT_OR_SPAWN_FAILURE), stdout, stderr)
        }
        Ok(Err(e)) => {
            let stdout = stdout_task.await.unwrap_or_default();
            let mut stderr = stderr_task.await.unwrap_or_default();
            stderr.push_str(&format!("\nfailed waiting on process: {e}"));
            (EXIT_CODE_TIMEOUT_OR_SPAWN_FAILURE, stdout, stderr)
        }
        Err(_elapsed) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            let stdout = stdout_task.await.unwrap_or_default();
            let mut tail = TailBuffer::new(TASK_RESULT_STDERR_CAP);
            tail.push_str(&stderr_task.await.unwrap_or_default());
            tail.push_str(&format!(
                "\n[killed: exceeded {timeout_seconds}s wall-clock timeout]"
            ));
            (EXIT_CODE_TIMEOUT_OR_SPAWN_FAILURE, stdout, tail.into_string())
        }
    }
}

fn notify_completion(result: &TaskResult) {
    let (summary, body) = if result.exit_code == 0 {
        ("Task completed", format!("Task {} finished successfully", result.task_id))
    } else {
        (
            "Task failed",
            format!("Task {} exited with code {}", result.task_id, result.exit_code),
        )
    };
    match notify_rust::Notification::new().summary(summary).body(&body).show() {
        Ok(_) => info!(task_id = %result.task_id, exit_code = result.exit_code, "Task notification shown"),
        Err(e) => warn!(error = %e, task_id = %result.task_id, "Failed to show task notification"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::model::ScriptType;

    fn device_id() -> Uuid {
        Uuid::new_v4()
    }

    #[tokio::test]
    async fn bash_success_exit_code_zero() {
        let task_id = Uuid::new_v4();
        let result = execute(
            device_id(),
            task_id,
            ScriptType::Bash,
            "echo hello",
            5,
            None,
        )
        .await;
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn bash_nonzero_exit_code_is_captured() {
        let task_id = Uuid::new_v4();
        let result = execute(device_id(), task_id, ScriptType::Bash, "exit 7", 5, None).await;
        assert_eq!(result.exit_code, 7);
    }

    #[tokio::test]
    async fn timeout_kills_process_and_reports_sentinel_exit_code() {
        let task_id = Uuid::new_v4();
        let result = execute(
            device_id(),
            task_id,
            ScriptType::Bash,
            "sleep 10",
            1,
            None,
        )
        .await;
        assert_eq!(result.exit_code, EXIT_CODE_TIMEOUT_OR_SPAWN_FAILURE);
        assert!(result.stderr.contains("timeout"));
    }

    #[tokio::test]
    async fn stdout_lines_are_forwarded_to_sink() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let task_id = Uuid::new_v4();
        let result = execute(
            device_id(),
            task_id,
            ScriptType::Bash,
            "echo one; echo two",
            5,
            Some(tx),
        )
        .await;
        assert_eq!(result.exit_code, 0);

        let mut seen_lines = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let AgentMessage::TaskOutput(payload) = msg {
                seen_lines.push(payload.output);
            }
        }
        assert!(seen_lines.iter().any(|l| l == "one"));
        assert!(seen_lines.iter().any(|l| l == "two"));
    }

    #[test]
    fn tail_buffer_drops_oldest_bytes_once_over_cap() {
        let mut tail = TailBuffer::new(10);
        tail.push_line("0123456789abcdef");
        assert!(tail.into_string().len() <= 10 + 1);
    }
}
