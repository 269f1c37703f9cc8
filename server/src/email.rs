//! Email notification collaborator
//!
//! Outbound email is an external collaborator (SMTP relay, transactional
//! email API — whatever the deployment wires up) and stays out of scope
//! here per the system's non-goals. What lives in-tree is the seam: a
//! narrow trait every alerting loop (C11, C12, C14) calls through, plus a
//! logging implementation so the rest of the system runs standalone. A real
//! transport plugs in by implementing `EmailNotifier` and swapping it into
//! `AppState` at startup.

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum AlertNotification {
    TaskFailed {
        task_id: Uuid,
        device_id: Uuid,
        exit_code: i32,
    },
    DeviceOffline {
        device_id: Uuid,
        hostname: String,
    },
    AlertRuleTriggered {
        rule_name: String,
        device_hostname: String,
        threshold: f64,
        observed: f64,
    },
}

/// Send one alert notification. Implementations must never block the
/// calling loop for long; a failure is logged by the caller and otherwise
/// has no effect on the loop that raised it.
#[async_trait]
pub trait EmailNotifier: Send + Sync {
    async fn notify(&self, notification: AlertNotification) -> anyhow::Result<()>;
}

/// Default collaborator: logs at `warn` instead of sending mail. Suitable
/// for a deployment that hasn't configured a transport yet, and for tests.
pub struct LoggingEmailNotifier;

#[async_trait]
impl EmailNotifier for LoggingEmailNotifier {
    async fn notify(&self, notification: AlertNotification) -> anyhow::Result<()> {
        warn!(?notification, "Alert notification (no email transport configured)");
        Ok(())
    }
}

/// Invoke the notifier, logging and swallowing any failure — per the
/// failure semantics, an email collaborator error must never propagate
/// into the calling loop.
pub async fn notify_best_effort(notifier: &dyn EmailNotifier, notification: AlertNotification) {
    if let Err(e) = notifier.notify(notification).await {
        warn!(error = %e, "Email collaborator failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logging_notifier_never_fails() {
        let notifier = LoggingEmailNotifier;
        notify_best_effort(
            &notifier,
            AlertNotification::DeviceOffline {
                device_id: Uuid::new_v4(),
                hostname: "host1".to_string(),
            },
        )
        .await;
    }
}
