//! Metric recorder + alert rule engine (C12)
//!
//! Metric recording happens inline wherever a heartbeat is handled (C14);
//! this module owns only the periodic side: every 120 s (after a 90 s
//! startup warm-up), each active, non-throttled rule is evaluated against
//! the latest telemetry of every currently-registered, online device in
//! its scope.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shared::model::{AlertRule, Device, DeviceStatus, TargetType};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::connection_registry::ConnectionRegistry;
use crate::database::ServerDatabase;
use crate::email::{notify_best_effort, AlertNotification, EmailNotifier};

fn observed_value(device: &Device, rule: &AlertRule) -> Option<f64> {
    match rule.metric {
        shared::model::AlertMetric::Cpu => device.cpu_percent,
        shared::model::AlertMetric::Ram => device.ram_percent,
        shared::model::AlertMetric::Disk => device.disk_percent,
        shared::model::AlertMetric::Battery => device.battery_percent,
    }
}

fn devices_in_scope(all_online: &[Device], registry: &ConnectionRegistry, rule: &AlertRule) -> Vec<Device> {
    all_online
        .iter()
        .filter(|d| registry.is_agent_connected(d.device_id))
        .filter(|d| match rule.target_type {
            TargetType::All => true,
            TargetType::Device => rule.target_id.as_deref() == Some(d.device_id.to_string().as_str()),
            TargetType::Group => rule.target_id.is_some() && rule.target_id == d.group_name,
        })
        .cloned()
        .collect()
}

async fn evaluate_rule(
    database: &Arc<Mutex<ServerDatabase>>,
    registry: &ConnectionRegistry,
    notifier: &dyn EmailNotifier,
    rule: &AlertRule,
    all_online: &[Device],
) {
    let now = Utc::now();
    if rule.is_throttled(now) {
        return;
    }

    for device in devices_in_scope(all_online, registry, rule) {
        let Some(observed) = observed_value(&device, rule) else {
            continue;
        };
        if !rule.operator.evaluate(observed, rule.threshold) {
            continue;
        }

        let mut db = database.lock().await;
        if let Err(e) = db.mark_alert_rule_fired(rule.id, now) {
            warn!(rule_id = rule.id, error = %e, "Failed to record alert rule fire");
        }
        drop(db);

        tracing::warn!(
            rule = %rule.name,
            device_id = %device.device_id,
            hostname = %device.hostname,
            threshold = rule.threshold,
            observed,
            "Alert rule triggered"
        );

        if rule.action == shared::model::AlertAction::Email {
            notify_best_effort(
                notifier,
                AlertNotification::AlertRuleTriggered {
                    rule_name: rule.name.clone(),
                    device_hostname: device.hostname.clone(),
                    threshold: rule.threshold,
                    observed,
                },
            )
            .await;
        }

        // A rule fires at most once per tick per device set; once it has
        // fired for any device in scope the throttle window covers the rest.
        break;
    }
}

async fn tick(database: &Arc<Mutex<ServerDatabase>>, registry: &ConnectionRegistry, notifier: &dyn EmailNotifier) {
    let (rules, all_online) = {
        let mut db = database.lock().await;
        let rules = match db.list_active_alert_rules() {
            Ok(rules) => rules,
            Err(e) => {
                warn!(error = %e, "Failed to list active alert rules");
                return;
            }
        };
        let online = db.list_online_devices().unwrap_or_default();
        (rules, online)
    };

    for rule in &rules {
        evaluate_rule(database, registry, notifier, rule, &all_online).await;
    }
}

pub async fn run(
    database: Arc<Mutex<ServerDatabase>>,
    registry: ConnectionRegistry,
    notifier: Arc<dyn EmailNotifier>,
    tick_interval: Duration,
    warmup: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::select! {
        _ = shutdown_rx.recv() => return,
        _ = tokio::time::sleep(warmup) => {}
    }

    let mut ticker = tokio::time::interval(tick_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Alert rule engine shutting down");
                return;
            }
            _ = ticker.tick() => {
                tick(&database, &registry, notifier.as_ref()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::LoggingEmailNotifier;
    use shared::model::{AlertAction, AlertMetric, AlertOperator};
    use uuid::Uuid;

    fn sample_rule() -> AlertRule {
        AlertRule {
            id: 0,
            name: "cpu high".into(),
            metric: AlertMetric::Cpu,
            operator: AlertOperator::Gt,
            threshold: 90.0,
            duration_minutes: 0,
            target_type: TargetType::All,
            target_id: None,
            action: AlertAction::Log,
            active: true,
            last_fired: None,
        }
    }

    #[tokio::test]
    async fn evaluate_rule_fires_and_records_last_fired() {
        let dir = tempfile::TempDir::new().unwrap();
        let database = Arc::new(Mutex::new(ServerDatabase::in_dir(dir.path(), 5).unwrap()));
        database.lock().await.initialize().unwrap();

        let mut device = Device::bootstrap(Uuid::new_v4(), "host1".into(), "linux".into(), "Ubuntu".into());
        device.cpu_percent = Some(95.0);
        database.lock().await.upsert_device(&device).unwrap();

        let rule_id = database.lock().await.insert_alert_rule(&sample_rule()).unwrap();
        let mut rule = sample_rule();
        rule.id = rule_id;

        let registry = ConnectionRegistry::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        registry.register_agent(device.device_id, tx);

        let notifier = LoggingEmailNotifier;
        evaluate_rule(&database, &registry, &notifier, &rule, &[device]).await;

        let fetched = database.lock().await.get_alert_rule(rule_id).unwrap().unwrap();
        assert!(fetched.last_fired.is_some());
    }

    #[tokio::test]
    async fn evaluate_rule_skips_throttled_rule() {
        let dir = tempfile::TempDir::new().unwrap();
        let database = Arc::new(Mutex::new(ServerDatabase::in_dir(dir.path(), 5).unwrap()));
        database.lock().await.initialize().unwrap();

        let mut rule = sample_rule();
        rule.last_fired = Some(Utc::now() - chrono::Duration::minutes(5));
        let rule_id = database.lock().await.insert_alert_rule(&rule).unwrap();
        rule.id = rule_id;

        let mut device = Device::bootstrap(Uuid::new_v4(), "host1".into(), "linux".into(), "Ubuntu".into());
        device.cpu_percent = Some(99.0);

        let registry = ConnectionRegistry::new();
        let notifier = LoggingEmailNotifier;
        evaluate_rule(&database, &registry, &notifier, &rule, &[device]).await;

        let fetched = database.lock().await.get_alert_rule(rule_id).unwrap().unwrap();
        assert_eq!(fetched.last_fired, rule.last_fired);
    }
}
