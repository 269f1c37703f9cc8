//! Offline detector (C11)
//!
//! Every 60 s (after a 60 s startup warm-up), transitions any device that
//! claims to be `online` but has gone silent past the configured threshold
//! *and* has no live channel in the connection registry. Still-connected
//! devices are never touched even if their last check-in is old — the live
//! channel is ground truth, `last_seen` is only a fallback for the window
//! between reconnects.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shared::model::DeviceStatus;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::connection_registry::ConnectionRegistry;
use crate::database::ServerDatabase;
use crate::email::{notify_best_effort, AlertNotification, EmailNotifier};

async fn tick(
    database: &Arc<Mutex<ServerDatabase>>,
    registry: &ConnectionRegistry,
    notifier: &dyn EmailNotifier,
    offline_minutes: i64,
) {
    let cutoff = Utc::now() - chrono::Duration::minutes(offline_minutes);
    let stale = {
        let mut db = database.lock().await;
        match db.list_stale_online_devices(cutoff) {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "Failed to list stale online devices");
                return;
            }
        }
    };

    for device in stale {
        if registry.is_agent_connected(device.device_id) {
            continue;
        }

        let mut db = database.lock().await;
        if let Err(e) = db.set_device_status(device.device_id, DeviceStatus::Offline) {
            warn!(device_id = %device.device_id, error = %e, "Failed to mark device offline");
            continue;
        }
        drop(db);

        info!(device_id = %device.device_id, hostname = %device.hostname, "Device transitioned to offline");
        registry.broadcast_to_dashboards(&serde_json::json!({
            "type": "device_offline",
            "device_id": device.device_id,
        }));
        notify_best_effort(
            notifier,
            AlertNotification::DeviceOffline {
                device_id: device.device_id,
                hostname: device.hostname,
            },
        )
        .await;
    }
}

pub async fn run(
    database: Arc<Mutex<ServerDatabase>>,
    registry: ConnectionRegistry,
    notifier: Arc<dyn EmailNotifier>,
    offline_minutes: i64,
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
                debug!("Offline detector shutting down");
                return;
            }
            _ = ticker.tick() => {
                tick(&database, &registry, notifier.as_ref(), offline_minutes).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::LoggingEmailNotifier;
    use shared::model::Device;
    use uuid::Uuid;

    #[tokio::test]
    async fn tick_marks_silent_unregistered_device_offline() {
        let dir = tempfile::TempDir::new().unwrap();
        let database = Arc::new(Mutex::new(ServerDatabase::in_dir(dir.path(), 5).unwrap()));
        database.lock().await.initialize().unwrap();

        let mut device = Device::bootstrap(Uuid::new_v4(), "host1".into(), "linux".into(), "Ubuntu".into());
        device.last_seen = Utc::now() - chrono::Duration::minutes(15);
        database.lock().await.upsert_device(&device).unwrap();

        let registry = ConnectionRegistry::new();
        let notifier = LoggingEmailNotifier;
        tick(&database, &registry, &notifier, 10).await;

        let fetched = database.lock().await.get_device(device.device_id).unwrap().unwrap();
        assert_eq!(fetched.status, DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn tick_skips_device_with_live_channel() {
        let dir = tempfile::TempDir::new().unwrap();
        let database = Arc::new(Mutex::new(ServerDatabase::in_dir(dir.path(), 5).unwrap()));
        database.lock().await.initialize().unwrap();

        let mut device = Device::bootstrap(Uuid::new_v4(), "host1".into(), "linux".into(), "Ubuntu".into());
        device.last_seen = Utc::now() - chrono::Duration::minutes(15);
        database.lock().await.upsert_device(&device).unwrap();

        let registry = ConnectionRegistry::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        registry.register_agent(device.device_id, tx);

        let notifier = LoggingEmailNotifier;
        tick(&database, &registry, &notifier, 10).await;

        let fetched = database.lock().await.get_device(device.device_id).unwrap().unwrap();
        assert_eq!(fetched.status, DeviceStatus::Online);
    }
}
