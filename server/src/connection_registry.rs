//! In-process connection registry (C8)
//!
//! Two process-local tables — registered agents keyed by `device_id`, and
//! subscribed dashboards keyed by a per-connection session id — each mapping
//! to an outbound `mpsc` sender the owning WebSocket task drains. `DashMap`
//! is used instead of the donor's `Arc<RwLock<HashMap>>` rate-limiter
//! pattern: both tables are mutated from many independent per-connection
//! tasks at a much higher concurrency than a periodic single-writer sweep,
//! so a sharded lock-free map is the better fit here (see DESIGN.md).

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use shared::api::ServerMessage;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub type AgentSender = mpsc::UnboundedSender<ServerMessage>;
pub type DashboardSender = mpsc::UnboundedSender<String>;

#[derive(Clone)]
pub struct ConnectionRegistry {
    agents: Arc<DashMap<Uuid, AgentSender>>,
    dashboards: Arc<DashMap<Uuid, DashboardSender>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            agents: Arc::new(DashMap::new()),
            dashboards: Arc::new(DashMap::new()),
        }
    }

    pub fn register_agent(&self, device_id: Uuid, sender: AgentSender) {
        self.agents.insert(device_id, sender);
    }

    pub fn deregister_agent(&self, device_id: Uuid) {
        self.agents.remove(&device_id);
    }

    pub fn is_agent_connected(&self, device_id: Uuid) -> bool {
        self.agents.contains_key(&device_id)
    }

    pub fn agent_ids(&self) -> Vec<Uuid> {
        self.agents.iter().map(|entry| *entry.key()).collect()
    }

    /// Send a message to one registered agent. Returns `false` if the agent
    /// isn't connected or the send failed (its receive loop has exited).
    pub fn send_to_agent(&self, device_id: Uuid, message: ServerMessage) -> bool {
        match self.agents.get(&device_id) {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    pub fn register_dashboard(&self, session_id: Uuid, sender: DashboardSender) {
        self.dashboards.insert(session_id, sender);
    }

    pub fn deregister_dashboard(&self, session_id: Uuid) {
        self.dashboards.remove(&session_id);
    }

    pub fn dashboard_count(&self) -> usize {
        self.dashboards.len()
    }

    /// Best-effort fan-out to every registered dashboard. A send failure for
    /// one subscriber never stops delivery to the rest; the failed entry is
    /// left in place for the next ping cycle to clean up.
    pub fn broadcast_to_dashboards<T: Serialize>(&self, event: &T) {
        let Ok(payload) = serde_json::to_string(event) else {
            return;
        };
        for entry in self.dashboards.iter() {
            if entry.value().send(payload.clone()).is_err() {
                debug!(session_id = %entry.key(), "Dashboard send failed, will be reaped on next ping");
            }
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn send_to_agent_returns_false_when_not_registered() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_to_agent(Uuid::new_v4(), ServerMessage::Ping {}));
    }

    #[test]
    fn send_to_agent_delivers_to_registered_sender() {
        let registry = ConnectionRegistry::new();
        let device_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register_agent(device_id, tx);
        assert!(registry.send_to_agent(device_id, ServerMessage::Ping {}));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn deregister_agent_removes_entry() {
        let registry = ConnectionRegistry::new();
        let device_id = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register_agent(device_id, tx);
        registry.deregister_agent(device_id);
        assert!(!registry.is_agent_connected(device_id));
    }

    #[test]
    fn broadcast_tolerates_a_dropped_subscriber() {
        let registry = ConnectionRegistry::new();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.register_dashboard(Uuid::new_v4(), tx1);
        registry.register_dashboard(Uuid::new_v4(), tx2);
        drop(rx1);

        registry.broadcast_to_dashboards(&json!({"type": "device_update"}));
        assert!(rx2.try_recv().is_ok());
    }
}
