//! Push bridge (C10)
//!
//! Forwards externally-originated commands (from whatever operator tooling
//! publishes to the pub/sub topic) to a specific agent, or broadcasts to
//! every registered agent when no `device_id` is named. The pub/sub
//! transport itself is an external collaborator (§1 non-goal) represented
//! behind [`PushSource`] so a real transport (Redis, NATS, ...) can be
//! plugged in later without touching the forwarding logic below. The
//! concrete implementation shipped here is an in-process broadcast channel,
//! usable standalone and in tests.

use serde::{Deserialize, Serialize};
use shared::api::ServerMessage;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection_registry::ConnectionRegistry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEnvelope {
    #[serde(default)]
    pub device_id: Option<Uuid>,
    pub message: ServerMessage,
}

#[derive(Debug, thiserror::Error)]
pub enum PushSourceError {
    #[error("push source transport closed")]
    Closed,
    #[error("receiver lagged, {0} messages dropped")]
    Lagged(u64),
}

/// A source of push envelopes. Implementations model a pub/sub subscription:
/// `recv` yields the next envelope or an error describing why the stream
/// ended (closed transport, lagging receiver).
#[async_trait::async_trait]
pub trait PushSource: Send + Sync {
    async fn recv(&mut self) -> Result<PushEnvelope, PushSourceError>;
}

/// In-process pub/sub stand-in, backed by a `tokio::sync::broadcast`
/// channel. `PushBridgePublisher` is the corresponding publish handle for
/// local operation and tests; a real deployment would instead implement
/// `PushSource` against its external transport's client library.
#[derive(Clone)]
pub struct PushBridgePublisher {
    tx: broadcast::Sender<PushEnvelope>,
}

impl PushBridgePublisher {
    pub fn publish(&self, envelope: PushEnvelope) {
        let _ = self.tx.send(envelope);
    }
}

pub struct BroadcastPushSource {
    rx: broadcast::Receiver<PushEnvelope>,
}

pub fn in_process_channel(capacity: usize) -> (PushBridgePublisher, BroadcastPushSource) {
    let (tx, rx) = broadcast::channel(capacity);
    (PushBridgePublisher { tx }, BroadcastPushSource { rx })
}

#[async_trait::async_trait]
impl PushSource for BroadcastPushSource {
    async fn recv(&mut self) -> Result<PushEnvelope, PushSourceError> {
        match self.rx.recv().await {
            Ok(envelope) => Ok(envelope),
            Err(broadcast::error::RecvError::Closed) => Err(PushSourceError::Closed),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(PushSourceError::Lagged(n)),
        }
    }
}

/// Drive the bridge until `shutdown_rx` fires, reconnecting `source` with a
/// fixed backoff on transport errors. Each delivered envelope is forwarded
/// to the named agent if present and registered, otherwise broadcast to
/// every registered agent.
pub async fn run(
    mut source: Box<dyn PushSource>,
    registry: ConnectionRegistry,
    backoff: std::time::Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Push bridge shutting down");
                return;
            }
            result = source.recv() => {
                match result {
                    Ok(envelope) => forward(&registry, envelope),
                    Err(e) => {
                        warn!(error = %e, "Push bridge transport error, backing off");
                        tokio::select! {
                            _ = shutdown_rx.recv() => return,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                }
            }
        }
    }
}

fn forward(registry: &ConnectionRegistry, envelope: PushEnvelope) {
    match envelope.device_id {
        Some(device_id) => {
            if !registry.send_to_agent(device_id, envelope.message) {
                debug!(%device_id, "Push bridge target not registered, dropping");
            }
        }
        None => {
            for device_id in registry.agent_ids() {
                let _ = registry.send_to_agent(device_id, envelope.message.clone());
            }
        }
    }
}

/// Adapter so an `mpsc` receiver (used by a future real transport's client
/// task) can also satisfy `PushSource` without another broadcast hop.
pub struct MpscPushSource {
    pub rx: mpsc::UnboundedReceiver<PushEnvelope>,
}

#[async_trait::async_trait]
impl PushSource for MpscPushSource {
    async fn recv(&mut self) -> Result<PushEnvelope, PushSourceError> {
        self.rx.recv().await.ok_or(PushSourceError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forward_targets_one_registered_agent() {
        let registry = ConnectionRegistry::new();
        let device_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register_agent(device_id, tx);

        forward(
            &registry,
            PushEnvelope {
                device_id: Some(device_id),
                message: ServerMessage::Ping {},
            },
        );
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn forward_broadcasts_when_device_id_absent() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.register_agent(Uuid::new_v4(), tx1);
        registry.register_agent(Uuid::new_v4(), tx2);

        forward(
            &registry,
            PushEnvelope {
                device_id: None,
                message: ServerMessage::Ping {},
            },
        );
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn in_process_channel_delivers_published_envelope() {
        let (publisher, mut source) = in_process_channel(8);
        publisher.publish(PushEnvelope {
            device_id: None,
            message: ServerMessage::Ping {},
        });
        let received = source.recv().await.unwrap();
        assert!(received.device_id.is_none());
    }
}
