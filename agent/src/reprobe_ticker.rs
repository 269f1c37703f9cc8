//! Weekly endpoint-reprobe ticker
//!
//! C2's passive reprobe only fires when the cached endpoint goes stale or
//! the network fingerprint changes, both checked lazily on the channel
//! client's next reconnect. This loop forces a fresh probe of every
//! candidate on a fixed schedule even while a connection is live, so a
//! closer or newly-reachable endpoint gets picked up without waiting for a
//! disconnect to happen first.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::info;

use crate::endpoint;
use crate::state::StateStore;

pub async fn run(
    candidates: Vec<String>,
    state: Arc<Mutex<StateStore>>,
    probe_timeout: Duration,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = ticker.tick() => {}
        }

        let mut guard = state.lock().await;
        if let Some(selected) =
            endpoint::select(&candidates, &mut guard, true, probe_timeout, interval).await
        {
            info!(endpoint = %selected, "Scheduled endpoint reprobe complete");
        }
    }
}
