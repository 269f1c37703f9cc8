//! Scheduled-report ticker (stub)
//!
//! The original system periodically renders and emails fleet-health
//! summaries; a scheduled-report *generator* is a distinct collaborator
//! from anything specified here and stays out of scope. This loop exists so
//! the concurrency model's "pool of background loops" (task dispatcher,
//! offline detector, alert rule engine, push bridge, scheduled-report
//! ticker) is complete and so a real generator has a concrete place to hang
//! off of later; today it only logs.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

pub async fn run(tick_interval: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Report ticker shutting down");
                return;
            }
            _ = ticker.tick() => {
                debug!("Scheduled-report tick (no report generator configured)");
            }
        }
    }
}
