//! Endpoint selector (C2)
//!
//! Picks which candidate check-in endpoint (local-first, then fallback) is
//! currently reachable, by TCP-connect probing each in list order. The
//! winner, the probe timestamp, and a fingerprint of the local network are
//! cached in [`crate::state::AgentState`] so most ticks skip probing
//! entirely. This function never fails: every error path falls back to the
//! cached or first candidate rather than propagating.

use std::time::Duration;

use chrono::Utc;
use sysinfo::Networks;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::state::StateStore;

/// Why a reprobe is happening, for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReprobeReason {
    CacheEmpty,
    Stale,
    Forced,
    NetworkChanged,
}

/// Compute a short, stable fingerprint of the local network (the set of
/// non-loopback interface names paired with their MAC addresses). A change
/// here is what the event watcher (C7) reacts to, and what forces a
/// reselection here.
pub fn network_fingerprint() -> String {
    let networks = Networks::new_with_refreshed_list();
    let mut parts: Vec<String> = networks
        .iter()
        .map(|(name, data)| format!("{name}:{}", data.mac_address()))
        .collect();
    parts.sort();
    parts.join(",")
}

fn host_port(endpoint: &str) -> Option<String> {
    let without_scheme = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    if authority.is_empty() {
        None
    } else {
        Some(authority.to_string())
    }
}

async fn probe(endpoint: &str, timeout: Duration) -> bool {
    let Some(authority) = host_port(endpoint) else {
        return false;
    };
    match tokio::time::timeout(timeout, TcpStream::connect(&authority)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(endpoint, error = %e, "Endpoint probe failed");
            false
        }
        Err(_elapsed) => {
            debug!(endpoint, "Endpoint probe timed out");
            false
        }
    }
}

/// Select a reachable endpoint from `candidates`, reprobing only when the
/// cache is empty, stale, forced, or the network fingerprint has changed.
/// Never panics or returns an error: with no reachable candidate, falls back
/// to the cached selection or the first candidate and logs the situation.
pub async fn select(
    candidates: &[String],
    state: &mut StateStore,
    force: bool,
    probe_timeout: Duration,
    reprobe_age: Duration,
) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }

    let current_fingerprint = network_fingerprint();
    let fingerprint_changed = state
        .state
        .last_network_fingerprint
        .as_deref()
        .is_some_and(|cached| cached != current_fingerprint);

    let cache_age = state
        .state
        .last_endpoint_probe
        .map(|probed_at| Utc::now().signed_duration_since(probed_at));

    let reason = if state.state.active_endpoint.is_none() {
        Some(ReprobeReason::CacheEmpty)
    } else if force {
        Some(ReprobeReason::Forced)
    } else if fingerprint_changed {
        Some(ReprobeReason::NetworkChanged)
    } else if cache_age.map(|age| age.num_seconds() as u64 >= reprobe_age.as_secs()).unwrap_or(true) {
        Some(ReprobeReason::Stale)
    } else {
        None
    };

    let Some(reason) = reason else {
        return state.state.active_endpoint.clone();
    };

    debug!(?reason, "Reprobing candidate endpoints");
    state.state.last_network_fingerprint = Some(current_fingerprint);

    for candidate in candidates {
        if probe(candidate, probe_timeout).await {
            state.state.active_endpoint = Some(candidate.clone());
            state.state.last_endpoint_probe = Some(Utc::now());
            if let Err(e) = state.save() {
                warn!(error = %e, "Failed to persist endpoint selection");
            }
            return Some(candidate.clone());
        }
    }

    warn!("No candidate endpoint responded, falling back to cached/first candidate unverified");
    state.state.active_endpoint = Some(
        state
            .state
            .active_endpoint
            .clone()
            .unwrap_or_else(|| candidates[0].clone()),
    );
    state.state.active_endpoint.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn host_port_strips_scheme_and_path() {
        assert_eq!(host_port("http://127.0.0.1:8080").as_deref(), Some("127.0.0.1:8080"));
        assert_eq!(host_port("ws://example.com:9000/api/v1/agent/ws").as_deref(), Some("example.com:9000"));
        assert_eq!(host_port("127.0.0.1:8080").as_deref(), Some("127.0.0.1:8080"));
    }

    #[tokio::test]
    async fn select_returns_none_for_empty_candidate_list() {
        let dir = TempDir::new().unwrap();
        let mut state = StateStore::load(dir.path()).unwrap();
        let result = select(&[], &mut state, false, Duration::from_millis(50), Duration::from_secs(60)).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn select_falls_back_to_first_candidate_when_nothing_responds() {
        let dir = TempDir::new().unwrap();
        let mut state = StateStore::load(dir.path()).unwrap();
        let candidates = vec!["127.0.0.1:1".to_string()];
        let result = select(&candidates, &mut state, false, Duration::from_millis(50), Duration::from_secs(60)).await;
        assert_eq!(result.as_deref(), Some("127.0.0.1:1"));
    }

    #[tokio::test]
    async fn select_reuses_cached_endpoint_without_reprobing() {
        let dir = TempDir::new().unwrap();
        let mut state = StateStore::load(dir.path()).unwrap();
        state.state.active_endpoint = Some("cached:8080".to_string());
        state.state.last_endpoint_probe = Some(Utc::now());
        state.state.last_network_fingerprint = Some(network_fingerprint());

        let result = select(&["other:9090".to_string()], &mut state, false, Duration::from_millis(50), Duration::from_secs(3600)).await;
        assert_eq!(result.as_deref(), Some("cached:8080"));
    }
}
