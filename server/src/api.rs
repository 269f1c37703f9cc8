//! Application state, error type, and route table
//!
//! `AppState` bundles everything a handler needs: the static config, the
//! database behind a `tokio::Mutex` (one connection, held briefly per
//! request), the connection registry, and the email collaborator. The route
//! table wires the C13/C14/C15 handlers into axum; everything else
//! (dispatcher, offline detector, alert engine, push bridge, reports) runs
//! off-router as a background loop started from `main`.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use shared::api::endpoints;
use shared::ServerConfig;
use tokio::sync::Mutex;

use crate::connection_registry::ConnectionRegistry;
use crate::database::ServerDatabase;
use crate::email::EmailNotifier;
use crate::{agent_ws, checkin, dashboard_ws};

/// Maximum request body size: 1MB. Check-in payloads are small telemetry
/// snapshots; nothing on this router legitimately needs more.
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub database: Arc<Mutex<ServerDatabase>>,
    pub registry: ConnectionRegistry,
    pub notifier: Arc<dyn EmailNotifier>,
    /// Fallback host:port used to build a channel URL when the check-in
    /// request carries no `Host` header.
    pub public_listen_address: String,
}

impl AppState {
    pub fn new(
        config: Arc<ServerConfig>,
        database: Arc<Mutex<ServerDatabase>>,
        registry: ConnectionRegistry,
        notifier: Arc<dyn EmailNotifier>,
    ) -> Self {
        let public_listen_address = config.listen_address.clone();
        Self {
            config,
            database,
            registry,
            notifier,
            public_listen_address,
        }
    }
}

/// Errors a handler can report. `Internal` carries the underlying
/// `anyhow::Error` rather than a pre-rendered string so call sites can use
/// `.map_err(ApiError::Internal)` directly against the database layer's
/// `anyhow::Result` returns.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
        };

        let body = Json(serde_json::json!({
            "error": error_message,
            "details": self.to_string(),
        }));

        (status, body).into_response()
    }
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let mut database = state.database.lock().await;
    let stats = database.get_stats()?;
    Ok(Json(serde_json::json!({
        "device_count": stats.device_count,
        "task_count": stats.task_count,
        "task_result_count": stats.task_result_count,
        "metric_sample_count": stats.metric_sample_count,
        "alert_rule_count": stats.alert_rule_count,
        "database_size_bytes": stats.database_size_bytes,
        "connected_agents": state.registry.agent_ids().len(),
        "connected_dashboards": state.registry.dashboard_count(),
    })))
}

/// Builds the router agents and dashboards talk to. Background loops
/// (dispatcher, offline detector, alert engine, push bridge, reports) are
/// not routes — they're spawned independently in `main` against the same
/// `database`/`registry` handles.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/stats", get(stats))
        .route(endpoints::CHECKIN, axum::routing::post(checkin::handle_checkin))
        .route(
            &format!("{}{{task_id}}", endpoints::TASK_ACTIVE_PROBE_PREFIX),
            get(checkin::handle_task_active_probe),
        )
        .route(endpoints::AGENT_WS, get(agent_ws::handle_agent_ws))
        .route(endpoints::DASHBOARD_WS, get(dashboard_ws::handle_dashboard_ws))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::LoggingEmailNotifier;

    fn test_state() -> AppState {
        let dir = tempfile::TempDir::new().unwrap();
        let mut database = ServerDatabase::in_dir(dir.path(), 5).unwrap();
        database.initialize().unwrap();
        AppState::new(
            Arc::new(ServerConfig::default()),
            Arc::new(Mutex::new(database)),
            ConnectionRegistry::new(),
            Arc::new(LoggingEmailNotifier),
        )
    }

    #[test]
    fn api_error_internal_maps_to_500() {
        let err = ApiError::Internal(anyhow::anyhow!("boom"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn api_error_unauthorized_maps_to_401() {
        let response = ApiError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_router_serves_health() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let app = create_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
