//! Probe and scrape endpoints, served on the health listener.
//!
//! - `GET /health` - liveness, 200 while the process runs
//! - `GET /ready` - readiness, 200 once the signaling listener is bound and
//!   503 again as soon as shutdown starts
//! - `GET /metrics` - Prometheus text format, when a handle is supplied

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Readiness flag plus the identity reported by `/ready`.
#[derive(Debug)]
pub struct HealthState {
    server_id: String,
    ready: AtomicBool,
}

impl HealthState {
    /// Starts not ready.
    #[must_use]
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Serialize)]
struct ReadinessBody {
    status: &'static str,
    server_id: String,
}

/// Build the health router. `/metrics` is mounted only when a Prometheus
/// handle is given.
pub fn health_router(state: Arc<HealthState>, prometheus: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/ready", get(readiness_handler))
        .with_state(state);

    match prometheus {
        Some(handle) => router.route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        ),
        None => router,
    }
}

async fn readiness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<ReadinessBody>) {
    let ready = state.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ReadinessBody {
        status: if ready { "ready" } else { "not_ready" },
        server_id: state.server_id.clone(),
    };
    (status, Json(body))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    async fn get_status(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app
            .oneshot(request)
            .await
            .expect("Failed to execute request");
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[test]
    fn test_health_state_transitions() {
        let state = HealthState::new("conf-test");
        assert!(!state.is_ready(), "Should not be ready by default");

        state.set_ready();
        assert!(state.is_ready());

        state.set_not_ready();
        assert!(!state.is_ready());
    }

    #[tokio::test]
    async fn test_liveness_is_always_ok() {
        let app = health_router(Arc::new(HealthState::new("conf-test")), None);
        let (status, _) = get_status(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_follows_state() {
        let state = Arc::new(HealthState::new("conf-test"));

        let (status, body) = get_status(health_router(Arc::clone(&state), None), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "not_ready");

        state.set_ready();
        let (status, body) = get_status(health_router(Arc::clone(&state), None), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ready");
        assert_eq!(json["server_id"], "conf-test");
    }

    #[tokio::test]
    async fn test_metrics_route_absent_without_handle() {
        let app = health_router(Arc::new(HealthState::new("conf-test")), None);
        let (status, _) = get_status(app, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
