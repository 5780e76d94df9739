// SPDX-License-Identifier: MIT OR Apache-2.0
//! Health endpoint.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use mech_claim::shutdown::ShutdownToken;
use mech_telemetry::{HealthSnapshot, WorkerMetrics};
use tracing::{info, warn};

#[derive(Clone)]
struct HealthState {
    node_id: String,
    metrics: WorkerMetrics,
}

async fn health(State(state): State<HealthState>) -> Json<HealthSnapshot> {
    Json(state.metrics.snapshot(state.node_id.clone()))
}

/// Build the health router (exposed for tests).
pub fn router(node_id: String, metrics: WorkerMetrics) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(HealthState { node_id, metrics })
}

/// Serve `GET /health` on `port` until shutdown.
pub async fn serve(port: u16, node_id: String, metrics: WorkerMetrics, shutdown: ShutdownToken) {
    let app = router(node_id, metrics);
    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            warn!(target: "mech.daemon", %err, port, "health endpoint unavailable");
            return;
        }
    };
    info!(target: "mech.daemon", port, "health endpoint up");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.signalled().await })
        .await;
    if let Err(err) = result {
        warn!(target: "mech.daemon", %err, "health endpoint exited with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn health_serves_snapshot_json() {
        let metrics = WorkerMetrics::started_now();
        metrics.record_job(Duration::from_secs(2));
        metrics.record_idle(Duration::from_secs(2));

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router("cafe0123".to_string(), metrics);
        let shutdown = ShutdownToken::new();
        let stopper = shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stopper.signalled().await })
                .await
                .unwrap();
        });

        let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["node_id"], "cafe0123");
        assert_eq!(body["processed_jobs"], 1);
        assert_eq!(body["idle_cycles"], 1);
        assert!(body["uptime_seconds"].is_number());

        shutdown.signal();
        server.await.unwrap();
    }
}
