// SPDX-License-Identifier: MIT OR Apache-2.0
//! mech-telemetry
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Tracing initialization and the worker efficiency counters surfaced by
//! the health endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Tracing init
// ---------------------------------------------------------------------------

/// Install the global tracing subscriber.
///
/// Respects `RUST_LOG`; falls back to `info` for worker targets. JSON
/// output is selected with `json = true` for log shippers. Call once from
/// a binary; libraries must never install a subscriber.
pub fn init(json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mech=debug"));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    tracing::debug!(target: "mech.telemetry", json, "subscriber installed");
}

// ---------------------------------------------------------------------------
// Worker metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MetricsInner {
    started_at: Option<DateTime<Utc>>,
    last_activity: Option<DateTime<Utc>>,
    processed_jobs: u64,
    idle_cycles: u64,
    total_execution: Duration,
    total_idle: Duration,
}

/// Thread-safe efficiency counters for one worker process.
#[derive(Debug, Clone, Default)]
pub struct WorkerMetrics {
    inner: Arc<Mutex<MetricsInner>>,
}

impl WorkerMetrics {
    /// Create a collector stamped with the current start time.
    #[must_use]
    pub fn started_now() -> Self {
        let metrics = Self::default();
        metrics.lock().started_at = Some(Utc::now());
        metrics
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        self.inner.lock().expect("metrics lock poisoned")
    }

    /// Record an idle claim-loop tick of the given duration.
    pub fn record_idle(&self, duration: Duration) {
        let mut inner = self.lock();
        inner.idle_cycles += 1;
        inner.total_idle += duration;
    }

    /// Record a processed job and its execution duration.
    pub fn record_job(&self, duration: Duration) {
        let mut inner = self.lock();
        inner.processed_jobs += 1;
        inner.total_execution += duration;
        inner.last_activity = Some(Utc::now());
    }

    /// Update the last-activity stamp without counting a job.
    pub fn touch(&self) {
        self.lock().last_activity = Some(Utc::now());
    }

    /// Snapshot the counters into a health payload.
    #[must_use]
    pub fn snapshot(&self, node_id: String) -> HealthSnapshot {
        let inner = self.lock();
        let now = Utc::now();
        let uptime_seconds = inner
            .started_at
            .map(|t| (now - t).num_seconds().max(0) as u64)
            .unwrap_or(0);
        let last_activity_age_seconds = inner
            .last_activity
            .map(|t| (now - t).num_seconds().max(0) as u64);
        let avg_job_duration_ms = if inner.processed_jobs == 0 {
            0
        } else {
            (inner.total_execution.as_millis() / u128::from(inner.processed_jobs)) as u64
        };
        let busy = inner.total_execution.as_secs_f64();
        let idle = inner.total_idle.as_secs_f64();
        let idle_percent = if busy + idle > 0.0 {
            idle / (busy + idle) * 100.0
        } else {
            0.0
        };

        HealthSnapshot {
            node_id,
            uptime_seconds,
            last_activity_age_seconds,
            processed_jobs: inner.processed_jobs,
            idle_cycles: inner.idle_cycles,
            avg_job_duration_ms,
            total_execution_ms: inner.total_execution.as_millis() as u64,
            total_idle_ms: inner.total_idle.as_millis() as u64,
            idle_percent,
        }
    }
}

/// The JSON body served by `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// First 8 hex chars of the master safe address.
    pub node_id: String,
    /// Seconds since the worker started.
    pub uptime_seconds: u64,
    /// Seconds since the last processed job, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_age_seconds: Option<u64>,
    /// Jobs processed since start.
    pub processed_jobs: u64,
    /// Claim-loop ticks with no eligible work.
    pub idle_cycles: u64,
    /// Mean job execution duration.
    pub avg_job_duration_ms: u64,
    /// Total time spent executing jobs.
    pub total_execution_ms: u64,
    /// Total time spent idle.
    pub total_idle_ms: u64,
    /// Idle share of observed time, 0–100.
    pub idle_percent: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_collector_snapshots_zeroes() {
        let snapshot = WorkerMetrics::default().snapshot("abcd1234".into());
        assert_eq!(snapshot.processed_jobs, 0);
        assert_eq!(snapshot.idle_cycles, 0);
        assert_eq!(snapshot.avg_job_duration_ms, 0);
        assert_eq!(snapshot.idle_percent, 0.0);
        assert!(snapshot.last_activity_age_seconds.is_none());
    }

    #[test]
    fn job_and_idle_accounting() {
        let metrics = WorkerMetrics::started_now();
        metrics.record_job(Duration::from_secs(4));
        metrics.record_job(Duration::from_secs(2));
        metrics.record_idle(Duration::from_secs(6));

        let snapshot = metrics.snapshot("abcd1234".into());
        assert_eq!(snapshot.processed_jobs, 2);
        assert_eq!(snapshot.idle_cycles, 1);
        assert_eq!(snapshot.avg_job_duration_ms, 3_000);
        assert_eq!(snapshot.total_execution_ms, 6_000);
        assert_eq!(snapshot.total_idle_ms, 6_000);
        assert!((snapshot.idle_percent - 50.0).abs() < 1e-9);
        assert!(snapshot.last_activity_age_seconds.is_some());
    }

    #[test]
    fn clones_share_state() {
        let metrics = WorkerMetrics::default();
        let clone = metrics.clone();
        clone.record_idle(Duration::from_secs(1));
        assert_eq!(metrics.snapshot("n".into()).idle_cycles, 1);
    }

    #[test]
    fn snapshot_serializes_node_id() {
        let json =
            serde_json::to_value(WorkerMetrics::default().snapshot("beef0000".into())).unwrap();
        assert_eq!(json["node_id"], "beef0000");
        assert!(json.get("last_activity_age_seconds").is_none());
    }
}
