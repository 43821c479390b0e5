//! Liveness and readiness report served on `GET /health`

use crate::multiplexer::{Multiplexer, MuxStats};
use crate::supervisor::{Supervisor, SupervisorSnapshot};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub worker_alive: bool,
    pub uptime_seconds: f64,
    pub worker_responsive: bool,
    pub worker_state: &'static str,
    /// Seconds since the current worker process started
    pub worker_uptime_seconds: Option<f64>,
    pub restart_attempts: u32,
    pub queue_depth: usize,
    pub pending_requests: usize,
    pub clients: usize,
    pub tracked_resources: usize,
    /// How long the request currently with the worker has been outstanding
    pub in_flight_ms: Option<u64>,
    pub tools_cached: bool,
}

impl HealthReport {
    /// Healthy means the worker is running and produced output within the
    /// inactivity window.
    pub fn evaluate(
        worker: &SupervisorSnapshot,
        stats: &MuxStats,
        uptime: Duration,
        inactivity_timeout: Duration,
    ) -> Self {
        let worker_alive = worker.is_alive();
        let worker_responsive = worker_alive
            && worker
                .since_last_activity
                .is_some_and(|idle| idle < inactivity_timeout);

        let status = if worker_alive && worker_responsive {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        Self {
            status,
            worker_alive,
            uptime_seconds: round_secs(uptime),
            worker_responsive,
            worker_state: worker.phase.as_str(),
            worker_uptime_seconds: worker.running_for.map(round_secs),
            restart_attempts: worker.restart_attempts,
            queue_depth: stats.queue_depth,
            pending_requests: stats.pending_requests,
            clients: stats.clients,
            tracked_resources: stats.tracked_resources,
            in_flight_ms: stats.in_flight_age.map(|age| age.as_millis() as u64),
            tools_cached: stats.tools_cached,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

fn round_secs(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 100.0).round() / 100.0
}

/// Builds reports from live supervisor and multiplexer state
#[derive(Clone)]
pub struct HealthReporter {
    supervisor: Arc<Supervisor>,
    mux: Arc<Multiplexer>,
    started_at: Instant,
    inactivity_timeout: Duration,
}

impl HealthReporter {
    pub fn new(supervisor: Arc<Supervisor>, mux: Arc<Multiplexer>, inactivity_timeout: Duration) -> Self {
        Self {
            supervisor,
            mux,
            started_at: Instant::now(),
            inactivity_timeout,
        }
    }

    pub fn report(&self) -> HealthReport {
        HealthReport::evaluate(
            &self.supervisor.snapshot(),
            &self.mux.stats(),
            self.started_at.elapsed(),
            self.inactivity_timeout,
        )
    }
}
