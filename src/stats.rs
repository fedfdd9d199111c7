//! Per-balancer statistics and their exportable snapshots.

use crate::backend::BackendSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

/// Live counters for one balancer instance.
///
/// Counters only grow during normal operation; `reset` is the single
/// administrative exception.
#[derive(Debug, Default)]
pub struct BalancerStats {
    /// Selection attempts, successful or not.
    total_requests: AtomicU64,
    /// Outcomes reported with `success = true`.
    successful_requests: AtomicU64,
    /// Failed selections plus outcomes reported with `success = false`.
    failed_requests: AtomicU64,
    /// Accumulated response time in microseconds, for the average.
    response_time_total_us: AtomicU64,
    /// Number of response-time samples behind the accumulator.
    response_time_samples: AtomicU64,
    /// Wall-clock time of the last selection attempt.
    last_request: RwLock<Option<DateTime<Utc>>>,
    /// Wall-clock time of the last completed probe cycle.
    last_health_check: RwLock<Option<DateTime<Utc>>>,
}

impl BalancerStats {
    /// Create zeroed stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a selection attempt.
    pub fn record_selection(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        *self.last_request.write().expect("stats lock poisoned") = Some(Utc::now());
    }

    /// Record a reported traffic outcome.
    pub fn record_outcome(&self, success: bool, response_time: Option<Duration>) {
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(rt) = response_time {
            self.response_time_total_us
                .fetch_add(rt.as_micros() as u64, Ordering::Relaxed);
            self.response_time_samples.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record the completion of a probe cycle.
    pub fn mark_health_check(&self) {
        *self
            .last_health_check
            .write()
            .expect("stats lock poisoned") = Some(Utc::now());
    }

    /// Average reported response time in milliseconds.
    #[must_use]
    pub fn average_response_time_ms(&self) -> f64 {
        let samples = self.response_time_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        let total = self.response_time_total_us.load(Ordering::Relaxed);
        total as f64 / samples as f64 / 1000.0
    }

    /// Total selection attempts.
    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Reset all counters. Administrative calls only; normal operation
    /// never resets.
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.successful_requests.store(0, Ordering::Relaxed);
        self.failed_requests.store(0, Ordering::Relaxed);
        self.response_time_total_us.store(0, Ordering::Relaxed);
        self.response_time_samples.store(0, Ordering::Relaxed);
        *self.last_request.write().expect("stats lock poisoned") = None;
    }

    /// Build the exportable snapshot.
    #[must_use]
    pub fn snapshot(
        &self,
        balancer: &str,
        strategy: &str,
        backends: &[BackendSnapshot],
    ) -> StatsSnapshot {
        StatsSnapshot {
            balancer: balancer.to_string(),
            strategy: strategy.to_string(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            average_response_time_ms: self.average_response_time_ms(),
            total_servers: backends.len(),
            active_servers: backends.iter().filter(|b| b.available).count(),
            last_request: *self.last_request.read().expect("stats lock poisoned"),
            last_health_check: *self
                .last_health_check
                .read()
                .expect("stats lock poisoned"),
            servers: backends.iter().map(ServerStatsSnapshot::from).collect(),
        }
    }
}

/// Exportable statistics document for one balancer.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Balancer name.
    pub balancer: String,
    /// Active strategy name.
    pub strategy: String,
    /// Selection attempts.
    pub total_requests: u64,
    /// Outcomes reported successful.
    pub successful_requests: u64,
    /// Failed selections and failed outcomes.
    pub failed_requests: u64,
    /// Mean reported response time.
    pub average_response_time_ms: f64,
    /// Registered backend count.
    pub total_servers: usize,
    /// Backends currently available for selection.
    pub active_servers: usize,
    /// Last selection attempt.
    pub last_request: Option<DateTime<Utc>>,
    /// Last completed probe cycle.
    pub last_health_check: Option<DateTime<Utc>>,
    /// Per-backend statistics.
    pub servers: Vec<ServerStatsSnapshot>,
}

/// Exportable per-backend statistics row.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatsSnapshot {
    /// Backend id.
    pub id: String,
    /// Health state name.
    pub state: &'static str,
    /// Whether the backend can receive traffic.
    pub available: bool,
    /// Requests routed to this backend.
    pub requests_routed: u64,
    /// Active connection count.
    pub active_connections: u32,
    /// Smoothed response time in milliseconds.
    pub response_time_ms: f64,
    /// Error fraction in [0, 1].
    pub error_rate: f64,
    /// Administrator weight.
    pub weight: f64,
    /// Adaptive computed weight.
    pub computed_weight: f64,
    /// Derived priority rank.
    pub priority: u32,
    /// Last probe time.
    pub last_health_check: Option<DateTime<Utc>>,
}

impl From<&BackendSnapshot> for ServerStatsSnapshot {
    fn from(snap: &BackendSnapshot) -> Self {
        Self {
            id: snap.id.clone(),
            state: snap.state.name(),
            available: snap.available,
            requests_routed: snap.requests_routed,
            active_connections: snap.active_connections,
            response_time_ms: snap.response_time_ewma,
            error_rate: snap.error_rate,
            weight: snap.weight,
            computed_weight: snap.computed_weight,
            priority: snap.priority,
            last_health_check: snap.last_health_check,
        }
    }
}
