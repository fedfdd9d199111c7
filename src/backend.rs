//! Backend server records and the per-backend health state machine.

use crate::config::{AdaptiveConfig, BackendConfig};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

/// Health state of a backend.
///
/// `Unknown → Healthy ⇄ Unhealthy`, with `Quarantined` entered from
/// `Unhealthy` after `max_failures` consecutive failures and a timed
/// transition back to `Unknown` once the failover timeout elapses.
/// Leaving `Unknown` after a quarantine requires fresh probe successes;
/// the quarantine never heals on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Not probed yet, or re-evaluating after a quarantine expired.
    Unknown,
    /// Probes are passing.
    Healthy,
    /// At least one recent probe or reported outcome failed.
    Unhealthy,
    /// Removed from the pool until the deadline passes.
    Quarantined,
}

impl HealthState {
    /// Name used in stats export and logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Quarantined => "quarantined",
        }
    }
}

/// State transition produced by recording a probe or outcome.
///
/// The caller (health monitor or instance) turns these into events;
/// the record itself never publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    /// No state change.
    None,
    /// Entered the unhealthy state.
    BecameUnhealthy,
    /// Entered quarantine.
    Quarantined,
    /// Recovered to healthy.
    Recovered,
}

/// Producer-supplied and derived load signals.
#[derive(Debug, Clone)]
struct LoadSignals {
    /// Administrator-assigned weight, >= 0.
    base_weight: f64,
    /// Adaptive output: `base_weight * (1 - load_score)`, clamped.
    computed_weight: f64,
    /// Derived rank, 1 = most preferred.
    priority: u32,
    /// CPU usage percentage, 0-100.
    cpu_usage: f64,
    /// Memory usage percentage, 0-100.
    memory_usage: f64,
    /// Network usage, producer units.
    network_usage: f64,
    /// Throughput, producer units.
    throughput: f64,
    /// Error fraction in [0, 1].
    error_rate: f64,
    /// Smoothed response time in milliseconds. Never a raw sample.
    response_time_ewma: f64,
}

/// Serialized health bookkeeping.
///
/// One mutex makes the per-backend state transition the atomic unit of
/// update: probe results and traffic outcomes for the same backend can
/// never interleave half-applied.
#[derive(Debug)]
struct HealthCore {
    state: HealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    quarantine_until: Option<Instant>,
    /// Set once the first probe or outcome lands. An `Unknown` backend
    /// that has history is not served optimistically.
    has_history: bool,
    last_health_check: Option<DateTime<Utc>>,
    last_response: Option<DateTime<Utc>>,
}

/// Partial update of a backend's load and capacity fields.
///
/// `None` fields are left untouched; the id is immutable by construction.
#[derive(Debug, Clone, Default)]
pub struct LoadUpdate {
    /// CPU usage percentage.
    pub cpu_usage: Option<f64>,
    /// Memory usage percentage.
    pub memory_usage: Option<f64>,
    /// Network usage.
    pub network_usage: Option<f64>,
    /// Throughput.
    pub throughput: Option<f64>,
    /// Error fraction in [0, 1].
    pub error_rate: Option<f64>,
    /// Administrator weight.
    pub weight: Option<f64>,
    /// Connection capacity.
    pub max_connections: Option<u32>,
}

/// One backend server within a balancer instance.
///
/// Shared by the selection path, the health monitor, and outcome
/// reporting; counters are atomic, float signals sit behind a
/// reader-writer lock, and health transitions are serialized by a mutex.
#[derive(Debug)]
pub struct BackendServer {
    id: String,
    address: String,
    port: u16,
    enabled: AtomicBool,
    max_connections: AtomicU32,
    active_connections: AtomicU32,
    requests_routed: AtomicU64,
    outcome_successes: AtomicU64,
    outcome_failures: AtomicU64,
    load: RwLock<LoadSignals>,
    health: Mutex<HealthCore>,
}

/// Immutable copy of a backend's state for lock-free evaluation.
///
/// Strategies work on snapshots so selection logic never holds the
/// registry lock.
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    /// Backend id.
    pub id: String,
    /// Backend host address.
    pub address: String,
    /// Backend port.
    pub port: u16,
    /// Administrator-enabled flag.
    pub enabled: bool,
    /// Health state at snapshot time.
    pub state: HealthState,
    /// `enabled` AND healthy AND not quarantined, recomputed at read.
    pub available: bool,
    /// Active connection count.
    pub active_connections: u32,
    /// Connection capacity.
    pub max_connections: u32,
    /// Administrator weight.
    pub weight: f64,
    /// Adaptive computed weight.
    pub computed_weight: f64,
    /// Derived rank, 1 = most preferred.
    pub priority: u32,
    /// CPU usage percentage.
    pub cpu_usage: f64,
    /// Memory usage percentage.
    pub memory_usage: f64,
    /// Error fraction.
    pub error_rate: f64,
    /// Smoothed response time in milliseconds.
    pub response_time_ewma: f64,
    /// Requests routed to this backend.
    pub requests_routed: u64,
    /// Last probe time.
    pub last_health_check: Option<DateTime<Utc>>,
    /// Last successful traffic response time.
    pub last_response: Option<DateTime<Utc>>,
}

impl BackendSnapshot {
    /// Whether the backend has room for another connection.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.active_connections < self.max_connections
    }
}

impl BackendServer {
    /// Create a backend from configuration.
    #[must_use]
    pub fn new(config: &BackendConfig) -> Self {
        let weight = config.weight.max(0.0);
        Self {
            id: config.id.clone(),
            address: config.address.clone(),
            port: config.port,
            enabled: AtomicBool::new(config.enabled),
            max_connections: AtomicU32::new(config.max_connections),
            active_connections: AtomicU32::new(0),
            requests_routed: AtomicU64::new(0),
            outcome_successes: AtomicU64::new(0),
            outcome_failures: AtomicU64::new(0),
            load: RwLock::new(LoadSignals {
                base_weight: weight,
                computed_weight: weight,
                priority: 1,
                cpu_usage: 0.0,
                memory_usage: 0.0,
                network_usage: 0.0,
                throughput: 0.0,
                error_rate: 0.0,
                response_time_ewma: 0.0,
            }),
            health: Mutex::new(HealthCore {
                state: HealthState::Unknown,
                consecutive_failures: 0,
                consecutive_successes: 0,
                quarantine_until: None,
                has_history: false,
                last_health_check: None,
                last_response: None,
            }),
        }
    }

    /// Get the backend id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the `host:port` endpoint for probing.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Get the administrator-enabled flag.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Set the administrator-enabled flag.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Current health state, applying the timed quarantine expiry.
    #[must_use]
    pub fn health_state(&self) -> HealthState {
        let mut core = self.health.lock().expect("health lock poisoned");
        Self::expire_quarantine(&mut core, Instant::now());
        core.state
    }

    /// Whether the backend may receive traffic.
    ///
    /// Always recomputed from `enabled` and the health state, never
    /// cached. A fresh `Unknown` backend is served optimistically;
    /// an `Unknown` backend with probe history (post-quarantine) is not.
    #[must_use]
    pub fn is_available(&self) -> bool {
        if !self.enabled() {
            return false;
        }
        let mut core = self.health.lock().expect("health lock poisoned");
        Self::expire_quarantine(&mut core, Instant::now());
        match core.state {
            HealthState::Healthy => true,
            HealthState::Unknown => !core.has_history,
            HealthState::Unhealthy | HealthState::Quarantined => false,
        }
    }

    /// Whether the backend is inside an active quarantine window.
    #[must_use]
    pub fn in_quarantine(&self) -> bool {
        self.health_state() == HealthState::Quarantined
    }

    fn expire_quarantine(core: &mut HealthCore, now: Instant) {
        if core.state == HealthState::Quarantined {
            if let Some(until) = core.quarantine_until {
                if now >= until {
                    core.state = HealthState::Unknown;
                    core.quarantine_until = None;
                    core.consecutive_failures = 0;
                    core.consecutive_successes = 0;
                }
            }
        }
    }

    /// Record a successful probe.
    ///
    /// Resets the failure streak; `healthy_threshold` consecutive
    /// successes are required to leave `Unhealthy` or a post-quarantine
    /// `Unknown` (hysteresis against flapping on a single lucky probe).
    pub fn record_probe_success(&self, healthy_threshold: u32) -> HealthTransition {
        let mut core = self.health.lock().expect("health lock poisoned");
        Self::expire_quarantine(&mut core, Instant::now());
        core.last_health_check = Some(Utc::now());

        if core.state == HealthState::Quarantined {
            // Still inside the window; the streak only counts once the
            // quarantine has expired.
            return HealthTransition::None;
        }

        core.consecutive_failures = 0;
        core.consecutive_successes += 1;

        match core.state {
            HealthState::Healthy => HealthTransition::None,
            HealthState::Unknown if !core.has_history => {
                core.has_history = true;
                core.state = HealthState::Healthy;
                HealthTransition::None
            },
            HealthState::Unknown | HealthState::Unhealthy => {
                core.has_history = true;
                if core.consecutive_successes >= healthy_threshold {
                    core.state = HealthState::Healthy;
                    HealthTransition::Recovered
                } else {
                    HealthTransition::None
                }
            },
            HealthState::Quarantined => HealthTransition::None,
        }
    }

    /// Record a failed probe or failed traffic outcome.
    ///
    /// Resets the success streak; reaching `max_failures` consecutive
    /// failures enters quarantine for `failover_timeout`.
    pub fn record_probe_failure(
        &self,
        max_failures: u32,
        failover_timeout: Duration,
    ) -> HealthTransition {
        let mut core = self.health.lock().expect("health lock poisoned");
        Self::expire_quarantine(&mut core, Instant::now());
        core.last_health_check = Some(Utc::now());
        core.has_history = true;

        if core.state == HealthState::Quarantined {
            return HealthTransition::None;
        }

        core.consecutive_successes = 0;
        core.consecutive_failures += 1;

        if core.consecutive_failures >= max_failures {
            core.state = HealthState::Quarantined;
            core.quarantine_until = Some(Instant::now() + failover_timeout);
            HealthTransition::Quarantined
        } else if core.state != HealthState::Unhealthy {
            core.state = HealthState::Unhealthy;
            HealthTransition::BecameUnhealthy
        } else {
            HealthTransition::None
        }
    }

    /// Record a traffic outcome reported by the caller.
    ///
    /// Successes update the response-time EWMA
    /// (`alpha * sample + (1 - alpha) * ewma`) and clear the failure
    /// streak. Failures feed the same counter the prober uses, so live
    /// traffic can quarantine a backend faster than the probe cadence.
    pub fn record_outcome(
        &self,
        response_time: Option<Duration>,
        success: bool,
        ewma_alpha: f64,
        max_failures: u32,
        failover_timeout: Duration,
    ) -> HealthTransition {
        if success {
            self.outcome_successes.fetch_add(1, Ordering::Relaxed);
            if let Some(rt) = response_time {
                let sample = rt.as_secs_f64() * 1000.0;
                let mut load = self.load.write().expect("load lock poisoned");
                load.response_time_ewma = if load.response_time_ewma == 0.0 {
                    sample
                } else {
                    ewma_alpha * sample + (1.0 - ewma_alpha) * load.response_time_ewma
                };
            }
            self.refresh_error_rate();

            let mut core = self.health.lock().expect("health lock poisoned");
            core.last_response = Some(Utc::now());
            // A served request interrupts the failure streak without
            // granting probe-grade recovery credit.
            core.consecutive_failures = 0;
            HealthTransition::None
        } else {
            self.outcome_failures.fetch_add(1, Ordering::Relaxed);
            self.refresh_error_rate();
            self.record_probe_failure(max_failures, failover_timeout)
        }
    }

    fn refresh_error_rate(&self) {
        let failures = self.outcome_failures.load(Ordering::Relaxed);
        let total = failures + self.outcome_successes.load(Ordering::Relaxed);
        if total > 0 {
            let mut load = self.load.write().expect("load lock poisoned");
            load.error_rate = failures as f64 / total as f64;
        }
    }

    /// Apply a partial load/capacity update from the metrics pipeline.
    pub fn update_load(&self, update: &LoadUpdate) {
        let mut load = self.load.write().expect("load lock poisoned");
        if let Some(v) = update.cpu_usage {
            load.cpu_usage = v.clamp(0.0, 100.0);
        }
        if let Some(v) = update.memory_usage {
            load.memory_usage = v.clamp(0.0, 100.0);
        }
        if let Some(v) = update.network_usage {
            load.network_usage = v.max(0.0);
        }
        if let Some(v) = update.throughput {
            load.throughput = v.max(0.0);
        }
        if let Some(v) = update.error_rate {
            load.error_rate = v.clamp(0.0, 1.0);
        }
        if let Some(v) = update.weight {
            load.base_weight = v.max(0.0);
            // Weighted strategies select on computed_weight; track the
            // new base until the next adaptive pass re-derives it.
            load.computed_weight = load.base_weight;
        }
        drop(load);
        if let Some(v) = update.max_connections {
            self.max_connections.store(v, Ordering::Relaxed);
        }
    }

    /// Recompute the adaptive weight from the current load signals.
    ///
    /// `computed = base * (1 - L)` with
    /// `L = w_cpu*cpu + w_mem*mem + w_rt*rt_norm + w_err*err`,
    /// clamped to `min_weight` so no healthy backend is fully excluded.
    pub fn recompute_weight(&self, adaptive: &AdaptiveConfig) {
        let mut load = self.load.write().expect("load lock poisoned");
        let rt_norm = (load.response_time_ewma / adaptive.response_time_threshold_ms).min(1.0);
        let score = adaptive.w_cpu * (load.cpu_usage / 100.0)
            + adaptive.w_memory * (load.memory_usage / 100.0)
            + adaptive.w_response_time * rt_norm
            + adaptive.w_error_rate * load.error_rate;
        load.computed_weight = (load.base_weight * (1.0 - score.min(1.0))).max(adaptive.min_weight);
    }

    /// Set the derived priority rank (1 = most preferred).
    pub fn set_priority(&self, priority: u32) {
        self.load.write().expect("load lock poisoned").priority = priority;
    }

    /// Record a routed connection.
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.requests_routed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished connection. Saturates at zero.
    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                n.checked_sub(1)
            });
    }

    /// Current active connection count.
    #[must_use]
    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Take an immutable snapshot for strategy evaluation or export.
    #[must_use]
    pub fn snapshot(&self) -> BackendSnapshot {
        let available = self.is_available();
        let (state, last_health_check, last_response) = {
            let core = self.health.lock().expect("health lock poisoned");
            (core.state, core.last_health_check, core.last_response)
        };
        let load = self.load.read().expect("load lock poisoned");
        BackendSnapshot {
            id: self.id.clone(),
            address: self.address.clone(),
            port: self.port,
            enabled: self.enabled(),
            state,
            available,
            active_connections: self.active_connections(),
            max_connections: self.max_connections.load(Ordering::Relaxed),
            weight: load.base_weight,
            computed_weight: load.computed_weight,
            priority: load.priority,
            cpu_usage: load.cpu_usage,
            memory_usage: load.memory_usage,
            error_rate: load.error_rate,
            response_time_ewma: load.response_time_ewma,
            requests_routed: self.requests_routed.load(Ordering::Relaxed),
            last_health_check,
            last_response,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(id: &str) -> BackendConfig {
        BackendConfig {
            id: id.to_string(),
            address: "10.0.0.1".to_string(),
            port: 8000,
            weight: 1.0,
            max_connections: 1000,
            enabled: true,
        }
    }

    #[test]
    fn test_new_backend_is_available() {
        let backend = BackendServer::new(&test_config("s1"));
        assert_eq!(backend.health_state(), HealthState::Unknown);
        assert!(backend.is_available());
        assert_eq!(backend.active_connections(), 0);
    }

    #[test]
    fn test_disabled_backend_is_unavailable() {
        let backend = BackendServer::new(&test_config("s1"));
        backend.set_enabled(false);
        assert!(!backend.is_available());

        backend.set_enabled(true);
        assert!(backend.is_available());
    }

    #[test]
    fn test_first_probe_success_marks_healthy() {
        let backend = BackendServer::new(&test_config("s1"));
        backend.record_probe_success(2);
        assert_eq!(backend.health_state(), HealthState::Healthy);
    }

    #[test]
    fn test_failure_marks_unhealthy_then_quarantines() {
        let backend = BackendServer::new(&test_config("s1"));
        backend.record_probe_success(2);

        let t = backend.record_probe_failure(3, Duration::from_secs(60));
        assert_eq!(t, HealthTransition::BecameUnhealthy);
        assert!(!backend.is_available());

        assert_eq!(
            backend.record_probe_failure(3, Duration::from_secs(60)),
            HealthTransition::None
        );
        assert_eq!(
            backend.record_probe_failure(3, Duration::from_secs(60)),
            HealthTransition::Quarantined
        );
        assert_eq!(backend.health_state(), HealthState::Quarantined);
    }

    #[test]
    fn test_recovery_requires_two_successes() {
        let backend = BackendServer::new(&test_config("s1"));
        backend.record_probe_success(2);
        for _ in 0..2 {
            backend.record_probe_failure(5, Duration::from_secs(60));
        }
        assert_eq!(backend.health_state(), HealthState::Unhealthy);

        // One success is not enough
        assert_eq!(backend.record_probe_success(2), HealthTransition::None);
        assert_eq!(backend.health_state(), HealthState::Unhealthy);
        assert!(!backend.is_available());

        assert_eq!(backend.record_probe_success(2), HealthTransition::Recovered);
        assert_eq!(backend.health_state(), HealthState::Healthy);
        assert!(backend.is_available());
    }

    #[test]
    fn test_quarantine_expires_to_unknown_without_availability() {
        let backend = BackendServer::new(&test_config("s1"));
        for _ in 0..3 {
            backend.record_probe_failure(3, Duration::from_millis(1));
        }
        assert_eq!(backend.health_state(), HealthState::Quarantined);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(backend.health_state(), HealthState::Unknown);
        // Post-quarantine Unknown stays out of the pool until probed
        assert!(!backend.is_available());

        backend.record_probe_success(2);
        assert!(!backend.is_available());
        backend.record_probe_success(2);
        assert!(backend.is_available());
    }

    #[test]
    fn test_outcome_failures_quarantine_immediately() {
        let backend = BackendServer::new(&test_config("s1"));
        backend.record_probe_success(2);

        for _ in 0..2 {
            backend.record_outcome(None, false, 0.2, 3, Duration::from_secs(60));
        }
        let t = backend.record_outcome(None, false, 0.2, 3, Duration::from_secs(60));
        assert_eq!(t, HealthTransition::Quarantined);
        assert!(!backend.is_available());
    }

    #[test]
    fn test_outcome_success_updates_ewma() {
        let backend = BackendServer::new(&test_config("s1"));

        backend.record_outcome(
            Some(Duration::from_millis(100)),
            true,
            0.2,
            3,
            Duration::from_secs(60),
        );
        assert_eq!(backend.snapshot().response_time_ewma, 100.0);

        backend.record_outcome(
            Some(Duration::from_millis(200)),
            true,
            0.2,
            3,
            Duration::from_secs(60),
        );
        // 0.2 * 200 + 0.8 * 100
        let ewma = backend.snapshot().response_time_ewma;
        assert!((ewma - 120.0).abs() < 1e-9, "ewma: {ewma}");
    }

    #[test]
    fn test_outcome_success_clears_failure_streak() {
        let backend = BackendServer::new(&test_config("s1"));
        backend.record_probe_success(2);

        backend.record_outcome(None, false, 0.2, 3, Duration::from_secs(60));
        backend.record_outcome(None, false, 0.2, 3, Duration::from_secs(60));
        backend.record_outcome(Some(Duration::from_millis(10)), true, 0.2, 3, Duration::from_secs(60));

        // The streak restarted; two more failures do not quarantine
        backend.record_outcome(None, false, 0.2, 3, Duration::from_secs(60));
        let t = backend.record_outcome(None, false, 0.2, 3, Duration::from_secs(60));
        assert_ne!(t, HealthTransition::Quarantined);
    }

    #[test]
    fn test_connection_counters_saturate() {
        let backend = BackendServer::new(&test_config("s1"));
        backend.connection_closed();
        assert_eq!(backend.active_connections(), 0);

        backend.connection_opened();
        backend.connection_opened();
        assert_eq!(backend.active_connections(), 2);
        assert_eq!(backend.snapshot().requests_routed, 2);

        backend.connection_closed();
        assert_eq!(backend.active_connections(), 1);
    }

    #[test]
    fn test_update_load_clamps() {
        let backend = BackendServer::new(&test_config("s1"));
        backend.update_load(&LoadUpdate {
            cpu_usage: Some(150.0),
            error_rate: Some(2.0),
            weight: Some(-1.0),
            ..LoadUpdate::default()
        });

        let snap = backend.snapshot();
        assert_eq!(snap.cpu_usage, 100.0);
        assert_eq!(snap.error_rate, 1.0);
        assert_eq!(snap.weight, 0.0);
    }

    #[test]
    fn test_recompute_weight() {
        let backend = BackendServer::new(&test_config("s1"));
        let adaptive = AdaptiveConfig::default();

        // Idle backend keeps its base weight
        backend.recompute_weight(&adaptive);
        assert_eq!(backend.snapshot().computed_weight, 1.0);

        backend.update_load(&LoadUpdate {
            cpu_usage: Some(80.0),
            memory_usage: Some(40.0),
            ..LoadUpdate::default()
        });
        backend.recompute_weight(&adaptive);
        // L = 0.25*0.8 + 0.25*0.4 = 0.3
        let w = backend.snapshot().computed_weight;
        assert!((w - 0.7).abs() < 1e-9, "weight: {w}");
    }

    #[test]
    fn test_recompute_weight_clamps_at_min() {
        let backend = BackendServer::new(&test_config("s1"));
        let adaptive = AdaptiveConfig::default();

        backend.update_load(&LoadUpdate {
            cpu_usage: Some(100.0),
            memory_usage: Some(100.0),
            error_rate: Some(1.0),
            ..LoadUpdate::default()
        });
        backend.update_load(&LoadUpdate {
            throughput: Some(0.0),
            ..LoadUpdate::default()
        });
        backend.recompute_weight(&adaptive);
        assert!(backend.snapshot().computed_weight >= adaptive.min_weight);
    }
}
