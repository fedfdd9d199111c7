//! Balancer configuration types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one balancer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Selection strategy.
    pub strategy: StrategyKind,

    /// Health check settings.
    pub health_check: HealthCheckConfig,

    /// Consecutive failures (probes or reported outcomes) before quarantine.
    pub max_failures: u32,

    /// How long a quarantined backend stays out of the pool before the
    /// next probe re-evaluates it from scratch.
    #[serde(with = "humantime_serde")]
    pub failover_timeout: Duration,

    /// Sticky session settings.
    pub sticky: StickyConfig,

    /// Adaptive weighting settings.
    pub adaptive: AdaptiveConfig,

    /// Smoothing factor for the response-time EWMA.
    pub ewma_alpha: f64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            health_check: HealthCheckConfig::default(),
            max_failures: 3,
            failover_timeout: Duration::from_secs(60),
            sticky: StickyConfig::default(),
            adaptive: AdaptiveConfig::default(),
            ewma_alpha: 0.2,
        }
    }
}

impl BalancerConfig {
    /// Validate field ranges.
    ///
    /// # Errors
    ///
    /// Returns a message naming the offending field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_failures == 0 {
            return Err("max_failures must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.ewma_alpha) {
            return Err("ewma_alpha must be within [0, 1]".to_string());
        }
        self.adaptive.validate()
    }
}

/// Configuration for a single backend server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique backend id within a balancer instance.
    pub id: String,

    /// Backend host address.
    pub address: String,

    /// Backend port.
    pub port: u16,

    /// Administrator-assigned weight for weighted strategies.
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Maximum concurrent connections to this backend.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Whether this backend is initially enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl BackendConfig {
    /// Get the `host:port` endpoint string for probing.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Selection strategy kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Round-robin rotation over the available set.
    #[default]
    RoundRobin,
    /// Fewest active connections.
    LeastConnections,
    /// Smooth weighted round-robin over computed weights.
    WeightedRoundRobin,
    /// Deterministic hash of the client identifier.
    IpHash,
    /// Lowest response-time EWMA.
    LeastResponseTime,
    /// Load-score driven weighted selection.
    Adaptive,
}

impl StrategyKind {
    /// Strategy name as used in decision reasons and logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::LeastConnections => "least-connections",
            Self::WeightedRoundRobin => "weighted-round-robin",
            Self::IpHash => "ip-hash",
            Self::LeastResponseTime => "least-response-time",
            Self::Adaptive => "adaptive",
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable periodic health probes.
    pub enabled: bool,

    /// Interval between probe cycles.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Per-probe timeout. A probe that exceeds it counts as a failure.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Consecutive successful probes required to leave the unhealthy state.
    pub healthy_threshold: u32,

    /// Upper bound on concurrent probes within one cycle.
    pub probe_concurrency: usize,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            healthy_threshold: 2,
            probe_concurrency: 32,
        }
    }
}

/// Sticky session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StickyConfig {
    /// Enable client-to-backend binding.
    pub enabled: bool,

    /// Binding lifetime, refreshed on reuse.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Interval for the periodic expired-entry sweep.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for StickyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Adaptive weighting configuration.
///
/// The load score is `w_cpu·cpu + w_memory·mem + w_response_time·rt_norm
/// + w_error_rate·err`, with cpu/mem normalized from percentages and the
/// response time normalized against `response_time_threshold`. The exact
/// blend is configuration, not a compatibility constant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Enable periodic weight recomputation.
    pub enabled: bool,

    /// Interval between batched weight recomputations.
    #[serde(with = "humantime_serde")]
    pub recompute_interval: Duration,

    /// CPU usage coefficient.
    pub w_cpu: f64,

    /// Memory usage coefficient.
    pub w_memory: f64,

    /// Response-time coefficient.
    pub w_response_time: f64,

    /// Error-rate coefficient.
    pub w_error_rate: f64,

    /// Response time considered fully loaded, for normalization.
    pub response_time_threshold_ms: f64,

    /// Lower clamp so no healthy backend is fully excluded.
    pub min_weight: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            recompute_interval: Duration::from_secs(5),
            w_cpu: 0.25,
            w_memory: 0.25,
            w_response_time: 0.25,
            w_error_rate: 0.25,
            response_time_threshold_ms: 1000.0,
            min_weight: 0.01,
        }
    }
}

impl AdaptiveConfig {
    /// Validate coefficient ranges.
    ///
    /// # Errors
    ///
    /// Returns a message naming the offending field.
    pub fn validate(&self) -> Result<(), String> {
        for (name, w) in [
            ("w_cpu", self.w_cpu),
            ("w_memory", self.w_memory),
            ("w_response_time", self.w_response_time),
            ("w_error_rate", self.w_error_rate),
        ] {
            if w < 0.0 {
                return Err(format!("{name} must be non-negative"));
            }
        }
        if self.min_weight <= 0.0 {
            return Err("min_weight must be positive".to_string());
        }
        if self.response_time_threshold_ms <= 0.0 {
            return Err("response_time_threshold_ms must be positive".to_string());
        }
        Ok(())
    }
}

fn default_weight() -> f64 {
    1.0
}

fn default_max_connections() -> u32 {
    1000
}

fn default_enabled() -> bool {
    true
}
