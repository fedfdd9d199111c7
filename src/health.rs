//! Health probing for backend servers.
//!
//! The monitor runs probe cycles against a registry, feeds results into
//! each backend's health state machine, and publishes the resulting
//! transitions. Probes within a cycle run concurrently up to the
//! configured cap.

use crate::backend::HealthTransition;
use crate::config::{BalancerConfig, HealthCheckConfig};
use crate::events::{BalancerEvent, EventBus};
use crate::registry::ServerRegistry;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Boxed probe future returned by a [`Prober`].
pub type ProbeFuture = Pin<Box<dyn Future<Output = Result<Duration, String>> + Send>>;

/// A single-backend health probe.
///
/// The default implementation opens a TCP connection; alternative
/// probers (application-level checks, test fakes) plug in here.
pub trait Prober: Send + Sync + std::fmt::Debug {
    /// Probe the `host:port` endpoint, returning the round-trip time on
    /// success and a reason string on failure.
    fn probe(&self, endpoint: String, timeout: Duration) -> ProbeFuture;
}

/// TCP-connect prober. A completed handshake within the timeout counts
/// as healthy; refusal, unreachability, and timeout all count as failed.
#[derive(Debug, Default)]
pub struct TcpProber;

impl Prober for TcpProber {
    fn probe(&self, endpoint: String, limit: Duration) -> ProbeFuture {
        Box::pin(async move {
            let start = Instant::now();
            match timeout(limit, TcpStream::connect(&endpoint)).await {
                Ok(Ok(_)) => Ok(start.elapsed()),
                Ok(Err(e)) => Err(format!("connection failed: {e}")),
                Err(_) => Err("connection timeout".to_string()),
            }
        })
    }
}

/// Outcome of one probe cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    /// Backends probed this cycle.
    pub probed: usize,
    /// Probes that passed.
    pub passed: usize,
    /// Backends skipped (disabled or inside a quarantine window).
    pub skipped: usize,
}

/// Drives probe cycles for one balancer instance.
#[derive(Debug)]
pub struct HealthMonitor {
    balancer: String,
    config: HealthCheckConfig,
    max_failures: u32,
    failover_timeout: Duration,
    prober: Arc<dyn Prober>,
    events: Arc<EventBus>,
}

impl HealthMonitor {
    /// Create a monitor with the default TCP prober.
    #[must_use]
    pub fn new(balancer: impl Into<String>, config: &BalancerConfig, events: Arc<EventBus>) -> Self {
        Self::with_prober(balancer, config, events, Arc::new(TcpProber))
    }

    /// Create a monitor with a custom prober.
    #[must_use]
    pub fn with_prober(
        balancer: impl Into<String>,
        config: &BalancerConfig,
        events: Arc<EventBus>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            balancer: balancer.into(),
            config: config.health_check.clone(),
            max_failures: config.max_failures,
            failover_timeout: config.failover_timeout,
            prober,
            events,
        }
    }

    /// Whether periodic probing is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Interval between probe cycles.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// Probe every eligible backend in the registry once.
    ///
    /// Disabled backends and backends inside an active quarantine window
    /// are skipped; the quarantine expires on its own clock, not on
    /// probe traffic. Results for backends removed mid-cycle are dropped.
    pub async fn probe_all(&self, registry: &ServerRegistry) -> ProbeSummary {
        let servers = registry.servers();
        let mut summary = ProbeSummary::default();

        let semaphore = Arc::new(Semaphore::new(self.config.probe_concurrency.max(1)));
        let mut probes = JoinSet::new();

        for server in servers {
            if !server.enabled() || server.in_quarantine() {
                summary.skipped += 1;
                continue;
            }
            summary.probed += 1;

            let semaphore = Arc::clone(&semaphore);
            let prober = Arc::clone(&self.prober);
            let limit = self.config.timeout;
            probes.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("probe semaphore closed");
                let result = prober.probe(server.endpoint(), limit).await;
                (server, result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let Ok((server, result)) = joined else {
                continue;
            };
            // The task holds its own handle; drop results for backends
            // removed (or replaced under a reused id) while the probe
            // ran, so a stale result never touches the fresh record or
            // publishes events attributed to it.
            match registry.get(server.id()) {
                Some(current) if Arc::ptr_eq(&current, &server) => {},
                _ => continue,
            }

            match result {
                Ok(rtt) => {
                    summary.passed += 1;
                    debug!(
                        balancer = %self.balancer,
                        server = server.id(),
                        rtt_ms = rtt.as_millis(),
                        "Probe passed"
                    );
                    self.publish_transition(
                        server.id(),
                        server.record_probe_success(self.config.healthy_threshold),
                    );
                },
                Err(reason) => {
                    warn!(
                        balancer = %self.balancer,
                        server = server.id(),
                        reason = %reason,
                        "Probe failed"
                    );
                    self.events.publish(BalancerEvent::HealthCheckFailed {
                        balancer: self.balancer.clone(),
                        server: server.id().to_string(),
                    });
                    self.publish_transition(
                        server.id(),
                        server.record_probe_failure(self.max_failures, self.failover_timeout),
                    );
                },
            }
        }

        debug!(
            balancer = %self.balancer,
            probed = summary.probed,
            passed = summary.passed,
            skipped = summary.skipped,
            "Probe cycle complete"
        );
        summary
    }

    /// Probe a single backend by id, outside the periodic cycle.
    ///
    /// Returns `false` when the backend is unknown, disabled, or
    /// quarantined, or when the probe failed.
    pub async fn probe_one(&self, registry: &ServerRegistry, id: &str) -> bool {
        let Some(server) = registry.get(id) else {
            return false;
        };
        if !server.enabled() || server.in_quarantine() {
            return false;
        }

        let result = self
            .prober
            .probe(server.endpoint(), self.config.timeout)
            .await;
        // Same staleness rule as the cycle: the id must still resolve to
        // this handle once the probe returns.
        match registry.get(id) {
            Some(current) if Arc::ptr_eq(&current, &server) => {},
            _ => return false,
        }
        match result {
            Ok(_) => {
                self.publish_transition(
                    id,
                    server.record_probe_success(self.config.healthy_threshold),
                );
                true
            },
            Err(reason) => {
                warn!(
                    balancer = %self.balancer,
                    server = id,
                    reason = %reason,
                    "Probe failed"
                );
                self.events.publish(BalancerEvent::HealthCheckFailed {
                    balancer: self.balancer.clone(),
                    server: id.to_string(),
                });
                self.publish_transition(
                    id,
                    server.record_probe_failure(self.max_failures, self.failover_timeout),
                );
                false
            },
        }
    }

    fn publish_transition(&self, server: &str, transition: HealthTransition) {
        match transition {
            HealthTransition::Quarantined => {
                self.events.publish(BalancerEvent::ServerFailed {
                    balancer: self.balancer.clone(),
                    server: server.to_string(),
                });
            },
            HealthTransition::Recovered => {
                self.events.publish(BalancerEvent::ServerRecovered {
                    balancer: self.balancer.clone(),
                    server: server.to_string(),
                });
            },
            HealthTransition::BecameUnhealthy | HealthTransition::None => {},
        }
    }
}
