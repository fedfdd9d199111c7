//! A single named balancer instance.
//!
//! Ties the registry, strategy, sticky table, health monitor, and
//! statistics together behind the per-connection operations the engine
//! exposes. Selection is synchronous; only probing is async.

use crate::backend::{BackendServer, HealthTransition, LoadUpdate};
use crate::config::{BackendConfig, BalancerConfig, StrategyKind};
use crate::error::{BalancerError, BalancerResult};
use crate::events::{BalancerEvent, EventBus};
use crate::health::{HealthMonitor, ProbeSummary, Prober};
use crate::registry::ServerRegistry;
use crate::stats::{BalancerStats, StatsSnapshot};
use crate::sticky::StickySessionTable;
use crate::strategy::{Choice, SelectionDecision, Strategy};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Decision reason used for sticky-session hits.
const STICKY_REASON: &str = "sticky-session";

/// One named balancer with its own backend pool and strategy state.
#[derive(Debug)]
pub struct BalancerInstance {
    name: String,
    config: BalancerConfig,
    registry: ServerRegistry,
    strategy: Mutex<Strategy>,
    sticky: StickySessionTable,
    stats: BalancerStats,
    monitor: HealthMonitor,
    events: Arc<EventBus>,
    draining: AtomicBool,
}

impl BalancerInstance {
    /// Create an instance with the default TCP prober.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the configuration fails validation.
    pub fn new(
        name: impl Into<String>,
        config: BalancerConfig,
        events: Arc<EventBus>,
    ) -> BalancerResult<Self> {
        let name = name.into();
        config.validate().map_err(BalancerError::ConfigError)?;
        let monitor = HealthMonitor::new(name.as_str(), &config, Arc::clone(&events));
        Ok(Self::assemble(name, config, events, monitor))
    }

    /// Create an instance with a custom prober.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the configuration fails validation.
    pub fn with_prober(
        name: impl Into<String>,
        config: BalancerConfig,
        events: Arc<EventBus>,
        prober: Arc<dyn Prober>,
    ) -> BalancerResult<Self> {
        let name = name.into();
        config.validate().map_err(BalancerError::ConfigError)?;
        let monitor =
            HealthMonitor::with_prober(name.as_str(), &config, Arc::clone(&events), prober);
        Ok(Self::assemble(name, config, events, monitor))
    }

    fn assemble(
        name: String,
        config: BalancerConfig,
        events: Arc<EventBus>,
        monitor: HealthMonitor,
    ) -> Self {
        Self {
            registry: ServerRegistry::new(name.clone()),
            strategy: Mutex::new(Strategy::new(config.strategy)),
            sticky: StickySessionTable::new(),
            stats: BalancerStats::new(),
            monitor,
            events,
            draining: AtomicBool::new(false),
            name,
            config,
        }
    }

    /// Balancer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instance configuration.
    #[must_use]
    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Currently active strategy kind.
    #[must_use]
    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.lock().expect("strategy lock poisoned").kind()
    }

    /// Switch the selection strategy, discarding the old strategy state.
    pub fn set_strategy(&self, kind: StrategyKind) {
        let mut strategy = self.strategy.lock().expect("strategy lock poisoned");
        info!(
            balancer = %self.name,
            from = strategy.kind().name(),
            to = kind.name(),
            "Switching strategy"
        );
        *strategy = Strategy::new(kind);
    }

    /// Add a backend server.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateId` when the id is already registered.
    pub fn add_server(&self, config: &BackendConfig) -> BalancerResult<()> {
        self.registry.add(config)?;
        info!(balancer = %self.name, server = %config.id, "Server added");
        self.events.publish(BalancerEvent::ServerAdded {
            balancer: self.name.clone(),
            server: config.id.clone(),
        });
        Ok(())
    }

    /// Remove a backend server and drop its sticky bindings.
    ///
    /// # Errors
    ///
    /// Returns `BackendNotFound` when the id is absent.
    pub fn remove_server(&self, id: &str) -> BalancerResult<()> {
        self.registry.remove(id)?;
        self.sticky.invalidate_backend(id);
        info!(balancer = %self.name, server = id, "Server removed");
        self.events.publish(BalancerEvent::ServerRemoved {
            balancer: self.name.clone(),
            server: id.to_string(),
        });
        Ok(())
    }

    /// Enable or disable a backend.
    ///
    /// Disabling also drops the backend's sticky bindings so bound
    /// clients re-select immediately.
    ///
    /// # Errors
    ///
    /// Returns `BackendNotFound` when the id is absent.
    pub fn set_server_enabled(&self, id: &str, enabled: bool) -> BalancerResult<()> {
        self.registry.set_enabled(id, enabled)?;
        if !enabled {
            self.sticky.invalidate_backend(id);
        }
        self.events.publish(BalancerEvent::ServerEnabledChanged {
            balancer: self.name.clone(),
            server: id.to_string(),
            enabled,
        });
        Ok(())
    }

    /// Apply a partial load update to a backend.
    ///
    /// # Errors
    ///
    /// Returns `BackendNotFound` when the id is absent.
    pub fn update_server_load(&self, id: &str, update: &LoadUpdate) -> BalancerResult<()> {
        self.registry.update(id, update)
    }

    /// Select a backend for a new connection.
    ///
    /// A sticky binding wins when it points at an available backend with
    /// spare capacity; otherwise the binding is dropped and the strategy
    /// selects fresh. The chosen backend's connection count rises here;
    /// the caller pairs it with [`report_outcome`](Self::report_outcome).
    ///
    /// # Errors
    ///
    /// Returns `Draining` while the instance is shutting down and
    /// `NoAvailableBackends` when no backend can take the connection.
    pub fn select(&self, client_id: Option<&str>) -> BalancerResult<SelectionDecision> {
        if self.draining.load(Ordering::Relaxed) {
            self.stats.record_selection(false);
            return Err(BalancerError::Draining(self.name.clone()));
        }

        let sticky_on = self.config.sticky.enabled;
        if sticky_on {
            if let Some(client) = client_id {
                if let Some(bound) = self.sticky.lookup(client, self.config.sticky.ttl) {
                    if let Some(server) = self.registry.get(&bound) {
                        let snap = server.snapshot();
                        if snap.available && snap.has_capacity() {
                            return Ok(self.finish_selection(
                                &server,
                                Choice {
                                    id: bound,
                                    confidence: 1.0,
                                },
                                STICKY_REASON,
                                Vec::new(),
                            ));
                        }
                    }
                    // Bound backend gone or unusable: re-select fresh
                    self.sticky.remove(client);
                }
            }
        }

        let candidates = self.registry.available_snapshot();
        let picked = {
            let mut strategy = self.strategy.lock().expect("strategy lock poisoned");
            strategy.select(&self.name, &candidates, client_id)
        };
        let choice = match picked {
            Ok(choice) => choice,
            Err(e) => {
                self.stats.record_selection(false);
                return Err(e);
            },
        };

        // The registry handle can only be gone if the backend was
        // removed between the snapshot and here; report the pool empty
        // rather than routing to a ghost.
        let Some(server) = self.registry.get(&choice.id) else {
            self.stats.record_selection(false);
            return Err(BalancerError::NoAvailableBackends(self.name.clone()));
        };

        if sticky_on {
            if let Some(client) = client_id {
                self.sticky.bind(client, &choice.id, self.config.sticky.ttl);
            }
        }

        let reason = self.strategy_kind().name();
        let alternatives = candidates
            .iter()
            .map(|c| c.id.clone())
            .filter(|id| *id != choice.id)
            .collect();
        Ok(self.finish_selection(&server, choice, reason, alternatives))
    }

    fn finish_selection(
        &self,
        server: &Arc<BackendServer>,
        choice: Choice,
        reason: &'static str,
        alternatives: Vec<String>,
    ) -> SelectionDecision {
        server.connection_opened();
        self.stats.record_selection(true);
        debug!(
            balancer = %self.name,
            server = %choice.id,
            reason,
            "Server selected"
        );
        self.events.publish(BalancerEvent::ServerSelected {
            balancer: self.name.clone(),
            server: choice.id.clone(),
        });
        SelectionDecision {
            server_id: choice.id,
            reason,
            confidence: choice.confidence,
            alternatives,
            timestamp: Utc::now(),
        }
    }

    /// Report the outcome of a previously selected connection.
    ///
    /// Closes the connection slot, feeds the response time into the
    /// backend's EWMA, and lets repeated failures quarantine the backend
    /// faster than the probe cadence.
    ///
    /// # Errors
    ///
    /// Returns `BackendNotFound` when the id is absent.
    pub fn report_outcome(
        &self,
        id: &str,
        success: bool,
        response_time: Option<Duration>,
    ) -> BalancerResult<()> {
        let server = self.registry.get(id).ok_or_else(|| {
            BalancerError::BackendNotFound(id.to_string(), self.name.clone())
        })?;

        server.connection_closed();
        self.stats.record_outcome(success, response_time);
        let transition = server.record_outcome(
            response_time,
            success,
            self.config.ewma_alpha,
            self.config.max_failures,
            self.config.failover_timeout,
        );
        match transition {
            HealthTransition::Quarantined => {
                info!(balancer = %self.name, server = id, "Server quarantined by traffic failures");
                self.sticky.invalidate_backend(id);
                self.events.publish(BalancerEvent::ServerFailed {
                    balancer: self.name.clone(),
                    server: id.to_string(),
                });
            },
            HealthTransition::BecameUnhealthy => {
                self.sticky.invalidate_backend(id);
            },
            HealthTransition::Recovered | HealthTransition::None => {},
        }
        Ok(())
    }

    /// Report a failure for a backend without a paired selection.
    ///
    /// # Errors
    ///
    /// Returns `BackendNotFound` when the id is absent.
    pub fn report_failure(&self, id: &str) -> BalancerResult<()> {
        let server = self.registry.get(id).ok_or_else(|| {
            BalancerError::BackendNotFound(id.to_string(), self.name.clone())
        })?;

        let transition =
            server.record_probe_failure(self.config.max_failures, self.config.failover_timeout);
        if transition == HealthTransition::Quarantined {
            self.sticky.invalidate_backend(id);
            self.events.publish(BalancerEvent::ServerFailed {
                balancer: self.name.clone(),
                server: id.to_string(),
            });
        }
        Ok(())
    }

    /// Run one probe cycle over the pool.
    pub async fn run_probe_cycle(&self) -> ProbeSummary {
        let summary = self.monitor.probe_all(&self.registry).await;
        self.stats.mark_health_check();
        summary
    }

    /// Probe a single backend outside the periodic cycle.
    pub async fn probe_server(&self, id: &str) -> bool {
        let result = self.monitor.probe_one(&self.registry, id).await;
        self.stats.mark_health_check();
        result
    }

    /// Recompute adaptive weights and refresh priority ranks.
    ///
    /// Runs as one batched pass so every backend's weight reflects the
    /// same point in time; strategies keep reading the previous weights
    /// until the pass lands.
    pub fn refresh_weights(&self) {
        let servers = self.registry.servers();
        for server in &servers {
            server.recompute_weight(&self.config.adaptive);
        }

        // Rank 1 = highest computed weight.
        let mut ranked: Vec<_> = servers
            .iter()
            .map(|s| (s.snapshot().computed_weight, Arc::clone(s)))
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
        for (rank, (_, server)) in ranked.iter().enumerate() {
            server.set_priority(rank as u32 + 1);
        }
    }

    /// Remove expired sticky bindings.
    pub fn sweep_sticky(&self) {
        self.sticky.sweep();
    }

    /// Number of live sticky bindings.
    #[must_use]
    pub fn sticky_bindings(&self) -> usize {
        self.sticky.len()
    }

    /// Enter drain mode: selections fail, bookkeeping keeps working.
    pub fn drain(&self) {
        self.draining.store(true, Ordering::Relaxed);
        info!(balancer = %self.name, "Draining");
    }

    /// Whether the instance is draining.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    /// Total active connections across the pool.
    #[must_use]
    pub fn inflight_connections(&self) -> u64 {
        self.registry
            .servers()
            .iter()
            .map(|s| u64::from(s.active_connections()))
            .sum()
    }

    /// Whether at least one backend is available.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.registry.available_count() > 0
    }

    /// Count of backends available for selection.
    #[must_use]
    pub fn active_servers(&self) -> usize {
        self.registry.available_count()
    }

    /// Total registered backends.
    #[must_use]
    pub fn total_servers(&self) -> usize {
        self.registry.len()
    }

    /// Pool utilization as a percentage of total connection capacity.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        let snaps = self.registry.snapshot();
        let capacity: u64 = snaps.iter().map(|s| u64::from(s.max_connections)).sum();
        if capacity == 0 {
            return 0.0;
        }
        let active: u64 = snaps.iter().map(|s| u64::from(s.active_connections)).sum();
        active as f64 / capacity as f64 * 100.0
    }

    /// Backend registry, for read-side callers.
    #[must_use]
    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Exportable statistics snapshot.
    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(
            &self.name,
            self.strategy_kind().name(),
            &self.registry.snapshot(),
        )
    }

    /// Reset the statistics counters.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }
}
