//! The balancer engine: a registry of named balancer instances.
//!
//! The engine owns the instances and their maintenance tasks and is the
//! single entry point for callers. All selection-path methods are
//! synchronous; only probing and lifecycle teardown are async.

use crate::backend::{BackendSnapshot, LoadUpdate};
use crate::config::{BackendConfig, BalancerConfig, StrategyKind};
use crate::error::{BalancerError, BalancerResult};
use crate::events::{BalancerEvent, EventBus};
use crate::health::{ProbeSummary, Prober};
use crate::instance::BalancerInstance;
use crate::scheduler::SchedulerHandle;
use crate::stats::StatsSnapshot;
use crate::strategy::SelectionDecision;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::info;

/// How long `destroy_balancer` waits for in-flight connections.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll cadence while waiting for the pool to quiesce.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct Entry {
    instance: Arc<BalancerInstance>,
    scheduler: SchedulerHandle,
}

/// Engine managing any number of independent balancer instances.
///
/// Balancers are isolated: each has its own backend pool, strategy
/// state, sticky table, and statistics. Events from every instance fan
/// out over one shared bus.
pub struct BalancerEngine {
    events: Arc<EventBus>,
    balancers: RwLock<HashMap<String, Entry>>,
}

impl BalancerEngine {
    /// Create an engine with no balancers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Arc::new(EventBus::new()),
            balancers: RwLock::new(HashMap::new()),
        }
    }

    /// Create a balancer and start its maintenance task.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateId` when the name is taken and `ConfigError`
    /// when the configuration fails validation.
    pub fn create_balancer(&self, name: &str, config: BalancerConfig) -> BalancerResult<()> {
        let instance = BalancerInstance::new(name, config, Arc::clone(&self.events))?;
        self.install(name, instance)
    }

    /// Create a balancer with a custom health prober.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateId` when the name is taken and `ConfigError`
    /// when the configuration fails validation.
    pub fn create_balancer_with_prober(
        &self,
        name: &str,
        config: BalancerConfig,
        prober: Arc<dyn Prober>,
    ) -> BalancerResult<()> {
        let instance =
            BalancerInstance::with_prober(name, config, Arc::clone(&self.events), prober)?;
        self.install(name, instance)
    }

    fn install(&self, name: &str, instance: BalancerInstance) -> BalancerResult<()> {
        let mut balancers = self.balancers.write().expect("engine lock poisoned");
        if balancers.contains_key(name) {
            return Err(BalancerError::DuplicateId(name.to_string()));
        }

        let instance = Arc::new(instance);
        let scheduler = SchedulerHandle::spawn(Arc::clone(&instance));
        balancers.insert(
            name.to_string(),
            Entry {
                instance,
                scheduler,
            },
        );
        info!(balancer = name, "Balancer created");
        Ok(())
    }

    /// Destroy a balancer.
    ///
    /// New selections are rejected immediately (`Draining`), in-flight
    /// connections may still report their outcome, and the instance is
    /// removed once the pool quiesces or the drain deadline passes.
    /// The maintenance task is stopped before the instance drops.
    ///
    /// Destroying a name that does not exist is a no-op, so teardown
    /// paths can call this unconditionally.
    pub async fn destroy_balancer(&self, name: &str) {
        let instance = {
            let balancers = self.balancers.read().expect("engine lock poisoned");
            match balancers.get(name) {
                Some(entry) => Arc::clone(&entry.instance),
                None => return,
            }
        };
        instance.drain();

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while instance.inflight_connections() > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        let abandoned = instance.inflight_connections();
        if abandoned > 0 {
            info!(balancer = name, abandoned, "Drain deadline passed");
        }

        let entry = {
            let mut balancers = self.balancers.write().expect("engine lock poisoned");
            balancers.remove(name)
        };
        // A concurrent destroy may have removed the entry already; the
        // winner stops the scheduler.
        let Some(entry) = entry else {
            return;
        };
        entry.scheduler.stop().await;
        info!(balancer = name, "Balancer destroyed");
    }

    /// Destroy every balancer.
    pub async fn shutdown(&self) {
        let names = self.balancer_names();
        for name in names {
            self.destroy_balancer(&name).await;
        }
    }

    /// Whether a balancer with this name exists.
    #[must_use]
    pub fn balancer_exists(&self, name: &str) -> bool {
        self.balancers
            .read()
            .expect("engine lock poisoned")
            .contains_key(name)
    }

    /// Names of all balancers, sorted.
    #[must_use]
    pub fn balancer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .balancers
            .read()
            .expect("engine lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn instance(&self, name: &str) -> BalancerResult<Arc<BalancerInstance>> {
        self.balancers
            .read()
            .expect("engine lock poisoned")
            .get(name)
            .map(|entry| Arc::clone(&entry.instance))
            .ok_or_else(|| BalancerError::BalancerNotFound(name.to_string()))
    }

    /// Add a backend to a balancer.
    ///
    /// # Errors
    ///
    /// Returns `BalancerNotFound` or `DuplicateId`.
    pub fn add_server(&self, balancer: &str, config: &BackendConfig) -> BalancerResult<()> {
        self.instance(balancer)?.add_server(config)
    }

    /// Remove a backend from a balancer.
    ///
    /// # Errors
    ///
    /// Returns `BalancerNotFound` or `BackendNotFound`.
    pub fn remove_server(&self, balancer: &str, id: &str) -> BalancerResult<()> {
        self.instance(balancer)?.remove_server(id)
    }

    /// Enable or disable a backend.
    ///
    /// # Errors
    ///
    /// Returns `BalancerNotFound` or `BackendNotFound`.
    pub fn set_server_enabled(
        &self,
        balancer: &str,
        id: &str,
        enabled: bool,
    ) -> BalancerResult<()> {
        self.instance(balancer)?.set_server_enabled(id, enabled)
    }

    /// Apply a partial load update to a backend.
    ///
    /// # Errors
    ///
    /// Returns `BalancerNotFound` or `BackendNotFound`.
    pub fn update_server_load(
        &self,
        balancer: &str,
        id: &str,
        update: &LoadUpdate,
    ) -> BalancerResult<()> {
        self.instance(balancer)?.update_server_load(id, update)
    }

    /// Select a backend for a new connection.
    ///
    /// # Errors
    ///
    /// Returns `BalancerNotFound`, `Draining`, or `NoAvailableBackends`.
    pub fn select(
        &self,
        balancer: &str,
        client_id: Option<&str>,
    ) -> BalancerResult<SelectionDecision> {
        self.instance(balancer)?.select(client_id)
    }

    /// Report the outcome of a previously selected connection.
    ///
    /// # Errors
    ///
    /// Returns `BalancerNotFound` or `BackendNotFound`.
    pub fn report_outcome(
        &self,
        balancer: &str,
        id: &str,
        success: bool,
        response_time: Option<Duration>,
    ) -> BalancerResult<()> {
        self.instance(balancer)?
            .report_outcome(id, success, response_time)
    }

    /// Report a backend failure observed outside a selected connection.
    ///
    /// # Errors
    ///
    /// Returns `BalancerNotFound` or `BackendNotFound`.
    pub fn report_failure(&self, balancer: &str, id: &str) -> BalancerResult<()> {
        self.instance(balancer)?.report_failure(id)
    }

    /// Run one probe cycle for a balancer, outside the periodic schedule.
    ///
    /// # Errors
    ///
    /// Returns `BalancerNotFound`.
    pub async fn perform_health_check(&self, balancer: &str) -> BalancerResult<ProbeSummary> {
        let instance = self.instance(balancer)?;
        Ok(instance.run_probe_cycle().await)
    }

    /// Probe a single backend on demand.
    ///
    /// Returns `false` when the backend is disabled, quarantined, or
    /// failed the probe.
    ///
    /// # Errors
    ///
    /// Returns `BalancerNotFound`.
    pub async fn probe_server(&self, balancer: &str, id: &str) -> BalancerResult<bool> {
        let instance = self.instance(balancer)?;
        Ok(instance.probe_server(id).await)
    }

    /// Run one probe cycle for every balancer.
    pub async fn perform_health_check_all(&self) {
        let instances: Vec<Arc<BalancerInstance>> = {
            let balancers = self.balancers.read().expect("engine lock poisoned");
            balancers
                .values()
                .map(|entry| Arc::clone(&entry.instance))
                .collect()
        };
        for instance in instances {
            instance.run_probe_cycle().await;
        }
    }

    /// Snapshots of every backend in a balancer.
    ///
    /// # Errors
    ///
    /// Returns `BalancerNotFound`.
    pub fn get_servers(&self, balancer: &str) -> BalancerResult<Vec<BackendSnapshot>> {
        Ok(self.instance(balancer)?.registry().snapshot())
    }

    /// Statistics snapshot for a balancer.
    ///
    /// # Errors
    ///
    /// Returns `BalancerNotFound`.
    pub fn get_stats(&self, balancer: &str) -> BalancerResult<StatsSnapshot> {
        Ok(self.instance(balancer)?.stats_snapshot())
    }

    /// Reset a balancer's statistics counters.
    ///
    /// # Errors
    ///
    /// Returns `BalancerNotFound`.
    pub fn reset_stats(&self, balancer: &str) -> BalancerResult<()> {
        self.instance(balancer)?.reset_stats();
        Ok(())
    }

    /// Every balancer's statistics as a JSON array of snapshot
    /// documents, sorted by balancer name; each document carries its
    /// name in the `balancer` field.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization fails.
    pub fn all_stats_json(&self) -> serde_json::Result<String> {
        let snapshots: Vec<StatsSnapshot> = {
            let balancers = self.balancers.read().expect("engine lock poisoned");
            let mut entries: Vec<_> = balancers.values().collect();
            entries.sort_by(|a, b| a.instance.name().cmp(b.instance.name()));
            entries
                .iter()
                .map(|entry| entry.instance.stats_snapshot())
                .collect()
        };
        serde_json::to_string_pretty(&snapshots)
    }

    /// Run the adaptive weight pass for a balancer immediately, outside
    /// the periodic schedule.
    ///
    /// # Errors
    ///
    /// Returns `BalancerNotFound`.
    pub fn recompute_weights(&self, balancer: &str) -> BalancerResult<()> {
        self.instance(balancer)?.refresh_weights();
        Ok(())
    }

    /// Switch a balancer's selection strategy.
    ///
    /// # Errors
    ///
    /// Returns `BalancerNotFound`.
    pub fn set_algorithm(&self, balancer: &str, kind: StrategyKind) -> BalancerResult<()> {
        self.instance(balancer)?.set_strategy(kind);
        Ok(())
    }

    /// Count of available backends in a balancer.
    ///
    /// # Errors
    ///
    /// Returns `BalancerNotFound`.
    pub fn active_servers(&self, balancer: &str) -> BalancerResult<usize> {
        Ok(self.instance(balancer)?.active_servers())
    }

    /// Total backends in a balancer.
    ///
    /// # Errors
    ///
    /// Returns `BalancerNotFound`.
    pub fn total_servers(&self, balancer: &str) -> BalancerResult<usize> {
        Ok(self.instance(balancer)?.total_servers())
    }

    /// Pool utilization percentage for a balancer.
    ///
    /// # Errors
    ///
    /// Returns `BalancerNotFound`.
    pub fn utilization(&self, balancer: &str) -> BalancerResult<f64> {
        Ok(self.instance(balancer)?.utilization())
    }

    /// Whether a balancer has at least one available backend.
    ///
    /// # Errors
    ///
    /// Returns `BalancerNotFound`.
    pub fn is_balancer_healthy(&self, balancer: &str) -> BalancerResult<bool> {
        Ok(self.instance(balancer)?.is_healthy())
    }

    /// Subscribe to state-change events from every balancer.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BalancerEvent> {
        self.events.subscribe()
    }
}

impl Default for BalancerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BalancerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.balancer_names();
        f.debug_struct("BalancerEngine")
            .field("balancers", &names)
            .finish()
    }
}
