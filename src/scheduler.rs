//! Background maintenance task for a balancer instance.
//!
//! One task per instance drives the probe cycle, the adaptive weight
//! pass, and the sticky-table sweep. The engine stops it before the
//! instance is dropped, so a cycle never runs against a destroyed
//! balancer.

use crate::instance::BalancerInstance;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Handle to a running maintenance task.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Spawn the maintenance task for an instance.
    #[must_use]
    pub fn spawn(instance: Arc<BalancerInstance>) -> Self {
        let (shutdown, rx) = mpsc::channel(1);
        let task = tokio::spawn(run(instance, rx));
        Self { shutdown, task }
    }

    /// Stop the task and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(()).await;
        let _ = self.task.await;
    }
}

async fn run(instance: Arc<BalancerInstance>, mut shutdown: mpsc::Receiver<()>) {
    let config = instance.config().clone();
    debug!(balancer = instance.name(), "Maintenance task started");

    let mut probe = tokio::time::interval(config.health_check.interval);
    let mut adaptive = tokio::time::interval(config.adaptive.recompute_interval);
    let mut sweep = tokio::time::interval(config.sticky.sweep_interval);
    // The first tick of an interval fires immediately; consume it so
    // every cycle starts one full period after spawn.
    probe.tick().await;
    adaptive.tick().await;
    sweep.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(balancer = instance.name(), "Maintenance task shutting down");
                break;
            }
            _ = probe.tick(), if config.health_check.enabled => {
                instance.run_probe_cycle().await;
            }
            _ = adaptive.tick(), if config.adaptive.enabled => {
                instance.refresh_weights();
            }
            _ = sweep.tick(), if config.sticky.enabled => {
                instance.sweep_sticky();
            }
        }
    }
}
