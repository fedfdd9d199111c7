//! End-to-end tests for the balancer engine public API.

use castgate_balancer::{
    BackendConfig, BalancerConfig, BalancerEngine, BalancerError, HealthState, Prober,
    StickyConfig, StrategyKind,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn backend(id: &str, port: u16, weight: f64) -> BackendConfig {
    BackendConfig {
        id: id.to_string(),
        address: "10.0.0.1".to_string(),
        port,
        weight,
        max_connections: 1000,
        enabled: true,
    }
}

/// Prober answering from a mutable set of healthy endpoints.
#[derive(Debug, Default)]
struct FakeProber {
    healthy: Mutex<std::collections::HashSet<String>>,
}

impl FakeProber {
    fn set_healthy(&self, endpoint: &str, healthy: bool) {
        let mut set = self.healthy.lock().unwrap();
        if healthy {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }
}

impl Prober for FakeProber {
    fn probe(
        &self,
        endpoint: String,
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Duration, String>> + Send>> {
        let healthy = self.healthy.lock().unwrap().contains(&endpoint);
        Box::pin(async move {
            if healthy {
                Ok(Duration::from_millis(3))
            } else {
                Err("probe refused".to_string())
            }
        })
    }
}

#[tokio::test]
async fn weighted_distribution_over_many_selections() {
    let engine = BalancerEngine::new();
    let config = BalancerConfig {
        strategy: StrategyKind::WeightedRoundRobin,
        ..BalancerConfig::default()
    };
    engine.create_balancer("audio", config).unwrap();
    engine.add_server("audio", &backend("s1", 8000, 1.0)).unwrap();
    engine.add_server("audio", &backend("s2", 8001, 2.0)).unwrap();
    engine.add_server("audio", &backend("s3", 8002, 1.0)).unwrap();

    let mut counts: HashMap<String, u32> = HashMap::new();
    for _ in 0..400 {
        let decision = engine.select("audio", None).unwrap();
        engine
            .report_outcome("audio", &decision.server_id, true, None)
            .unwrap();
        *counts.entry(decision.server_id).or_insert(0) += 1;
    }

    assert!((190..=210).contains(&counts["s2"]), "s2: {}", counts["s2"]);
    assert!((95..=105).contains(&counts["s1"]), "s1: {}", counts["s1"]);
    assert!((95..=105).contains(&counts["s3"]), "s3: {}", counts["s3"]);

    engine.shutdown().await;
}

#[tokio::test]
async fn failing_backend_is_excluded_and_recovers() {
    let engine = BalancerEngine::new();
    let prober = Arc::new(FakeProber::default());
    prober.set_healthy("10.0.0.1:8000", true);
    prober.set_healthy("10.0.0.1:8001", true);

    let config = BalancerConfig {
        failover_timeout: Duration::from_millis(20),
        health_check: castgate_balancer::HealthCheckConfig {
            enabled: false,
            ..castgate_balancer::HealthCheckConfig::default()
        },
        ..BalancerConfig::default()
    };
    engine
        .create_balancer_with_prober("audio", config, Arc::clone(&prober) as Arc<dyn Prober>)
        .unwrap();
    engine.add_server("audio", &backend("s1", 8000, 1.0)).unwrap();
    engine.add_server("audio", &backend("s2", 8001, 1.0)).unwrap();
    engine.perform_health_check("audio").await.unwrap();

    // Three consecutive probe failures quarantine s1
    prober.set_healthy("10.0.0.1:8000", false);
    for _ in 0..3 {
        engine.perform_health_check("audio").await.unwrap();
    }
    let servers = engine.get_servers("audio").unwrap();
    let s1 = servers.iter().find(|s| s.id == "s1").unwrap();
    assert_eq!(s1.state, HealthState::Quarantined);

    // Every selection avoids the quarantined backend
    for _ in 0..5 {
        let decision = engine.select("audio", None).unwrap();
        assert_eq!(decision.server_id, "s2");
        engine.report_outcome("audio", "s2", true, None).unwrap();
    }

    // After the quarantine window, two clean probes restore s1
    tokio::time::sleep(Duration::from_millis(30)).await;
    prober.set_healthy("10.0.0.1:8000", true);
    engine.perform_health_check("audio").await.unwrap();
    engine.perform_health_check("audio").await.unwrap();

    let servers = engine.get_servers("audio").unwrap();
    let s1 = servers.iter().find(|s| s.id == "s1").unwrap();
    assert_eq!(s1.state, HealthState::Healthy);
    assert!(s1.available);

    engine.shutdown().await;
}

#[tokio::test]
async fn traffic_failures_quarantine_without_probes() {
    let engine = BalancerEngine::new();
    engine
        .create_balancer("audio", BalancerConfig::default())
        .unwrap();
    engine.add_server("audio", &backend("s1", 8000, 1.0)).unwrap();
    engine.add_server("audio", &backend("s2", 8001, 1.0)).unwrap();

    let mut events = engine.subscribe();
    for _ in 0..3 {
        engine.report_outcome("audio", "s1", false, None).unwrap();
    }

    assert_eq!(engine.active_servers("audio").unwrap(), 1);
    for _ in 0..4 {
        assert_eq!(engine.select("audio", None).unwrap().server_id, "s2");
        engine.report_outcome("audio", "s2", true, None).unwrap();
    }

    let mut saw_failed = false;
    while let Ok(event) = events.try_recv() {
        if matches!(
            event,
            castgate_balancer::BalancerEvent::ServerFailed { .. }
        ) {
            saw_failed = true;
        }
    }
    assert!(saw_failed);

    engine.shutdown().await;
}

#[tokio::test]
async fn sticky_sessions_pin_clients() {
    let engine = BalancerEngine::new();
    let config = BalancerConfig {
        sticky: StickyConfig {
            enabled: true,
            ..StickyConfig::default()
        },
        ..BalancerConfig::default()
    };
    engine.create_balancer("audio", config).unwrap();
    engine.add_server("audio", &backend("s1", 8000, 1.0)).unwrap();
    engine.add_server("audio", &backend("s2", 8001, 1.0)).unwrap();
    engine.add_server("audio", &backend("s3", 8002, 1.0)).unwrap();

    let first = engine.select("audio", Some("203.0.113.7")).unwrap();
    engine
        .report_outcome("audio", &first.server_id, true, None)
        .unwrap();
    for _ in 0..10 {
        let next = engine.select("audio", Some("203.0.113.7")).unwrap();
        assert_eq!(next.server_id, first.server_id);
        assert_eq!(next.reason, "sticky-session");
        engine
            .report_outcome("audio", &next.server_id, true, None)
            .unwrap();
    }

    // Removing the pinned backend forces a re-selection
    engine.remove_server("audio", &first.server_id).unwrap();
    let moved = engine.select("audio", Some("203.0.113.7")).unwrap();
    assert_ne!(moved.server_id, first.server_id);
    engine
        .report_outcome("audio", &moved.server_id, true, None)
        .unwrap();

    engine.shutdown().await;
}

#[tokio::test]
async fn empty_pool_reports_no_available_backends() {
    let engine = BalancerEngine::new();
    engine
        .create_balancer("audio", BalancerConfig::default())
        .unwrap();

    assert!(matches!(
        engine.select("audio", None),
        Err(BalancerError::NoAvailableBackends(_))
    ));

    // Disabling the only backend empties the effective pool too
    engine.add_server("audio", &backend("s1", 8000, 1.0)).unwrap();
    engine.set_server_enabled("audio", "s1", false).unwrap();
    assert!(matches!(
        engine.select("audio", None),
        Err(BalancerError::NoAvailableBackends(_))
    ));

    engine.shutdown().await;
}

#[tokio::test]
async fn backend_ids_can_be_reused_after_removal() {
    let engine = BalancerEngine::new();
    engine
        .create_balancer("audio", BalancerConfig::default())
        .unwrap();
    engine.add_server("audio", &backend("s1", 8000, 1.0)).unwrap();

    assert!(matches!(
        engine.add_server("audio", &backend("s1", 9000, 1.0)),
        Err(BalancerError::DuplicateId(_))
    ));

    engine.remove_server("audio", "s1").unwrap();
    engine.add_server("audio", &backend("s1", 9000, 1.0)).unwrap();

    let servers = engine.get_servers("audio").unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].port, 9000);
    // The re-added backend starts with fresh counters
    assert_eq!(servers[0].requests_routed, 0);
    assert_eq!(servers[0].state, HealthState::Unknown);

    engine.shutdown().await;
}

#[tokio::test]
async fn ip_hash_is_stable_for_a_client() {
    let engine = BalancerEngine::new();
    let config = BalancerConfig {
        strategy: StrategyKind::IpHash,
        ..BalancerConfig::default()
    };
    engine.create_balancer("audio", config).unwrap();
    for (id, port) in [("s1", 8000), ("s2", 8001), ("s3", 8002)] {
        engine.add_server("audio", &backend(id, port, 1.0)).unwrap();
    }

    let first = engine.select("audio", Some("198.51.100.4")).unwrap();
    engine
        .report_outcome("audio", &first.server_id, true, None)
        .unwrap();
    for _ in 0..20 {
        let next = engine.select("audio", Some("198.51.100.4")).unwrap();
        assert_eq!(next.server_id, first.server_id);
        engine
            .report_outcome("audio", &next.server_id, true, None)
            .unwrap();
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn adaptive_weighting_shifts_traffic_away_from_loaded_backend() {
    let engine = BalancerEngine::new();
    let config = BalancerConfig {
        strategy: StrategyKind::Adaptive,
        adaptive: castgate_balancer::AdaptiveConfig {
            enabled: true,
            ..castgate_balancer::AdaptiveConfig::default()
        },
        ..BalancerConfig::default()
    };
    engine.create_balancer("audio", config).unwrap();
    engine.add_server("audio", &backend("s1", 8000, 1.0)).unwrap();
    engine.add_server("audio", &backend("s2", 8001, 1.0)).unwrap();

    engine
        .update_server_load(
            "audio",
            "s1",
            &castgate_balancer::LoadUpdate {
                cpu_usage: Some(95.0),
                memory_usage: Some(95.0),
                error_rate: Some(0.5),
                ..castgate_balancer::LoadUpdate::default()
            },
        )
        .unwrap();
    // Apply the batched recompute directly instead of waiting a tick
    engine.recompute_weights("audio").unwrap();

    let servers = engine.get_servers("audio").unwrap();
    let s1 = servers.iter().find(|s| s.id == "s1").unwrap();
    let s2 = servers.iter().find(|s| s.id == "s2").unwrap();
    assert!(s1.computed_weight < s2.computed_weight);
    assert_eq!(s2.priority, 1);

    let mut counts: HashMap<String, u32> = HashMap::new();
    for _ in 0..200 {
        let decision = engine.select("audio", None).unwrap();
        engine
            .report_outcome("audio", &decision.server_id, true, None)
            .unwrap();
        *counts.entry(decision.server_id).or_insert(0) += 1;
    }
    assert!(counts["s2"] > counts["s1"]);
    // The loaded backend keeps at least a trickle
    assert!(counts.get("s1").copied().unwrap_or(0) > 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn destroy_drains_and_removes() {
    let engine = BalancerEngine::new();
    engine
        .create_balancer("audio", BalancerConfig::default())
        .unwrap();
    engine.add_server("audio", &backend("s1", 8000, 1.0)).unwrap();
    let decision = engine.select("audio", None).unwrap();
    engine
        .report_outcome("audio", &decision.server_id, true, None)
        .unwrap();

    engine.destroy_balancer("audio").await;
    assert!(!engine.balancer_exists("audio"));
    assert!(matches!(
        engine.select("audio", None),
        Err(BalancerError::BalancerNotFound(_))
    ));
}
