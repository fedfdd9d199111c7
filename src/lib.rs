//! # CastGate Balancer
//!
//! Adaptive request distribution for streaming media backends. The
//! engine manages any number of named balancer instances, each with its
//! own backend pool, health monitoring, sticky sessions, and statistics.
//!
//! ## Features
//!
//! - **Multiple strategies**: round-robin, least-connections, smooth
//!   weighted round-robin, ip-hash, least-response-time, and adaptive
//!   load-score weighting
//! - **Health monitoring**: periodic TCP probes with hysteresis and
//!   timed quarantine after repeated failures
//! - **Passive feedback**: reported traffic outcomes feed the same
//!   failure counters as probes, so live errors react faster than the
//!   probe cadence
//! - **Sticky sessions**: TTL-bound client-to-backend bindings
//! - **Events**: state changes fan out over a broadcast channel
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │               BalancerEngine               │
//! │                                            │
//! │  ┌──────────────────────────────────────┐  │
//! │  │        BalancerInstance "audio"      │  │      ┌──────────┐
//! │  │                                      │  │────▶│ Backend1 │
//! │  │  Registry ── Strategy ── StickyTable │  │      └──────────┘
//! │  │      │                               │  │      ┌──────────┐
//! │  │  HealthMonitor ◀── Scheduler task    │  │────▶│ Backend2 │
//! │  └──────────────────────────────────────┘  │      └──────────┘
//! │  ┌──────────────────────────────────────┐  │      ┌──────────┐
//! │  │        BalancerInstance "relay"      │──┼────▶│ Backend3 │
//! │  └──────────────────────────────────────┘  │      └──────────┘
//! └────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use castgate_balancer::{BackendConfig, BalancerConfig, BalancerEngine};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = BalancerEngine::new();
//! engine.create_balancer("audio", BalancerConfig::default())?;
//! engine.add_server(
//!     "audio",
//!     &BackendConfig {
//!         id: "stream-1".into(),
//!         address: "10.0.0.10".into(),
//!         port: 8000,
//!         weight: 1.0,
//!         max_connections: 1000,
//!         enabled: true,
//!     },
//! )?;
//!
//! let decision = engine.select("audio", Some("203.0.113.7"))?;
//! engine.report_outcome("audio", &decision.server_id, true, None)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod instance;
pub mod registry;
pub mod scheduler;
pub mod stats;
pub mod sticky;
pub mod strategy;

pub use backend::{BackendServer, BackendSnapshot, HealthState, LoadUpdate};
pub use config::{
    AdaptiveConfig, BackendConfig, BalancerConfig, HealthCheckConfig, StickyConfig, StrategyKind,
};
pub use engine::BalancerEngine;
pub use error::{BalancerError, BalancerResult};
pub use events::{BalancerEvent, EventBus};
pub use health::{HealthMonitor, ProbeSummary, Prober, TcpProber};
pub use instance::BalancerInstance;
pub use registry::ServerRegistry;
pub use stats::{ServerStatsSnapshot, StatsSnapshot};
pub use sticky::StickySessionTable;
pub use strategy::{SelectionDecision, Strategy};
