//! Selection strategies and decisions.

use crate::backend::BackendSnapshot;
use crate::config::StrategyKind;
use crate::error::{BalancerError, BalancerResult};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

/// The decision returned to the caller for one selection.
///
/// Ephemeral: constructed per call, never mutated after return.
#[derive(Debug, Clone)]
pub struct SelectionDecision {
    /// Chosen backend id.
    pub server_id: String,
    /// Why this backend was chosen ("round-robin", "sticky-session", ...).
    pub reason: &'static str,
    /// Selection confidence in [0, 1]: the chosen backend's share of
    /// the candidate set's selection mass.
    pub confidence: f64,
    /// The other candidate ids, in id order.
    pub alternatives: Vec<String>,
    /// Decision time.
    pub timestamp: DateTime<Utc>,
}

/// A strategy's pick before the decision is assembled.
#[derive(Debug, Clone)]
pub struct Choice {
    /// Chosen backend id.
    pub id: String,
    /// Share of the candidate selection mass.
    pub confidence: f64,
}

/// The selection algorithm family as a closed set of variants.
///
/// Each variant carries its own private state (cursor, current
/// weights). Adding an algorithm means adding a variant here, not a
/// subclass anywhere.
#[derive(Debug)]
pub enum Strategy {
    /// Monotonic rotation over the available set ordered by id.
    RoundRobin {
        /// Logical rotation index, taken modulo the current candidate
        /// count each call so set changes never skip or double-serve.
        cursor: u64,
    },
    /// Fewest active connections, ties by lowest id.
    LeastConnections,
    /// Smooth weighted round-robin over computed weights.
    WeightedRoundRobin {
        /// Per-backend current weight accumulators.
        current: HashMap<String, f64>,
    },
    /// Deterministic client-id hash over the id-ordered candidate set.
    IpHash,
    /// Lowest response-time EWMA, ties by fewest connections then id.
    LeastResponseTime,
    /// Smooth weighted round-robin driven by the adaptive load score.
    Adaptive {
        /// Per-backend current weight accumulators.
        current: HashMap<String, f64>,
    },
}

impl Strategy {
    /// Create the strategy state for a kind.
    #[must_use]
    pub fn new(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::RoundRobin => Self::RoundRobin { cursor: 0 },
            StrategyKind::LeastConnections => Self::LeastConnections,
            StrategyKind::WeightedRoundRobin => Self::WeightedRoundRobin {
                current: HashMap::new(),
            },
            StrategyKind::IpHash => Self::IpHash,
            StrategyKind::LeastResponseTime => Self::LeastResponseTime,
            StrategyKind::Adaptive => Self::Adaptive {
                current: HashMap::new(),
            },
        }
    }

    /// The kind this state belongs to.
    #[must_use]
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::RoundRobin { .. } => StrategyKind::RoundRobin,
            Self::LeastConnections => StrategyKind::LeastConnections,
            Self::WeightedRoundRobin { .. } => StrategyKind::WeightedRoundRobin,
            Self::IpHash => StrategyKind::IpHash,
            Self::LeastResponseTime => StrategyKind::LeastResponseTime,
            Self::Adaptive { .. } => StrategyKind::Adaptive,
        }
    }

    /// Clear per-strategy state (cursor, current weights).
    pub fn reset(&mut self) {
        match self {
            Self::RoundRobin { cursor } => *cursor = 0,
            Self::WeightedRoundRobin { current } | Self::Adaptive { current } => current.clear(),
            Self::LeastConnections | Self::IpHash | Self::LeastResponseTime => {},
        }
    }

    /// Pick one backend from the candidate set.
    ///
    /// `candidates` must already be filtered to available backends and
    /// ordered by id; ties on the primary metric always break toward
    /// the lowest id so selection is deterministic.
    ///
    /// # Errors
    ///
    /// Returns `NoAvailableBackends` when `candidates` is empty. This
    /// is the single error condition; the caller owns fallback policy.
    pub fn select(
        &mut self,
        balancer: &str,
        candidates: &[BackendSnapshot],
        client_id: Option<&str>,
    ) -> BalancerResult<Choice> {
        if candidates.is_empty() {
            return Err(BalancerError::NoAvailableBackends(balancer.to_string()));
        }

        let choice = match self {
            Self::RoundRobin { cursor } => {
                let index = (*cursor % candidates.len() as u64) as usize;
                *cursor = cursor.wrapping_add(1);
                Choice {
                    id: candidates[index].id.clone(),
                    confidence: 1.0 / candidates.len() as f64,
                }
            },
            Self::LeastConnections => pick_min(candidates, |s| f64::from(s.active_connections)),
            Self::WeightedRoundRobin { current } => {
                smooth_weighted_pick(current, candidates, |s| s.computed_weight)
            },
            Self::IpHash => {
                let mut hasher = DefaultHasher::new();
                client_id.unwrap_or_default().hash(&mut hasher);
                let index = (hasher.finish() % candidates.len() as u64) as usize;
                Choice {
                    id: candidates[index].id.clone(),
                    confidence: 1.0 / candidates.len() as f64,
                }
            },
            Self::LeastResponseTime => pick_least_response_time(candidates),
            Self::Adaptive { current } => {
                smooth_weighted_pick(current, candidates, |s| s.computed_weight)
            },
        };

        Ok(choice)
    }
}

/// Lowest metric wins; candidates are id-ordered so the first minimum
/// is the lowest id.
fn pick_min(candidates: &[BackendSnapshot], metric: impl Fn(&BackendSnapshot) -> f64) -> Choice {
    let mut best = 0;
    let mut best_metric = metric(&candidates[0]);
    for (i, candidate) in candidates.iter().enumerate().skip(1) {
        let m = metric(candidate);
        if m < best_metric {
            best = i;
            best_metric = m;
        }
    }

    // Inverse-metric mass: a backend twice as loaded carries half the mass.
    let mass: f64 = candidates.iter().map(|c| 1.0 / (1.0 + metric(c))).sum();
    Choice {
        id: candidates[best].id.clone(),
        confidence: (1.0 / (1.0 + best_metric)) / mass,
    }
}

/// Lowest EWMA wins; ties break by fewest active connections, then by
/// lowest id (candidates are id-ordered, strict less keeps the first).
fn pick_least_response_time(candidates: &[BackendSnapshot]) -> Choice {
    let mut best = 0;
    for (i, candidate) in candidates.iter().enumerate().skip(1) {
        let incumbent = &candidates[best];
        let ord = candidate
            .response_time_ewma
            .total_cmp(&incumbent.response_time_ewma)
            .then_with(|| candidate.active_connections.cmp(&incumbent.active_connections));
        if ord == Ordering::Less {
            best = i;
        }
    }

    let chosen = &candidates[best];
    let mass: f64 = candidates
        .iter()
        .map(|c| 1.0 / (1.0 + c.response_time_ewma))
        .sum();
    Choice {
        id: chosen.id.clone(),
        confidence: (1.0 / (1.0 + chosen.response_time_ewma)) / mass,
    }
}

/// Classic smooth weighted round-robin.
///
/// Every candidate's current weight rises by its own weight each call;
/// the largest current weight wins and is debited by the total. Higher
/// weights are chosen proportionally more often without bursting.
fn smooth_weighted_pick(
    current: &mut HashMap<String, f64>,
    candidates: &[BackendSnapshot],
    weight: impl Fn(&BackendSnapshot) -> f64,
) -> Choice {
    // Drop state for backends no longer in the candidate set.
    current.retain(|id, _| candidates.iter().any(|c| &c.id == id));

    let mut total = 0.0;
    let mut best: Option<usize> = None;
    let mut best_current = f64::NEG_INFINITY;

    for (i, candidate) in candidates.iter().enumerate() {
        let w = weight(candidate).max(0.0);
        total += w;
        let entry = current.entry(candidate.id.clone()).or_insert(0.0);
        *entry += w;
        // Strict comparison keeps ties on the lowest id (id order)
        if *entry > best_current {
            best_current = *entry;
            best = Some(i);
        }
    }

    // All weights zero: degrade to the lowest id
    let best = best.unwrap_or(0);
    let chosen = &candidates[best];
    if let Some(entry) = current.get_mut(&chosen.id) {
        *entry -= total;
    }

    let confidence = if total > 0.0 {
        weight(chosen).max(0.0) / total
    } else {
        1.0 / candidates.len() as f64
    };

    Choice {
        id: chosen.id.clone(),
        confidence,
    }
}
