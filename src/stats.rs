//! Decision statistics
//!
//! Counts accepted, rejected and exempt requests, mirrors them into the
//! `metrics` facade, and builds the serialisable snapshot served at
//! `/shed/stats`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counter name for per-request outcomes
pub const REQUESTS_METRIC: &str = "load_shedder_requests_total";
/// Gauge name for the last combined rejection probability
pub const PROBABILITY_METRIC: &str = "load_shedder_rejection_probability";

/// Running decision counts
#[derive(Debug, Default)]
pub struct ShedStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    exempt: AtomicU64,
}

impl ShedStats {
    /// Create zeroed statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request let through
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        telemetry_metrics::counter!(REQUESTS_METRIC, "outcome" => "accepted").increment(1);
    }

    /// Record a shed request
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        telemetry_metrics::counter!(REQUESTS_METRIC, "outcome" => "rejected").increment(1);
    }

    /// Record a request on an exempt path
    pub fn record_exempt(&self) {
        self.exempt.fetch_add(1, Ordering::Relaxed);
        telemetry_metrics::counter!(REQUESTS_METRIC, "outcome" => "exempt").increment(1);
    }

    /// Publish the combined probability computed for a decision
    pub fn record_probability(&self, probability: f64) {
        telemetry_metrics::gauge!(PROBABILITY_METRIC).set(probability);
    }

    /// Current counts
    #[must_use]
    pub fn counts(&self) -> DecisionCounts {
        let accepted = self.accepted.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        let exempt = self.exempt.load(Ordering::Relaxed);

        #[allow(clippy::cast_precision_loss)]
        let shed_rate = if accepted + rejected > 0 {
            rejected as f64 / (accepted + rejected) as f64
        } else {
            0.0
        };

        DecisionCounts {
            accepted,
            rejected,
            exempt,
            shed_rate,
        }
    }
}

/// Snapshot of decision counts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionCounts {
    /// Requests let through
    pub accepted: u64,
    /// Requests shed
    pub rejected: u64,
    /// Requests on exempt paths
    pub exempt: u64,
    /// Rejected share of decided requests (0.0-1.0)
    pub shed_rate: f64,
}

/// One aggregator's contribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorProbability {
    /// Aggregator name
    pub name: String,
    /// Probability after clamping
    pub probability: f64,
}

/// Full engine state at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShedSnapshot {
    /// Combined (maximum) rejection probability
    pub probability: f64,
    /// Per-aggregator probabilities, in evaluation order
    pub aggregators: Vec<AggregatorProbability>,
    /// Requests currently in flight
    pub inflight: usize,
    /// Decision counts so far
    pub decisions: DecisionCounts,
}
