//! Load shedding: per-metric aggregators and the composite decision engine
//!
//! Every aggregator reduces one load signal to a rejection probability in
//! `[0, 1]`. The [`LoadShedder`] takes the maximum across all of them and
//! draws a verdict per request.

mod concurrency;
mod cpu;
mod engine;
mod latency;
mod threshold;

pub use concurrency::{ConcurrencyAggregator, InflightCounter, InflightGuard};
pub use cpu::{CpuAggregator, CpuSource, SystemCpu};
pub use engine::{LoadShedder, LoadShedderBuilder, RejectionHandler, RequestTicket, Verdict};
pub use latency::LatencyAggregator;
pub use threshold::Thresholds;

/// A source of rejection probability
///
/// Built-in aggregators and externally supplied ones share this capability;
/// the engine treats them uniformly. Values outside `[0, 1]` are clamped by
/// the engine, and NaN counts as 0.
pub trait Aggregator: Send + Sync {
    /// Current rejection probability
    fn aggregate(&self) -> f64;

    /// Name used in logs and snapshots
    fn name(&self) -> &str {
        "custom"
    }
}

/// Adapts a closure into an [`Aggregator`]
pub struct FnAggregator<F> {
    name: String,
    f: F,
}

impl<F> FnAggregator<F>
where
    F: Fn() -> f64 + Send + Sync,
{
    /// Wrap `f` under `name`
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Aggregator for FnAggregator<F>
where
    F: Fn() -> f64 + Send + Sync,
{
    fn aggregate(&self) -> f64 {
        (self.f)()
    }

    fn name(&self) -> &str {
        &self.name
    }
}
