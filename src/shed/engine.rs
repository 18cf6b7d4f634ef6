//! Composite decision engine

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use rand::RngExt;
use tracing::{debug, info, warn};

use super::{
    Aggregator, ConcurrencyAggregator, CpuAggregator, CpuSource, InflightCounter, InflightGuard,
    LatencyAggregator,
};
use crate::config::{ConcurrencyConfig, CpuConfig, LatencyConfig, SheddingConfig};
use crate::middleware::default_rejection;
use crate::stats::{AggregatorProbability, ShedSnapshot, ShedStats};
use crate::window::{Clock, MonotonicClock};
use crate::Result;

/// Builds the response for a shed request. The request body is never read.
pub type RejectionHandler = Arc<dyn Fn(&Request<Body>) -> Response + Send + Sync>;

/// Outcome of one admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Dispatch to the wrapped handler
    Accept,
    /// Answer with the rejection handler instead
    Reject,
}

/// Admission control over every configured aggregator
///
/// The combined probability is the maximum over all aggregators, so any
/// single overloaded dimension can trigger shedding. With no aggregators
/// every request is accepted.
pub struct LoadShedder {
    cpu: Option<CpuAggregator>,
    latency: Option<LatencyAggregator>,
    concurrency: Option<ConcurrencyAggregator>,
    custom: Vec<Arc<dyn Aggregator>>,
    inflight: Arc<InflightCounter>,
    rejection: RejectionHandler,
    exempt_paths: Vec<String>,
    stats: ShedStats,
}

impl LoadShedder {
    /// Start building a shedder
    #[must_use]
    pub fn builder() -> LoadShedderBuilder {
        LoadShedderBuilder::default()
    }

    /// Build from configuration, enabling each aggregator marked `enabled`
    ///
    /// # Errors
    ///
    /// Returns the first validation failure; nothing is left running.
    pub fn from_config(config: &SheddingConfig) -> Result<Self> {
        let mut builder = Self::builder().exempt_paths(config.exempt_paths.clone());
        if config.cpu.enabled {
            builder = builder.cpu(config.cpu.clone());
        }
        if config.latency.enabled {
            builder = builder.latency(config.latency.clone());
        }
        if config.concurrency.enabled {
            builder = builder.concurrency(config.concurrency.clone());
        }
        builder.build()
    }

    fn aggregators(&self) -> impl Iterator<Item = &dyn Aggregator> {
        let cpu = self.cpu.iter().map(|a| a as &dyn Aggregator);
        let latency = self.latency.iter().map(|a| a as &dyn Aggregator);
        let concurrency = self.concurrency.iter().map(|a| a as &dyn Aggregator);
        let custom = self.custom.iter().map(|a| a.as_ref() as &dyn Aggregator);
        cpu.chain(latency).chain(concurrency).chain(custom)
    }

    /// Whether any aggregator is configured
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.aggregators().next().is_some()
    }

    /// Combined rejection probability right now
    #[must_use]
    pub fn probability(&self) -> f64 {
        self.aggregators()
            .map(|a| sanitize(a.name(), a.aggregate()))
            .fold(0.0, f64::max)
    }

    /// Draw a verdict for one request
    pub fn decide(&self) -> Verdict {
        self.decide_with(rand::rng().random::<f64>())
    }

    /// Verdict for a given uniform draw in `[0, 1)`: reject iff `draw < p`
    pub fn decide_with(&self, draw: f64) -> Verdict {
        if !self.is_active() {
            self.stats.record_accepted();
            return Verdict::Accept;
        }

        let probability = self.probability();
        self.stats.record_probability(probability);

        if draw < probability {
            debug!(probability, draw, "Shedding request");
            self.stats.record_rejected();
            Verdict::Reject
        } else {
            self.stats.record_accepted();
            Verdict::Accept
        }
    }

    /// Start tracking an accepted request
    ///
    /// The ticket holds an in-flight slot and, when dropped, records the
    /// elapsed time as a latency sample. Both happen exactly once on every
    /// exit path, including panics and cancellation.
    pub fn begin(&self) -> RequestTicket<'_> {
        RequestTicket {
            latency: self.latency.as_ref(),
            started: Instant::now(),
            _inflight: self.inflight.guard(),
        }
    }

    /// Response for a shed request
    pub fn reject(&self, request: &Request<Body>) -> Response {
        (self.rejection)(request)
    }

    /// Whether `path` bypasses shedding
    #[must_use]
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// In-flight request counter, shared with the concurrency aggregator
    #[must_use]
    pub fn inflight(&self) -> &Arc<InflightCounter> {
        &self.inflight
    }

    /// Decision statistics
    #[must_use]
    pub fn stats(&self) -> &ShedStats {
        &self.stats
    }

    /// Latency aggregator, when configured
    #[must_use]
    pub fn latency(&self) -> Option<&LatencyAggregator> {
        self.latency.as_ref()
    }

    /// CPU aggregator, when configured
    #[must_use]
    pub fn cpu(&self) -> Option<&CpuAggregator> {
        self.cpu.as_ref()
    }

    /// Current per-aggregator probabilities and counters
    #[must_use]
    pub fn snapshot(&self) -> ShedSnapshot {
        let aggregators: Vec<AggregatorProbability> = self
            .aggregators()
            .map(|a| AggregatorProbability {
                name: a.name().to_string(),
                probability: sanitize(a.name(), a.aggregate()),
            })
            .collect();
        let probability = aggregators
            .iter()
            .map(|a| a.probability)
            .fold(0.0, f64::max);

        ShedSnapshot {
            probability,
            aggregators,
            inflight: self.inflight.value(),
            decisions: self.stats.counts(),
        }
    }

    /// Stop background sampling
    pub async fn shutdown(&self) {
        if let Some(cpu) = &self.cpu {
            cpu.stop().await;
        }
    }
}

impl std::fmt::Debug for LoadShedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadShedder")
            .field("cpu", &self.cpu)
            .field("latency", &self.latency)
            .field("concurrency", &self.concurrency)
            .field("custom", &self.custom.len())
            .field("exempt_paths", &self.exempt_paths)
            .finish_non_exhaustive()
    }
}

/// Clamp an aggregator's output into `[0, 1]`; NaN counts as 0
fn sanitize(name: &str, probability: f64) -> f64 {
    if probability.is_nan() {
        warn!(aggregator = %name, "Aggregator returned NaN, ignoring");
        return 0.0;
    }
    if !(0.0..=1.0).contains(&probability) {
        warn!(aggregator = %name, probability, "Aggregator returned out-of-range probability, clamping");
    }
    probability.clamp(0.0, 1.0)
}

/// Feedback guard for one dispatched request
#[must_use = "dropping the ticket ends the request immediately"]
pub struct RequestTicket<'a> {
    latency: Option<&'a LatencyAggregator>,
    started: Instant,
    _inflight: InflightGuard,
}

impl RequestTicket<'_> {
    /// Time since the request was dispatched
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for RequestTicket<'_> {
    fn drop(&mut self) {
        // Recorded at completion time, into whichever bucket is active now
        if let Some(latency) = self.latency {
            latency.record(self.started.elapsed());
        }
    }
}

enum CpuSetup {
    System(CpuConfig),
    Source(CpuConfig, Box<dyn CpuSource>),
}

/// Option-by-option construction of a [`LoadShedder`]
pub struct LoadShedderBuilder {
    cpu: Option<CpuSetup>,
    latency: Option<LatencyConfig>,
    concurrency: Option<ConcurrencyConfig>,
    custom: Vec<Arc<dyn Aggregator>>,
    rejection: Option<RejectionHandler>,
    exempt_paths: Vec<String>,
    clock: Option<Arc<dyn Clock>>,
}

impl Default for LoadShedderBuilder {
    fn default() -> Self {
        Self {
            cpu: None,
            latency: None,
            concurrency: None,
            custom: Vec::new(),
            rejection: None,
            exempt_paths: Vec::new(),
            clock: None,
        }
    }
}

impl LoadShedderBuilder {
    /// Shed on host CPU utilisation
    #[must_use]
    pub fn cpu(mut self, config: CpuConfig) -> Self {
        self.cpu = Some(CpuSetup::System(config));
        self
    }

    /// Shed on CPU utilisation read from `source`
    #[must_use]
    pub fn cpu_with_source(mut self, config: CpuConfig, source: Box<dyn CpuSource>) -> Self {
        self.cpu = Some(CpuSetup::Source(config, source));
        self
    }

    /// Shed on average or percentile request latency
    #[must_use]
    pub fn latency(mut self, config: LatencyConfig) -> Self {
        self.latency = Some(config);
        self
    }

    /// Shed on in-flight request count
    #[must_use]
    pub fn concurrency(mut self, config: ConcurrencyConfig) -> Self {
        self.concurrency = Some(config);
        self
    }

    /// Add an externally supplied aggregator
    #[must_use]
    pub fn custom(mut self, aggregator: Arc<dyn Aggregator>) -> Self {
        self.custom.push(aggregator);
        self
    }

    /// Replace the default 503 response
    #[must_use]
    pub fn rejection_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Request<Body>) -> Response + Send + Sync + 'static,
    {
        self.rejection = Some(Arc::new(handler));
        self
    }

    /// Never shed requests whose path starts with `prefix`
    #[must_use]
    pub fn exempt_path(mut self, prefix: impl Into<String>) -> Self {
        self.exempt_paths.push(prefix.into());
        self
    }

    /// Replace the exempt path list
    #[must_use]
    pub fn exempt_paths(mut self, prefixes: Vec<String>) -> Self {
        self.exempt_paths = prefixes;
        self
    }

    /// Time source for rolling windows (defaults to a monotonic clock)
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate every option and start background sampling
    ///
    /// # Errors
    ///
    /// Invalid thresholds, window shapes or percentiles, or a CPU option
    /// without a tokio runtime.
    pub fn build(self) -> Result<LoadShedder> {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let inflight = Arc::new(InflightCounter::new());

        let latency = self
            .latency
            .map(|config| LatencyAggregator::new(&config, Arc::clone(&clock)))
            .transpose()?;
        let concurrency = self
            .concurrency
            .map(|config| ConcurrencyAggregator::new(&config, Arc::clone(&inflight)))
            .transpose()?;
        // Last, so a validation failure above never leaves a poller running
        let cpu = match self.cpu {
            Some(CpuSetup::System(config)) => Some(CpuAggregator::start(&config, clock)?),
            Some(CpuSetup::Source(config, source)) => {
                Some(CpuAggregator::with_source(&config, source, clock)?)
            }
            None => None,
        };

        let rejection: RejectionHandler = match self.rejection {
            Some(handler) => handler,
            None => Arc::new(default_rejection),
        };

        let shedder = LoadShedder {
            cpu,
            latency,
            concurrency,
            custom: self.custom,
            inflight,
            rejection,
            exempt_paths: self.exempt_paths,
            stats: ShedStats::new(),
        };

        let names: Vec<&str> = shedder.aggregators().map(|a| a.name()).collect();
        if names.is_empty() {
            info!("Load shedding passthrough: no aggregators configured");
        } else {
            info!(aggregators = ?names, exempt = ?shedder.exempt_paths, "Load shedding enabled");
        }

        Ok(shedder)
    }
}
