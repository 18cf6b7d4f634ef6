//! CPU-based shedding
//!
//! A background task polls a [`CpuSource`] every `polling_interval` and
//! records the reading into a rolling average spanning
//! `window_size × polling_interval`. The task lives as long as the
//! aggregator: [`CpuAggregator::stop`] ends it cleanly, dropping the
//! aggregator aborts it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::System;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::{Aggregator, Thresholds};
use crate::config::CpuConfig;
use crate::window::{Aggregation, Clock, Reading, RollingWindow, WindowConfig};
use crate::{Error, Result};

/// Produces host CPU utilisation readings
pub trait CpuSource: Send + 'static {
    /// Utilisation as a fraction in `[0, 1]`, or `None` to skip this poll
    fn sample(&mut self) -> Option<f64>;
}

/// Global CPU utilisation via `sysinfo`
pub struct SystemCpu {
    system: System,
}

impl SystemCpu {
    /// Create a source primed with a first refresh
    #[must_use]
    pub fn new() -> Self {
        let mut system = System::new();
        // usage is computed between two refreshes
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SystemCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSource for SystemCpu {
    fn sample(&mut self) -> Option<f64> {
        self.system.refresh_cpu_usage();
        let percent = f64::from(self.system.global_cpu_usage());
        percent
            .is_finite()
            .then(|| (percent / 100.0).clamp(0.0, 1.0))
    }
}

struct Poller {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Sheds on average CPU utilisation
pub struct CpuAggregator {
    window: Arc<RollingWindow>,
    thresholds: Thresholds,
    poller: Mutex<Option<Poller>>,
}

impl CpuAggregator {
    /// Start polling the host CPU
    ///
    /// # Errors
    ///
    /// Fails on invalid thresholds or window shape, or when called outside a
    /// tokio runtime.
    pub fn start(config: &CpuConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_source(config, Box::new(SystemCpu::new()), clock)
    }

    /// Start polling `source`
    ///
    /// # Errors
    ///
    /// Same as [`CpuAggregator::start`].
    pub fn with_source(
        config: &CpuConfig,
        source: Box<dyn CpuSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let thresholds = Thresholds::new(config.lower, config.upper)?;
        let window = Arc::new(RollingWindow::with_clock(
            WindowConfig::new(config.polling_interval, config.window_size),
            Aggregation::Average,
            clock,
        )?);

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Runtime(format!("CPU sampler needs a tokio runtime: {e}")))?;

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let handle = runtime.spawn(poll_loop(
            source,
            Arc::clone(&window),
            config.polling_interval,
            shutdown_rx,
        ));

        info!(
            interval_ms = config.polling_interval.as_millis() as u64,
            window_size = config.window_size,
            lower = config.lower,
            upper = config.upper,
            "CPU sampler started"
        );

        Ok(Self {
            window,
            thresholds,
            poller: Mutex::new(Some(Poller { shutdown, handle })),
        })
    }

    /// Current average utilisation
    #[must_use]
    pub fn reading(&self) -> Option<Reading> {
        self.window.aggregate()
    }

    /// Whether the background poller is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.poller
            .lock()
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished())
    }

    /// Stop polling and wait for the task to exit. Idempotent.
    pub async fn stop(&self) {
        let poller = self.poller.lock().take();
        let Some(poller) = poller else {
            return;
        };

        // The task may already be gone; a closed channel is fine
        let _ = poller.shutdown.send(());
        if let Err(e) = poller.handle.await {
            if !e.is_cancelled() {
                warn!(error = %e, "CPU sampler task failed");
            }
        }
        info!("CPU sampler stopped");
    }
}

impl Aggregator for CpuAggregator {
    fn aggregate(&self) -> f64 {
        // No samples yet: fail open
        self.window
            .aggregate()
            .map_or(0.0, |reading| self.thresholds.probability(reading.value))
    }

    fn name(&self) -> &str {
        "cpu"
    }
}

impl Drop for CpuAggregator {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.get_mut().take() {
            poller.handle.abort();
        }
    }
}

impl std::fmt::Debug for CpuAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuAggregator")
            .field("thresholds", &self.thresholds)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

async fn poll_loop(
    mut source: Box<dyn CpuSource>,
    window: Arc<RollingWindow>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                debug!("CPU sampler received shutdown");
                break;
            }
            _ = interval.tick() => {
                if let Some(usage) = source.sample() {
                    let usage = usage.clamp(0.0, 1.0);
                    trace!(usage, "CPU sample");
                    window.record(usage);
                }
            }
        }
    }
}
