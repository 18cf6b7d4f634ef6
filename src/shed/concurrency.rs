//! In-flight request counting
//!
//! [`InflightCounter`] is usable on its own, e.g. to drain requests during
//! graceful shutdown. [`ConcurrencyAggregator`] puts the instantaneous count
//! through a threshold curve.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::warn;

use super::{Aggregator, Thresholds};
use crate::Result;
use crate::config::ConcurrencyConfig;

/// Lock-free count of requests currently being handled
#[derive(Debug, Default)]
pub struct InflightCounter {
    value: AtomicUsize,
    idle: Notify,
}

impl InflightCounter {
    /// Create a counter at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one more in-flight request, returning the new count
    pub fn increment(&self) -> usize {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Release one in-flight request, returning the new count.
    ///
    /// Never goes below zero; an unmatched release is logged and ignored.
    pub fn decrement(&self) -> usize {
        match self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
        {
            Ok(previous) => {
                let now = previous - 1;
                if now == 0 {
                    self.idle.notify_waiters();
                }
                now
            }
            Err(_) => {
                warn!("In-flight counter released more often than acquired");
                0
            }
        }
    }

    /// Current in-flight count
    #[must_use]
    pub fn value(&self) -> usize {
        self.value.load(Ordering::Acquire)
    }

    /// Increment now and decrement when the guard drops
    pub fn guard(self: &Arc<Self>) -> InflightGuard {
        self.increment();
        InflightGuard {
            counter: Arc::clone(self),
        }
    }

    /// Wait until nothing is in flight. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();

            if self.value() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.value() == 0;
            }
        }
    }
}

/// Holds one in-flight slot until dropped
#[must_use = "dropping the guard releases the in-flight slot immediately"]
#[derive(Debug)]
pub struct InflightGuard {
    counter: Arc<InflightCounter>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.decrement();
    }
}

/// Sheds on instantaneous in-flight count
#[derive(Debug)]
pub struct ConcurrencyAggregator {
    counter: Arc<InflightCounter>,
    thresholds: Thresholds,
}

impl ConcurrencyAggregator {
    /// Create an aggregator over `counter`
    #[allow(clippy::cast_precision_loss)]
    pub fn new(config: &ConcurrencyConfig, counter: Arc<InflightCounter>) -> Result<Self> {
        Ok(Self {
            counter,
            thresholds: Thresholds::new(config.lower as f64, config.upper as f64)?,
        })
    }

    /// The counter this aggregator reads
    #[must_use]
    pub fn counter(&self) -> &Arc<InflightCounter> {
        &self.counter
    }

    /// Threshold curve in use
    #[must_use]
    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }
}

impl Aggregator for ConcurrencyAggregator {
    #[allow(clippy::cast_precision_loss)]
    fn aggregate(&self) -> f64 {
        self.thresholds.probability(self.counter.value() as f64)
    }

    fn name(&self) -> &str {
        "concurrency"
    }
}
