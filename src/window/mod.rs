//! Time-bucketed rolling window
//!
//! A [`RollingWindow`] is a ring of `buckets` slots, each covering
//! `bucket_size` of time. Rotation is lazy: every `record` and `aggregate`
//! first works out how many bucket-widths have passed since the last access
//! and clears that many of the oldest slots (or all of them, once a full
//! span has passed). No background timer is involved.
//!
//! The whole ring sits behind one mutex, so a rotation and an insertion can
//! never interleave and a reader always folds a consistent set of buckets.
//!
//! # Percentiles
//!
//! In [`Aggregation::Percentile`] mode every bucket keeps its raw samples.
//! Aggregation merges the retained values, sorts them with
//! [`f64::total_cmp`] and applies the inclusive linear-interpolation method:
//!
//! ```text
//! rank  = p / 100 * (n - 1)
//! value = v[floor(rank)] + (v[ceil(rank)] - v[floor(rank)]) * frac(rank)
//! ```
//!
//! The result depends only on the multiset of retained values, never on
//! insertion order.

mod bucket;
mod clock;

pub use clock::{Clock, ManualClock, MonotonicClock};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use self::bucket::Bucket;
use crate::{Error, Result};

/// How retained samples fold into one value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    /// Sum of all samples
    Sum,
    /// Arithmetic mean of all samples
    Average,
    /// Inclusive percentile, `0.0..=100.0`
    Percentile(f64),
}

impl Aggregation {
    fn keeps_values(self) -> bool {
        matches!(self, Self::Percentile(_))
    }

    fn validate(self) -> Result<()> {
        match self {
            Self::Percentile(p) if !(0.0..=100.0).contains(&p) => Err(Error::InvalidPercentile(p)),
            _ => Ok(()),
        }
    }
}

/// Shape of a rolling window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    /// Width of one bucket
    pub bucket_size: Duration,
    /// Number of buckets retained
    pub buckets: usize,
    /// Expected samples per bucket; sizes percentile storage up front
    pub preallocation_hint: usize,
}

impl WindowConfig {
    /// Create a window shape with no preallocation
    #[must_use]
    pub fn new(bucket_size: Duration, buckets: usize) -> Self {
        Self {
            bucket_size,
            buckets,
            preallocation_hint: 0,
        }
    }

    /// Set the per-bucket preallocation hint
    #[must_use]
    pub fn with_preallocation_hint(mut self, hint: usize) -> Self {
        self.preallocation_hint = hint;
        self
    }

    /// Total time covered by the window
    #[must_use]
    pub fn span(&self) -> Duration {
        self.bucket_size
            .saturating_mul(u32::try_from(self.buckets).unwrap_or(u32::MAX))
    }

    /// Reject zero-width buckets and empty rings
    pub fn validate(&self) -> Result<()> {
        if self.buckets == 0 {
            return Err(Error::InvalidWindow("bucket count must be positive".to_string()));
        }
        if self.bucket_size.is_zero() {
            return Err(Error::InvalidWindow("bucket size must be positive".to_string()));
        }
        Ok(())
    }
}

/// Aggregate over the retained span
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    /// Aggregated value
    pub value: f64,
    /// Number of samples folded into `value`
    pub points: u64,
}

struct Ring {
    buckets: Vec<Bucket>,
    /// Slot currently accepting writes
    head: usize,
    /// Absolute bucket index of `head`
    head_index: u64,
}

impl Ring {
    fn rotate(&mut self, index: u64) {
        if index <= self.head_index {
            return;
        }
        let elapsed = index - self.head_index;
        let len = self.buckets.len();
        if elapsed >= len as u64 {
            for bucket in &mut self.buckets {
                bucket.reset();
            }
        } else {
            for _ in 0..elapsed {
                self.head = (self.head + 1) % len;
                self.buckets[self.head].reset();
            }
        }
        self.head_index = index;
    }
}

/// Concurrency-safe rolling window of numeric samples
pub struct RollingWindow {
    aggregation: Aggregation,
    config: WindowConfig,
    bucket_nanos: u128,
    epoch: Duration,
    clock: Arc<dyn Clock>,
    ring: Mutex<Ring>,
}

impl RollingWindow {
    /// Create a window using the process monotonic clock
    pub fn new(config: WindowConfig, aggregation: Aggregation) -> Result<Self> {
        Self::with_clock(config, aggregation, Arc::new(MonotonicClock::new()))
    }

    /// Create a window driven by `clock`
    pub fn with_clock(
        config: WindowConfig,
        aggregation: Aggregation,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        aggregation.validate()?;

        let keep = aggregation.keeps_values();
        let buckets = (0..config.buckets)
            .map(|_| Bucket::new(keep, config.preallocation_hint))
            .collect();

        Ok(Self {
            aggregation,
            config,
            bucket_nanos: config.bucket_size.as_nanos(),
            epoch: clock.now(),
            clock,
            ring: Mutex::new(Ring {
                buckets,
                head: 0,
                head_index: 0,
            }),
        })
    }

    /// Aggregation mode
    #[must_use]
    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    /// Window shape
    #[must_use]
    pub fn config(&self) -> WindowConfig {
        self.config
    }

    fn current_index(&self) -> u64 {
        let since = self.clock.now().saturating_sub(self.epoch).as_nanos();
        u64::try_from(since / self.bucket_nanos).unwrap_or(u64::MAX)
    }

    /// Add a sample to the active bucket. Non-finite values are dropped.
    pub fn record(&self, value: f64) {
        if !value.is_finite() {
            tracing::trace!(value, "Ignoring non-finite sample");
            return;
        }
        let index = self.current_index();
        let mut ring = self.ring.lock();
        ring.rotate(index);
        let head = ring.head;
        ring.buckets[head].record(value);
    }

    /// Fold every retained bucket. `None` means the window holds no samples.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn aggregate(&self) -> Option<Reading> {
        let index = self.current_index();

        let (points, sum, values) = {
            let mut ring = self.ring.lock();
            ring.rotate(index);

            let mut points = 0u64;
            let mut sum = 0.0;
            for bucket in ring.buckets.iter().filter(|b| !b.is_empty()) {
                points += bucket.count;
                sum += bucket.sum;
            }

            let values = if self.aggregation.keeps_values() && points > 0 {
                let mut merged = Vec::with_capacity(usize::try_from(points).unwrap_or(0));
                for bucket in &ring.buckets {
                    merged.extend_from_slice(&bucket.values);
                }
                merged
            } else {
                Vec::new()
            };

            (points, sum, values)
        };

        if points == 0 {
            return None;
        }

        let value = match self.aggregation {
            Aggregation::Sum => sum,
            Aggregation::Average => sum / points as f64,
            Aggregation::Percentile(p) => {
                let mut values = values;
                values.sort_unstable_by(f64::total_cmp);
                percentile_of_sorted(&values, p)?
            }
        };

        Some(Reading { value, points })
    }

    /// Samples currently inside the span
    #[must_use]
    pub fn points(&self) -> u64 {
        let index = self.current_index();
        let mut ring = self.ring.lock();
        ring.rotate(index);
        ring.buckets.iter().map(|b| b.count).sum()
    }

    /// Drop every sample
    pub fn reset(&self) {
        let mut ring = self.ring.lock();
        for bucket in &mut ring.buckets {
            bucket.reset();
        }
    }
}

impl std::fmt::Debug for RollingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollingWindow")
            .field("aggregation", &self.aggregation)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Inclusive percentile of an ascending slice, `p` in `0.0..=100.0`
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub(crate) fn percentile_of_sorted(sorted: &[f64], p: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = (p / 100.0).clamp(0.0, 1.0) * last as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - rank.floor();
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_window(
        bucket_size: Duration,
        buckets: usize,
        aggregation: Aggregation,
    ) -> (Arc<ManualClock>, RollingWindow) {
        let clock = Arc::new(ManualClock::new());
        let window = RollingWindow::with_clock(
            WindowConfig::new(bucket_size, buckets),
            aggregation,
            clock.clone(),
        )
        .unwrap();
        (clock, window)
    }

    #[test]
    fn test_empty_window_reports_no_data() {
        let (_clock, window) = manual_window(Duration::from_secs(1), 10, Aggregation::Average);
        assert_eq!(window.aggregate(), None);
        assert_eq!(window.points(), 0);
    }

    #[test]
    fn test_average_of_zero_is_not_no_data() {
        let (_clock, window) = manual_window(Duration::from_secs(1), 10, Aggregation::Average);
        window.record(0.0);
        assert_eq!(window.aggregate(), Some(Reading { value: 0.0, points: 1 }));
    }

    #[test]
    fn test_average_spans_buckets() {
        let (clock, window) = manual_window(Duration::from_secs(1), 10, Aggregation::Average);
        window.record(1.0);
        clock.advance(Duration::from_secs(1));
        window.record(3.0);
        clock.advance(Duration::from_secs(1));
        window.record(5.0);

        let reading = window.aggregate().unwrap();
        assert_eq!(reading.points, 3);
        assert!((reading.value - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_sum_mode_adds_samples() {
        let (_clock, window) = manual_window(Duration::from_secs(1), 4, Aggregation::Sum);
        window.record(1.5);
        window.record(2.0);
        let reading = window.aggregate().unwrap();
        assert!((reading.value - 3.5).abs() < 1e-12);
    }

    #[test]
    fn test_samples_expire_after_full_span() {
        let (clock, window) = manual_window(Duration::from_secs(1), 10, Aggregation::Average);
        window.record(42.0);
        clock.advance(Duration::from_secs(9));
        assert_eq!(window.points(), 1);

        clock.advance(Duration::from_secs(1));
        assert_eq!(window.aggregate(), None);
    }

    #[test]
    fn test_long_idle_clears_everything() {
        let (clock, window) = manual_window(Duration::from_millis(100), 5, Aggregation::Sum);
        for _ in 0..5 {
            window.record(1.0);
            clock.advance(Duration::from_millis(100));
        }
        clock.advance(Duration::from_secs(3600));
        assert_eq!(window.aggregate(), None);

        window.record(7.0);
        assert_eq!(window.aggregate(), Some(Reading { value: 7.0, points: 1 }));
    }

    #[test]
    fn test_partial_rotation_drops_only_oldest() {
        let (clock, window) = manual_window(Duration::from_secs(1), 3, Aggregation::Sum);
        window.record(1.0);
        clock.advance(Duration::from_secs(1));
        window.record(10.0);
        clock.advance(Duration::from_secs(1));
        window.record(100.0);
        assert!((window.aggregate().unwrap().value - 111.0).abs() < 1e-12);

        clock.advance(Duration::from_secs(1));
        assert!((window.aggregate().unwrap().value - 110.0).abs() < 1e-12);

        clock.advance(Duration::from_secs(1));
        assert!((window.aggregate().unwrap().value - 100.0).abs() < 1e-12);
    }

    #[test]
    fn test_sample_lands_in_bucket_active_at_record_time() {
        let (clock, window) = manual_window(Duration::from_secs(1), 2, Aggregation::Sum);
        clock.advance(Duration::from_millis(1999));
        window.record(5.0);
        clock.advance(Duration::from_millis(2));
        assert_eq!(window.points(), 1);
        clock.advance(Duration::from_secs(1));
        assert_eq!(window.points(), 0);
    }

    #[test]
    fn test_percentile_matches_inclusive_interpolation() {
        let (_clock, window) =
            manual_window(Duration::from_secs(1), 10, Aggregation::Percentile(95.0));
        for i in 1..=100 {
            window.record(f64::from(i));
        }
        let reading = window.aggregate().unwrap();
        assert_eq!(reading.points, 100);
        // rank = 0.95 * 99 = 94.05 -> 95 + 0.05 * (96 - 95)
        assert!((reading.value - 95.05).abs() < 1e-9, "got {}", reading.value);
    }

    #[test]
    fn test_percentile_ignores_insertion_order() {
        let (clock, forward) =
            manual_window(Duration::from_secs(1), 10, Aggregation::Percentile(90.0));
        let backward = RollingWindow::with_clock(
            WindowConfig::new(Duration::from_secs(1), 10),
            Aggregation::Percentile(90.0),
            clock.clone(),
        )
        .unwrap();

        for i in 0..37 {
            forward.record(f64::from(i * 7 % 37));
            if i % 5 == 0 {
                clock.advance(Duration::from_millis(300));
            }
        }
        for i in (0..37).rev() {
            backward.record(f64::from(i * 7 % 37));
        }

        assert_eq!(forward.aggregate(), backward.aggregate());
    }

    #[test]
    fn test_percentile_extremes() {
        let (_clock, p0) = manual_window(Duration::from_secs(1), 2, Aggregation::Percentile(0.0));
        let (_clock, p100) =
            manual_window(Duration::from_secs(1), 2, Aggregation::Percentile(100.0));
        for v in [4.0, 2.0, 9.0] {
            p0.record(v);
            p100.record(v);
        }
        assert!((p0.aggregate().unwrap().value - 2.0).abs() < f64::EPSILON);
        assert!((p100.aggregate().unwrap().value - 9.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_percentile_single_sample() {
        assert_eq!(percentile_of_sorted(&[3.0], 50.0), Some(3.0));
        assert_eq!(percentile_of_sorted(&[], 50.0), None);
        assert_eq!(percentile_of_sorted(&[1.0, 2.0], 50.0), Some(1.5));
    }

    #[test]
    fn test_preallocation_hint_does_not_change_results() {
        let clock = Arc::new(ManualClock::new());
        let plain = RollingWindow::with_clock(
            WindowConfig::new(Duration::from_secs(1), 4),
            Aggregation::Percentile(50.0),
            clock.clone(),
        )
        .unwrap();
        let hinted = RollingWindow::with_clock(
            WindowConfig::new(Duration::from_secs(1), 4).with_preallocation_hint(1024),
            Aggregation::Percentile(50.0),
            clock,
        )
        .unwrap();
        for v in [5.0, 1.0, 3.0, 8.0] {
            plain.record(v);
            hinted.record(v);
        }
        assert_eq!(plain.aggregate(), hinted.aggregate());
    }

    #[test]
    fn test_non_finite_samples_are_ignored() {
        let (_clock, window) = manual_window(Duration::from_secs(1), 2, Aggregation::Average);
        window.record(f64::NAN);
        window.record(f64::INFINITY);
        window.record(2.0);
        assert_eq!(window.aggregate(), Some(Reading { value: 2.0, points: 1 }));
    }

    #[test]
    fn test_reset_clears_samples() {
        let (_clock, window) = manual_window(Duration::from_secs(1), 2, Aggregation::Sum);
        window.record(1.0);
        window.reset();
        assert_eq!(window.aggregate(), None);
    }

    #[test]
    fn test_invalid_shapes_are_rejected() {
        let zero_buckets =
            RollingWindow::new(WindowConfig::new(Duration::from_secs(1), 0), Aggregation::Sum);
        assert!(matches!(zero_buckets, Err(Error::InvalidWindow(_))));

        let zero_width = RollingWindow::new(WindowConfig::new(Duration::ZERO, 4), Aggregation::Sum);
        assert!(matches!(zero_width, Err(Error::InvalidWindow(_))));

        let bad_percentile = RollingWindow::new(
            WindowConfig::new(Duration::from_secs(1), 4),
            Aggregation::Percentile(101.0),
        );
        assert!(matches!(bad_percentile, Err(Error::InvalidPercentile(_))));

        let nan_percentile = RollingWindow::new(
            WindowConfig::new(Duration::from_secs(1), 4),
            Aggregation::Percentile(f64::NAN),
        );
        assert!(nan_percentile.is_err());
    }

    #[test]
    fn test_span_is_bucket_size_times_count() {
        let config = WindowConfig::new(Duration::from_millis(250), 8);
        assert_eq!(config.span(), Duration::from_secs(2));
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        let (_clock, window) = manual_window(Duration::from_secs(1), 4, Aggregation::Sum);
        let window = Arc::new(window);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let window = Arc::clone(&window);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        window.record(1.0);
                        let _ = window.aggregate();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reading = window.aggregate().unwrap();
        assert_eq!(reading.points, 8000);
        assert!((reading.value - 8000.0).abs() < 1e-9);
    }

    #[test]
    fn test_rotation_racing_writers_loses_nothing() {
        // 100s span; the clock moves at most 5s, so nothing expires
        let (clock, window) = manual_window(Duration::from_millis(1), 100_000, Aggregation::Sum);
        let window = Arc::new(window);
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let advancer = {
            let clock = Arc::clone(&clock);
            std::thread::spawn(move || {
                for _ in 0..5000 {
                    clock.advance(Duration::from_millis(1));
                    std::thread::yield_now();
                }
            })
        };

        let reader = {
            let window = Arc::clone(&window);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut last = 0;
                while !done.load(std::sync::atomic::Ordering::Acquire) {
                    let points = window.aggregate().map_or(0, |r| r.points);
                    assert!(points >= last, "points went backwards: {last} -> {points}");
                    last = points;
                }
            })
        };

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let window = Arc::clone(&window);
                std::thread::spawn(move || {
                    for _ in 0..5000 {
                        window.record(1.0);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        advancer.join().unwrap();
        done.store(true, std::sync::atomic::Ordering::Release);
        reader.join().unwrap();

        let reading = window.aggregate().unwrap();
        assert_eq!(reading.points, 40_000);
        assert!((reading.value - 40_000.0).abs() < 1e-9);
        assert_eq!(window.points(), 40_000);
    }
}
