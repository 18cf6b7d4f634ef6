//! Latency-based shedding (average or percentile)

use std::sync::Arc;
use std::time::Duration;

use super::{Aggregator, Thresholds};
use crate::Result;
use crate::config::LatencyConfig;
use crate::window::{Aggregation, Clock, Reading, RollingWindow, WindowConfig};

/// Sheds on request latency over a rolling window
///
/// Latencies are stored in seconds. Until the window holds
/// `required_points` samples the aggregator reports 0.
#[derive(Debug)]
pub struct LatencyAggregator {
    window: RollingWindow,
    thresholds: Thresholds,
    required_points: u64,
}

impl LatencyAggregator {
    /// Build from configuration; `percentile` selects the window mode
    pub fn new(config: &LatencyConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let thresholds = Thresholds::new(config.lower.as_secs_f64(), config.upper.as_secs_f64())?;
        let aggregation = config
            .percentile
            .map_or(Aggregation::Average, Aggregation::Percentile);
        let window = RollingWindow::with_clock(
            WindowConfig::new(config.bucket_size, config.buckets)
                .with_preallocation_hint(config.preallocation_hint),
            aggregation,
            clock,
        )?;

        Ok(Self {
            window,
            thresholds,
            required_points: config.required_points,
        })
    }

    /// Record one completed request
    pub fn record(&self, latency: Duration) {
        self.window.record(latency.as_secs_f64());
    }

    /// Current window aggregate, in seconds
    #[must_use]
    pub fn reading(&self) -> Option<Reading> {
        self.window.aggregate()
    }

    /// Samples needed before the aggregator acts
    #[must_use]
    pub fn required_points(&self) -> u64 {
        self.required_points
    }
}

impl Aggregator for LatencyAggregator {
    fn aggregate(&self) -> f64 {
        match self.window.aggregate() {
            Some(reading) if reading.points >= self.required_points => {
                self.thresholds.probability(reading.value)
            }
            _ => 0.0,
        }
    }

    fn name(&self) -> &str {
        match self.window.aggregation() {
            Aggregation::Percentile(_) => "percentile_latency",
            _ => "average_latency",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::ManualClock;

    fn average_config() -> LatencyConfig {
        LatencyConfig {
            enabled: true,
            lower: Duration::from_millis(500),
            upper: Duration::from_secs(1),
            bucket_size: Duration::from_secs(1),
            buckets: 10,
            required_points: 5,
            percentile: None,
            preallocation_hint: 0,
        }
    }

    #[test]
    fn test_gated_until_required_points() {
        let agg = LatencyAggregator::new(&average_config(), Arc::new(ManualClock::new())).unwrap();
        for _ in 0..3 {
            agg.record(Duration::from_secs(2));
        }
        let reading = agg.reading().unwrap();
        assert_eq!(reading.points, 3);
        assert!((reading.value - 2.0).abs() < 1e-12);
        assert!(agg.aggregate().abs() < f64::EPSILON);

        agg.record(Duration::from_secs(2));
        agg.record(Duration::from_secs(2));
        assert!((agg.aggregate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_window_fails_open() {
        let agg = LatencyAggregator::new(&average_config(), Arc::new(ManualClock::new())).unwrap();
        assert!(agg.reading().is_none());
        assert!(agg.aggregate().abs() < f64::EPSILON);
    }

    #[test]
    fn test_average_between_thresholds() {
        let agg = LatencyAggregator::new(&average_config(), Arc::new(ManualClock::new())).unwrap();
        for ms in [600, 700, 800, 900, 750] {
            agg.record(Duration::from_millis(ms));
        }
        // mean 750ms -> halfway between 500ms and 1s
        assert!((agg.aggregate() - 0.5).abs() < 1e-9);
        assert_eq!(agg.name(), "average_latency");
    }

    #[test]
    fn test_percentile_mode_tracks_tail() {
        let config = LatencyConfig {
            percentile: Some(95.0),
            required_points: 1,
            lower: Duration::from_millis(50),
            upper: Duration::from_millis(150),
            ..average_config()
        };
        let agg = LatencyAggregator::new(&config, Arc::new(ManualClock::new())).unwrap();
        for ms in 1..=100 {
            agg.record(Duration::from_millis(ms));
        }
        // p95 = 95.05ms -> (95.05 - 50) / 100
        assert!((agg.aggregate() - 0.4505).abs() < 1e-6);
        assert_eq!(agg.name(), "percentile_latency");
    }

    #[test]
    fn test_samples_expire_with_window() {
        let clock = Arc::new(ManualClock::new());
        let config = LatencyConfig {
            required_points: 1,
            ..average_config()
        };
        let agg = LatencyAggregator::new(&config, clock.clone()).unwrap();
        agg.record(Duration::from_secs(5));
        assert!((agg.aggregate() - 1.0).abs() < f64::EPSILON);

        clock.advance(Duration::from_secs(10));
        assert!(agg.aggregate().abs() < f64::EPSILON);
    }

    #[test]
    fn test_construction_validates() {
        let inverted = LatencyConfig {
            lower: Duration::from_secs(2),
            upper: Duration::from_secs(1),
            ..average_config()
        };
        assert!(LatencyAggregator::new(&inverted, Arc::new(ManualClock::new())).is_err());

        let no_buckets = LatencyConfig {
            buckets: 0,
            ..average_config()
        };
        assert!(LatencyAggregator::new(&no_buckets, Arc::new(ManualClock::new())).is_err());

        let bad_percentile = LatencyConfig {
            percentile: Some(-1.0),
            ..average_config()
        };
        assert!(LatencyAggregator::new(&bad_percentile, Arc::new(ManualClock::new())).is_err());
    }
}
