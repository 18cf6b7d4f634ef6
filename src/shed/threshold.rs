//! Two-threshold proportional rejection curve

use serde::Serialize;

use crate::{Error, Result};

/// Maps a metric value onto a rejection probability
///
/// ```text
/// value <= lower          -> 0
/// value >= upper          -> 1
/// otherwise               -> (value - lower) / (upper - lower)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    lower: f64,
    upper: f64,
}

impl Thresholds {
    /// Create a curve. Fails unless `lower < upper`.
    pub fn new(lower: f64, upper: f64) -> Result<Self> {
        // NaN on either side also fails this comparison
        if lower < upper {
            Ok(Self { lower, upper })
        } else {
            Err(Error::InvalidThreshold { lower, upper })
        }
    }

    /// Lower bound, where shedding starts
    #[must_use]
    pub fn lower(&self) -> f64 {
        self.lower
    }

    /// Upper bound, where everything is shed
    #[must_use]
    pub fn upper(&self) -> f64 {
        self.upper
    }

    /// Rejection probability for `value`
    #[must_use]
    pub fn probability(&self, value: f64) -> f64 {
        if value.is_nan() || value <= self.lower {
            0.0
        } else if value >= self.upper {
            1.0
        } else {
            (value - self.lower) / (self.upper - self.lower)
        }
    }
}
