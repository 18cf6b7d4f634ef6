//! Error types for the load shedder

use std::io;

use thiserror::Error;

/// Result type alias for the load shedder
pub type Result<T> = std::result::Result<T, Error>;

/// Load shedder errors
///
/// Every variant except [`Error::Io`] and [`Error::Internal`] is a
/// construction-time failure. The per-request decision path never errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Threshold pair where `lower >= upper` (or either is not a number)
    #[error("Invalid thresholds: lower ({lower}) must be strictly below upper ({upper})")]
    InvalidThreshold {
        /// Lower threshold
        lower: f64,
        /// Upper threshold
        upper: f64,
    },

    /// Rolling window parameters out of range
    #[error("Invalid window: {0}")]
    InvalidWindow(String),

    /// Percentile outside `[0, 100]`
    #[error("Invalid percentile {0}: must be within [0, 100]")]
    InvalidPercentile(f64),

    /// A background task could not be started
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error was raised while validating construction parameters
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::InvalidThreshold { .. }
                | Self::InvalidWindow(_)
                | Self::InvalidPercentile(_)
        )
    }
}
