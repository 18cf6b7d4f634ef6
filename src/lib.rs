//! Load Shedder Library
//!
//! Admission control for request-serving processes: each request is
//! accepted or rejected up front, with a rejection probability that grows
//! in proportion to measured load. Overload degrades gracefully instead of
//! falling off a cliff.
//!
//! # Features
//!
//! - **Rolling windows**: lazily rotated, time-bucketed sum / average /
//!   percentile aggregation, safe under concurrent writers
//! - **Aggregators**: CPU utilisation, average or percentile latency,
//!   in-flight concurrency, plus any custom [`shed::Aggregator`]
//! - **Decision engine**: max-combination across aggregators, one random
//!   draw per request, passthrough when nothing is configured
//! - **axum middleware**: 503 rejection by default, exempt paths, latency and
//!   concurrency feedback on every exit path
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use load_shedder::{config::ConcurrencyConfig, middleware::with_load_shedding, shed::LoadShedder};
//!
//! let shedder = LoadShedder::builder()
//!     .concurrency(ConcurrencyConfig { enabled: true, lower: 2500, upper: 5000 })
//!     .exempt_path("/health")
//!     .build()?;
//! let app = with_load_shedding(router, Arc::new(shedder));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod middleware;
pub mod server;
pub mod shed;
pub mod stats;
pub mod window;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
