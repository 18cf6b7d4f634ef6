//! Configuration management

use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Load shedding configuration
    pub shedding: SheddingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// How long shutdown waits for in-flight requests
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Which aggregators are enabled, and how
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SheddingConfig {
    /// CPU utilisation aggregator
    pub cpu: CpuConfig,
    /// Request latency aggregator
    pub latency: LatencyConfig,
    /// In-flight request aggregator
    pub concurrency: ConcurrencyConfig,
    /// Path prefixes that are never shed (default: `["/health"]`)
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,
}

fn default_exempt_paths() -> Vec<String> {
    vec!["/health".to_string()]
}

impl Default for SheddingConfig {
    fn default() -> Self {
        Self {
            cpu: CpuConfig::default(),
            latency: LatencyConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            exempt_paths: default_exempt_paths(),
        }
    }
}

/// CPU aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    /// Enable CPU-based shedding
    pub enabled: bool,
    /// Utilisation (0.0-1.0) where shedding starts
    pub lower: f64,
    /// Utilisation (0.0-1.0) where everything is shed
    pub upper: f64,
    /// Time between CPU polls; also the bucket width
    #[serde(with = "humantime_serde")]
    pub polling_interval: Duration,
    /// Number of polls averaged
    pub window_size: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lower: 0.6,
            upper: 0.8,
            polling_interval: Duration::from_secs(1),
            window_size: 10,
        }
    }
}

/// Latency aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Enable latency-based shedding
    pub enabled: bool,
    /// Latency where shedding starts
    #[serde(with = "humantime_serde")]
    pub lower: Duration,
    /// Latency where everything is shed
    #[serde(with = "humantime_serde")]
    pub upper: Duration,
    /// Width of one window bucket
    #[serde(with = "humantime_serde")]
    pub bucket_size: Duration,
    /// Number of buckets in the window
    pub buckets: usize,
    /// Samples needed across the window before the aggregator acts
    pub required_points: u64,
    /// Percentile (0-100) to track; average latency when unset
    pub percentile: Option<f64>,
    /// Expected samples per bucket, used to pre-size percentile storage
    pub preallocation_hint: usize,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lower: Duration::from_millis(500),
            upper: Duration::from_secs(1),
            bucket_size: Duration::from_secs(1),
            buckets: 10,
            required_points: 5,
            percentile: None,
            preallocation_hint: 0,
        }
    }
}

/// Concurrency aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Enable in-flight based shedding
    pub enabled: bool,
    /// In-flight count where shedding starts
    pub lower: u64,
    /// In-flight count where everything is shed
    pub upper: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lower: 2500,
            upper: 5000,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // LOAD_SHEDDER_SHEDDING__CPU__ENABLED=true etc.
        figment = figment.merge(Env::prefixed("LOAD_SHEDDER_").split("__"));

        figment.extract().map_err(|e| Error::Config(e.to_string()))
    }

    /// Names of the aggregators this configuration enables
    #[must_use]
    pub fn enabled_aggregators(&self) -> Vec<&'static str> {
        let shedding = &self.shedding;
        let mut names = Vec::new();
        if shedding.cpu.enabled {
            names.push("cpu");
        }
        if shedding.latency.enabled {
            names.push(if shedding.latency.percentile.is_some() {
                "percentile_latency"
            } else {
                "average_latency"
            });
        }
        if shedding.concurrency.enabled {
            names.push("concurrency");
        }
        names
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Why a duration string was rejected
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DurationError {
        /// Not a non-negative integer with a known unit suffix
        #[error("invalid duration '{0}': expected e.g. 250us, 100ms, 30s or 5m")]
        Invalid(String),

        /// Does not fit in a `Duration`
        #[error("duration '{0}' is too large")]
        Overflow(String),
    }

    /// Serialize Duration to a human-readable string ("250us", "100ms", "30s")
    ///
    /// Precision below a microsecond is dropped.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let nanos = duration.subsec_nanos();
        if nanos == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else if nanos % 1_000_000 == 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}us", duration.as_micros()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms", "250us")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse(s: &str) -> Result<Duration, DurationError> {
        let s = s.trim();
        let number = |digits: &str| {
            digits
                .trim()
                .parse::<u64>()
                .map_err(|_| DurationError::Invalid(s.to_string()))
        };

        // Two-letter suffixes have to be tried before "s" and "m"
        if let Some(us) = s.strip_suffix("us") {
            number(us).map(Duration::from_micros)
        } else if let Some(ms) = s.strip_suffix("ms") {
            number(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            number(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            number(mins)?
                .checked_mul(60)
                .map(Duration::from_secs)
                .ok_or_else(|| DurationError::Overflow(s.to_string()))
        } else {
            number(s).map(Duration::from_secs)
        }
    }
}
