//! Per-scope limit thresholds and the cached load-average sample.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use super::sampler::LoadSource;

/// Default number of seconds between load-average samples.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 5;

/// Limit thresholds for one configuration scope.
///
/// A value of zero disables the corresponding dimension; it never means
/// "reject everything".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitsConfig {
    /// Maximum concurrent connections from a single client address
    pub per_ip_limit: u32,
    /// Maximum concurrent connections to a single virtual host
    pub per_vhost_limit: u32,
    /// Maximum concurrent connections per user identifier (parsed, not enforced)
    pub per_user_limit: u32,
    /// Maximum one-minute load average
    pub load_limit: f64,
    /// Seconds between load-average samples
    pub refresh_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            per_ip_limit: 0,
            per_vhost_limit: 0,
            per_user_limit: 0,
            load_limit: 0.0,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
        }
    }
}

impl LimitsConfig {
    /// Whether any connection-count dimension is enabled.
    pub fn limits_connections(&self) -> bool {
        self.per_ip_limit > 0 || self.per_vhost_limit > 0
    }

    /// Whether the load-average dimension is enabled.
    pub fn limits_load(&self) -> bool {
        self.load_limit != 0.0
    }
}

/// Last known one-minute load average and when it was taken.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadSample {
    /// One-minute load average
    pub value: f64,
    /// Unix seconds of the sample, zero if no sample has ever succeeded
    pub sampled_at: u64,
}

/// The configuration record for one scope.
///
/// Thresholds are fixed once the record is built; only the load sample
/// changes afterwards.
#[derive(Debug)]
pub struct LimitsRecord {
    config: LimitsConfig,
    sample: Mutex<LoadSample>,
}

impl LimitsRecord {
    /// Create a record and take an initial load sample.
    ///
    /// If the initial query fails the sample stays zeroed, which makes the
    /// first request that needs it refresh immediately.
    pub fn new(config: LimitsConfig, source: &dyn LoadSource, now: u64) -> Self {
        let sample = match source.one_minute() {
            Ok(value) => LoadSample {
                value,
                sampled_at: now,
            },
            Err(e) => {
                debug!(error = %e, "Initial load average sample failed");
                LoadSample::default()
            }
        };

        Self::with_sample(config, sample)
    }

    /// Create a record with a known sample.
    pub fn with_sample(config: LimitsConfig, sample: LoadSample) -> Self {
        Self {
            config,
            sample: Mutex::new(sample),
        }
    }

    /// The thresholds of this scope.
    pub fn config(&self) -> &LimitsConfig {
        &self.config
    }

    /// The cached load sample, without refreshing it.
    pub fn sample(&self) -> LoadSample {
        *self.sample.lock()
    }

    /// Return the current load sample, refreshing it first if it is older
    /// than the refresh interval.
    ///
    /// A failed query keeps the previous sample and timestamp. The query runs
    /// without holding the cache lock, so concurrent callers may both refresh;
    /// the later write wins and the timestamp never moves backwards.
    pub fn maybe_refresh(&self, source: &dyn LoadSource, now: u64) -> f64 {
        let cached = self.sample();
        if now.saturating_sub(cached.sampled_at) <= self.config.refresh_interval_secs {
            return cached.value;
        }

        match source.one_minute() {
            Ok(value) => {
                let mut sample = self.sample.lock();
                if now >= sample.sampled_at {
                    *sample = LoadSample {
                        value,
                        sampled_at: now,
                    };
                }
                trace!(load = sample.value, sampled_at = sample.sampled_at, "Refreshed load average");
                sample.value
            }
            Err(e) => {
                debug!(error = %e, stale = cached.value, "Load average query failed, keeping cached sample");
                self.sample().value
            }
        }
    }
}
