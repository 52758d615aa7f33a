//! Sources for the host load average and the wall clock.

use thiserror::Error;

/// Errors that can occur when querying the load average.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("load average is not available on this platform")]
    Unsupported,
    #[error("failed to read load average: {0}")]
    Query(String),
}

/// Something that can report the host's one-minute load average.
pub trait LoadSource: Send + Sync {
    /// Query the current one-minute load average.
    fn one_minute(&self) -> Result<f64, LoadError>;
}

/// Load average of the local host, read through `sysinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLoad;

impl LoadSource for SystemLoad {
    fn one_minute(&self) -> Result<f64, LoadError> {
        // sysinfo reports zeros on Windows rather than failing
        if !sysinfo::IS_SUPPORTED_SYSTEM || cfg!(windows) {
            return Err(LoadError::Unsupported);
        }

        let load = sysinfo::System::load_average();
        if load.one.is_finite() && load.one >= 0.0 {
            Ok(load.one)
        } else {
            Err(LoadError::Query(format!("unexpected value {}", load.one)))
        }
    }
}

/// Source of the current time in whole Unix seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// Wall clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        chrono::Utc::now().timestamp().max(0) as u64
    }
}
