//! Runtime options and their environment overrides
//!
//! | Variable | Maps to |
//! |----------|---------|
//! | `STRAND_WORKER_THREADS` | `worker_count` |
//! | `STRAND_POLL_INTERVAL_MS` | `poll_interval` |
//! | `STRAND_SWEEP_INTERVAL` | `reactor.sweep_interval` |
//! | `STRAND_REACTOR_CAPACITY` | `reactor.initial_capacity` |

use super::reactor::ReactorOptions;
use crate::error::RuntimeError;
use std::time::Duration;

/// Environment variable for the worker count
pub const ENV_WORKER_THREADS: &str = "STRAND_WORKER_THREADS";
/// Environment variable for the run-loop sleep, in milliseconds
pub const ENV_POLL_INTERVAL_MS: &str = "STRAND_POLL_INTERVAL_MS";
/// Environment variable for the reactor sweep interval, in polls
pub const ENV_SWEEP_INTERVAL: &str = "STRAND_SWEEP_INTERVAL";
/// Environment variable for the reactor's initial table size
pub const ENV_REACTOR_CAPACITY: &str = "STRAND_REACTOR_CAPACITY";

/// Options for creating a [`Runtime`](super::Runtime)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Worker threads (0 = one per CPU)
    pub worker_count: usize,

    /// Sleep between reactor polls in [`Runtime::run`](super::Runtime::run)
    pub poll_interval: Duration,

    /// Reactor table tuning
    pub reactor: ReactorOptions,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            worker_count: 0,
            poll_interval: Duration::from_millis(10),
            reactor: ReactorOptions::default(),
        }
    }
}

impl RuntimeOptions {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self, RuntimeError> {
        let mut options = Self::default();
        options.apply_env_overrides()?;
        Ok(options)
    }

    /// Overwrite every field whose variable is set in the environment
    pub fn apply_env_overrides(&mut self) -> Result<(), RuntimeError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(
        &mut self,
        read: impl Fn(&'static str) -> Option<String>,
    ) -> Result<(), RuntimeError> {
        if let Some(val) = read(ENV_WORKER_THREADS) {
            self.worker_count = parse_usize(ENV_WORKER_THREADS, &val)?;
        }
        if let Some(val) = read(ENV_POLL_INTERVAL_MS) {
            self.poll_interval = Duration::from_millis(parse_u64(ENV_POLL_INTERVAL_MS, &val)?);
        }
        if let Some(val) = read(ENV_SWEEP_INTERVAL) {
            self.reactor.sweep_interval = parse_u64(ENV_SWEEP_INTERVAL, &val)?;
        }
        if let Some(val) = read(ENV_REACTOR_CAPACITY) {
            self.reactor.initial_capacity = parse_usize(ENV_REACTOR_CAPACITY, &val)?;
        }
        Ok(())
    }

    /// Check the options for values the runtime cannot work with
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.poll_interval.is_zero() {
            return Err(RuntimeError::InvalidOption(
                "poll_interval must be non-zero".into(),
            ));
        }
        self.reactor.validate()
    }

    /// Worker count with 0 resolved to the number of CPUs
    pub fn resolved_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            num_cpus::get()
        } else {
            self.worker_count
        }
    }
}

fn parse_usize(name: &'static str, val: &str) -> Result<usize, RuntimeError> {
    val.trim().parse().map_err(|_| RuntimeError::InvalidEnv {
        name,
        value: val.to_string(),
    })
}

fn parse_u64(name: &'static str, val: &str) -> Result<u64, RuntimeError> {
    val.trim().parse().map_err(|_| RuntimeError::InvalidEnv {
        name,
        value: val.to_string(),
    })
}
