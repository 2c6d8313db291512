//! Runtime configuration

use std::time::Duration;

/// Environment variable overriding the worker count (like `GOMAXPROCS`)
pub const ENV_WORKERS: &str = "STRAND_WORKERS";

/// Environment variable seeding the runtime-scoped random source
pub const ENV_SEED: &str = "STRAND_SEED";

/// Default idle park timeout for workers with nothing to run
pub const DEFAULT_PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// Default fairness tick: every Nth dispatch checks the global queue first
pub const DEFAULT_FAIRNESS_TICK: u32 = 61;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Worker count must be at least one once resolved
    #[error("worker_threads must be >= 1")]
    NoWorkers,

    /// Fairness tick of zero would disable local queues entirely
    #[error("fairness_tick must be >= 1")]
    ZeroFairnessTick,

    /// An environment variable held something unparsable
    #[error("{name}={value:?} is not a valid unsigned integer")]
    InvalidEnv {
        /// Variable name
        name: &'static str,
        /// Raw value
        value: String,
    },
}

/// Runtime configuration
///
/// The worker count is fixed once the runtime starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = available hardware parallelism)
    pub worker_threads: usize,

    /// Worker thread name prefix; threads are named `{prefix}-{index}`
    pub thread_name_prefix: String,

    /// Seed for the runtime-scoped random source used by `Select`
    /// (None = seeded from entropy)
    pub seed: Option<u64>,

    /// How long an idle worker parks before re-scanning peers for work
    pub park_timeout: Duration,

    /// Every Nth dispatch a worker polls the global queue before its own
    pub fairness_tick: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            thread_name_prefix: "strand-worker".to_string(),
            seed: None,
            park_timeout: DEFAULT_PARK_TIMEOUT,
            fairness_tick: DEFAULT_FAIRNESS_TICK,
        }
    }
}

impl RuntimeConfig {
    /// Default configuration with `STRAND_WORKERS` / `STRAND_SEED` applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(workers) = read_env(ENV_WORKERS)? {
            config.worker_threads = workers as usize;
        }
        if let Some(seed) = read_env(ENV_SEED)? {
            config.seed = Some(seed);
        }
        Ok(config)
    }

    /// Resolve `worker_threads == 0` to the machine's parallelism
    pub fn resolved_workers(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }

    /// Check the configuration and resolve automatic values
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        self.worker_threads = self.resolved_workers();
        if self.worker_threads == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.fairness_tick == 0 {
            return Err(ConfigError::ZeroFairnessTick);
        }
        Ok(self)
    }
}

fn read_env(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.worker_threads, 0);
        assert_eq!(config.seed, None);
        assert_eq!(config.fairness_tick, DEFAULT_FAIRNESS_TICK);
    }

    #[test]
    fn test_validate_resolves_auto_workers() {
        let config = RuntimeConfig::default().validate().unwrap();
        assert_eq!(config.worker_threads, num_cpus::get());
    }

    #[test]
    fn test_validate_rejects_zero_tick() {
        let config = RuntimeConfig {
            worker_threads: 2,
            fairness_tick: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroFairnessTick));
    }

    #[test]
    fn test_explicit_workers_kept() {
        let config = RuntimeConfig {
            worker_threads: 3,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap().worker_threads, 3);
    }
}
