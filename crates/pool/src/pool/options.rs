//! Pool configuration
//!
//! [`PoolConfig`] is the loosely typed input (from code, serde or the
//! environment). [`PoolOptions`] is its normalized, immutable form: out of
//! range values are clamped and invalid numbers fall back to safe values
//! instead of being rejected.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};
use crate::protocol::call::MAX_COPY_OVERHEAD;

pub const DEFAULT_POOL_NAME: &str = "worker-pool";
pub const DEFAULT_MIN_IDLE_WORKERS: usize = 1;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_CREATION_DELAY: Duration = Duration::ZERO;

const ENV_PREFIX: &str = "OFFLOAD_POOL_";

/// Options forwarded verbatim to the worker factory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Worker name (defaults to the pool name)
    pub name: Option<String>,

    /// Stack size for thread-backed workers
    pub stack_size: Option<usize>,
}

impl WorkerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }
}

/// Raw pool configuration
///
/// Unset fields take their defaults during normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool name, used in logs and errors
    pub name: Option<String>,

    /// Upper bound on live workers
    pub max_workers: Option<i64>,

    /// Idle workers kept alive by idle reclamation
    pub min_idle_workers: Option<i64>,

    /// Quiet period before surplus idle workers are destroyed (0 disables)
    pub idle_timeout_ms: Option<f64>,

    /// Deadline for the readiness handshake (0 disables)
    pub init_timeout_ms: Option<f64>,

    /// Grace period before creating a worker under load
    pub creation_delay_ms: Option<f64>,

    /// Slack above which binary arguments are compacted and transferred
    pub max_copy_overhead: Option<i64>,

    /// Options forwarded to the worker factory
    pub worker: WorkerOptions,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `OFFLOAD_POOL_NAME`: Pool name
    /// - `OFFLOAD_POOL_MAX_WORKERS`: Maximum number of workers
    /// - `OFFLOAD_POOL_MIN_IDLE_WORKERS`: Idle workers kept alive
    /// - `OFFLOAD_POOL_IDLE_TIMEOUT_MS`: Idle reclamation delay
    /// - `OFFLOAD_POOL_INIT_TIMEOUT_MS`: Readiness handshake deadline
    /// - `OFFLOAD_POOL_CREATION_DELAY_MS`: Creation grace period
    /// - `OFFLOAD_POOL_MAX_COPY_OVERHEAD`: Copy-vs-transfer slack in bytes
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`PoolConfig::from_env`] with a custom variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(|value| (format!("{ENV_PREFIX}{name}"), value))
        };

        let integer = |name: &str| -> Result<Option<i64>> {
            var(name)
                .map(|(key, value)| {
                    value.parse::<i64>().map_err(|_| {
                        PoolError::configuration(format!("{key} is not an integer: {value:?}"))
                    })
                })
                .transpose()
        };
        let millis = |name: &str| -> Result<Option<f64>> {
            var(name)
                .map(|(key, value)| {
                    value.parse::<f64>().map_err(|_| {
                        PoolError::configuration(format!("{key} is not a number: {value:?}"))
                    })
                })
                .transpose()
        };

        Ok(Self {
            name: var("NAME").map(|(_, value)| value),
            max_workers: integer("MAX_WORKERS")?,
            min_idle_workers: integer("MIN_IDLE_WORKERS")?,
            idle_timeout_ms: millis("IDLE_TIMEOUT_MS")?,
            init_timeout_ms: millis("INIT_TIMEOUT_MS")?,
            creation_delay_ms: millis("CREATION_DELAY_MS")?,
            max_copy_overhead: integer("MAX_COPY_OVERHEAD")?,
            worker: WorkerOptions::default(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_max_workers(mut self, max: i64) -> Self {
        self.max_workers = Some(max);
        self
    }

    pub fn with_min_idle_workers(mut self, min: i64) -> Self {
        self.min_idle_workers = Some(min);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = Some(as_millis_f64(timeout));
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout_ms = Some(as_millis_f64(timeout));
        self
    }

    pub fn with_creation_delay(mut self, delay: Duration) -> Self {
        self.creation_delay_ms = Some(as_millis_f64(delay));
        self
    }

    pub fn with_max_copy_overhead(mut self, bytes: usize) -> Self {
        self.max_copy_overhead = Some(i64::try_from(bytes).unwrap_or(i64::MAX));
        self
    }

    pub fn with_worker_options(mut self, options: WorkerOptions) -> Self {
        self.worker = options;
        self
    }
}

/// Normalized pool options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    pub name: String,

    /// Always at least 1
    pub max_workers: usize,

    /// Always within `0..=max_workers`
    pub min_idle_workers: usize,

    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,

    #[serde(with = "duration_millis")]
    pub init_timeout: Duration,

    #[serde(with = "duration_millis")]
    pub creation_delay: Duration,

    pub max_copy_overhead: usize,

    pub worker: WorkerOptions,
}

impl Default for PoolOptions {
    fn default() -> Self {
        let max_workers = default_max_workers();
        Self {
            name: DEFAULT_POOL_NAME.to_string(),
            max_workers,
            min_idle_workers: DEFAULT_MIN_IDLE_WORKERS.min(max_workers),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            creation_delay: DEFAULT_CREATION_DELAY,
            max_copy_overhead: MAX_COPY_OVERHEAD,
            worker: WorkerOptions::default().with_name(DEFAULT_POOL_NAME),
        }
    }
}

impl PoolOptions {
    /// Normalize a raw configuration
    ///
    /// Every numeric field is coerced. The name is the one field that is not:
    /// a blank name is a configuration error rather than being passed
    /// through to worker threads and log spans.
    pub fn from_config(config: &PoolConfig) -> Result<Self> {
        let name = match &config.name {
            Some(name) if name.trim().is_empty() => {
                return Err(PoolError::configuration("pool name must not be empty"));
            }
            Some(name) => name.clone(),
            None => DEFAULT_POOL_NAME.to_string(),
        };

        let max_workers = config
            .max_workers
            .map_or_else(default_max_workers, |max| count(max).max(1));
        let min_idle_workers = config
            .min_idle_workers
            .map_or(DEFAULT_MIN_IDLE_WORKERS, count)
            .min(max_workers);

        let mut worker = config.worker.clone();
        if worker.name.is_none() {
            worker.name = Some(name.clone());
        }

        Ok(Self {
            name,
            max_workers,
            min_idle_workers,
            idle_timeout: millis(config.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT),
            init_timeout: millis(config.init_timeout_ms, DEFAULT_INIT_TIMEOUT),
            creation_delay: millis(config.creation_delay_ms, DEFAULT_CREATION_DELAY),
            max_copy_overhead: config.max_copy_overhead.map_or(MAX_COPY_OVERHEAD, count),
            worker,
        })
    }
}

/// Available parallelism minus one for the host thread, at least 1
pub fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

fn count(value: i64) -> usize {
    usize::try_from(value.max(0)).unwrap_or(usize::MAX)
}

fn millis(value: Option<f64>, default: Duration) -> Duration {
    match value {
        None => default,
        Some(ms) if !ms.is_finite() || ms <= 0.0 => Duration::ZERO,
        Some(ms) => {
            let nanos = (ms * 1_000_000.0).round();
            if nanos >= u64::MAX as f64 {
                Duration::MAX
            } else {
                Duration::from_nanos(nanos as u64)
            }
        }
    }
}

fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
