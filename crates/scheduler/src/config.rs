//! Scheduler configuration.
//!
//! Defaults suit a single process polling once a second. Every field can be
//! overridden from the environment:
//!
//! - `TASQUE_POLLING_INTERVAL_MS`: poll loop interval (default: 1000)
//! - `TASQUE_WORKER_THREADS`: worker pool size, at least 1 (default: 4)
//! - `TASQUE_CLAIM_TIMEOUT_SECS`: release claims older than this; 0 disables
//!   the sweep (default: 900)
//! - `TASQUE_STORE_RETRY_ATTEMPTS`: retries of a failed store mutation (default: 3)
//! - `TASQUE_STORE_RETRY_DELAY_MS`: pause between those retries (default: 100)
//! - `TASQUE_RETRY_CONFIG`: path to a JSON file of per-task retry policies
//!
//! The retry file is keyed by task name:
//!
//! ```json
//! {
//!   "poll-bank": {
//!     "on_failure":    { "retry_interval_ms": 1000, "retry_exponent": 2.0, "max_retry": 5, "on_max_retry": "alert-ops" },
//!     "on_incomplete": { "retry_interval_ms": 60000 }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigurationError;
use crate::policy::{RetryPolicies, RetryPolicy};

pub const ENV_POLLING_INTERVAL_MS: &str = "TASQUE_POLLING_INTERVAL_MS";
pub const ENV_WORKER_THREADS: &str = "TASQUE_WORKER_THREADS";
pub const ENV_CLAIM_TIMEOUT_SECS: &str = "TASQUE_CLAIM_TIMEOUT_SECS";
pub const ENV_STORE_RETRY_ATTEMPTS: &str = "TASQUE_STORE_RETRY_ATTEMPTS";
pub const ENV_STORE_RETRY_DELAY_MS: &str = "TASQUE_STORE_RETRY_DELAY_MS";
pub const ENV_RETRY_CONFIG: &str = "TASQUE_RETRY_CONFIG";

/// Scheduler runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// How often the poll loop claims due work
    pub polling_interval: Duration,
    /// Size of the worker pool
    pub worker_threads: usize,
    /// Claims older than this are released by the sweep; `None` disables it
    pub claim_timeout: Option<Duration>,
    /// Extra attempts for a store mutation that failed transiently
    pub store_retry_attempts: u32,
    pub store_retry_delay: Duration,
    /// Per-task retry policies, keyed by task name
    pub retry_policies: HashMap<String, RetryPolicies>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_millis(1000),
            worker_threads: 4,
            claim_timeout: Some(Duration::from_secs(15 * 60)),
            store_retry_attempts: 3,
            store_retry_delay: Duration::from_millis(100),
            retry_policies: HashMap::new(),
        }
    }
}

impl SchedulerConfig {
    /// Read the configuration from `TASQUE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, ENV_POLLING_INTERVAL_MS)? {
            config.polling_interval = Duration::from_millis(ms);
        }
        if let Some(threads) = parse_var::<usize>(&lookup, ENV_WORKER_THREADS)? {
            config.worker_threads = threads;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_CLAIM_TIMEOUT_SECS)? {
            config.claim_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, ENV_STORE_RETRY_ATTEMPTS)? {
            config.store_retry_attempts = attempts;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_STORE_RETRY_DELAY_MS)? {
            config.store_retry_delay = Duration::from_millis(ms);
        }
        if let Some(path) = lookup(ENV_RETRY_CONFIG).filter(|p| !p.trim().is_empty()) {
            config.retry_policies = load_retry_config(path.trim())?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn with_store_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.store_retry_attempts = attempts;
        self.store_retry_delay = delay;
        self
    }

    pub fn with_retry_policies(mut self, name: impl Into<String>, policies: RetryPolicies) -> Self {
        self.retry_policies.insert(name.into(), policies);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.worker_threads == 0 {
            return Err(ConfigurationError::InvalidWorkerCount);
        }
        Ok(())
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<T>, ConfigurationError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigurationError::Env {
            var: var.to_string(),
            reason: format!("'{raw}': {e}"),
        })
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskRetryConfig {
    #[serde(default)]
    on_failure: Option<RetryPolicyConfig>,
    #[serde(default)]
    on_incomplete: Option<RetryPolicyConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetryPolicyConfig {
    retry_interval_ms: u64,
    #[serde(default = "default_exponent")]
    retry_exponent: f64,
    #[serde(default)]
    max_retry: Option<u32>,
    #[serde(default)]
    on_max_retry: Option<String>,
}

fn default_exponent() -> f64 {
    1.0
}

impl TryFrom<RetryPolicyConfig> for RetryPolicy {
    type Error = ConfigurationError;

    fn try_from(raw: RetryPolicyConfig) -> Result<Self, Self::Error> {
        let mut policy =
            RetryPolicy::exponential(Duration::from_millis(raw.retry_interval_ms), raw.retry_exponent)?;
        if let Some(max) = raw.max_retry {
            policy = policy.with_max_retry(max);
        }
        if let Some(fallback) = raw.on_max_retry {
            policy = policy.with_on_max_retry(fallback);
        }
        Ok(policy)
    }
}

/// Parse a per-task retry configuration document.
pub fn parse_retry_config(json: &str) -> Result<HashMap<String, RetryPolicies>, ConfigurationError> {
    let raw: HashMap<String, TaskRetryConfig> = serde_json::from_str(json)?;
    raw.into_iter()
        .map(|(name, task)| {
            let policies = RetryPolicies {
                on_failure: task.on_failure.map(RetryPolicy::try_from).transpose()?,
                on_incomplete: task.on_incomplete.map(RetryPolicy::try_from).transpose()?,
            };
            Ok((name, policies))
        })
        .collect()
}

/// Read and parse a per-task retry configuration file.
pub fn load_retry_config(
    path: impl AsRef<Path>,
) -> Result<HashMap<String, RetryPolicies>, ConfigurationError> {
    let json = std::fs::read_to_string(path)?;
    parse_retry_config(&json)
}
