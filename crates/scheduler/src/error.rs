//! Scheduler error model.
//!
//! Errors are split by boundary:
//!
//! - `ConfigurationError`: startup problems; fatal before the scheduler runs
//! - `StoreError`: task store reads/writes (see `store`)
//! - `SchedulerError`: what the facade's enqueue/start calls return
//!
//! Errors raised by task executors are not part of this model: they travel as
//! `anyhow::Error` inside a `TaskResult` and are classified as failures.

use thiserror::Error;

use crate::store::StoreError;

/// Startup configuration error.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("task registered twice: {0}")]
    DuplicateTask(String),

    #[error("task '{task}' escalates to unregistered task '{fallback}'")]
    UnknownFallback { task: String, fallback: String },

    #[error("retry exponent must be a finite number >= 1.0, got {exponent}")]
    InvalidRetryExponent { exponent: f64 },

    #[error("worker pool needs at least one thread")]
    InvalidWorkerCount,

    #[error("invalid value for {var}: {reason}")]
    Env { var: String, reason: String },

    #[error("failed to read retry configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed retry configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error returned by the scheduler facade.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no task registered under name '{0}'")]
    UnknownTask(String),

    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to spawn scheduler thread: {0}")]
    Worker(#[from] std::io::Error),
}
