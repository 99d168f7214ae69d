//! Persistent polling task scheduler.
//!
//! Tasks are enqueued as rows in a [`TaskStore`]; a poll loop claims due rows
//! atomically and a fixed worker pool runs them. After every attempt the retry
//! engine decides whether the row is deleted, rescheduled with backoff, or
//! exhausted and escalated to a fallback task.
//!
//! Execution is at most once concurrently per instance and at least once
//! eventually.

pub mod config;
pub mod error;
pub mod payload;
pub mod policy;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod task;

mod claimer;
mod registry;
mod sweeper;
mod worker;

pub use config::SchedulerConfig;
pub use error::{ConfigurationError, SchedulerError};
pub use payload::Payload;
pub use policy::{Attempts, Channel, Directive, Outcome, RetryPolicies, RetryPolicy, decide};
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerHandle};
pub use stats::SchedulerStats;
pub use store::{InMemoryTaskStore, InstanceState, QueuedTaskInstance, StoreError, StoreStats, TaskStore};
#[cfg(feature = "postgres")]
pub use store::PostgresTaskStore;
pub use task::{Task, TaskConclusion, TaskContext, TaskResult};
pub use tasque_core::{InstanceId, OwnerId};
