//! Scheduler facade.
//!
//! ```no_run
//! use std::time::Duration;
//! use tasque_scheduler::{
//!     InMemoryTaskStore, RetryPolicies, RetryPolicy, Scheduler, Task, TaskConclusion,
//!     TaskContext, TaskResult,
//! };
//!
//! struct PollBank;
//!
//! impl Task for PollBank {
//!     type Payload = String;
//!
//!     fn name(&self) -> &str {
//!         "poll-bank"
//!     }
//!
//!     fn apply(&self, context: TaskContext<String>) -> TaskResult {
//!         println!("polling {}", context.payload());
//!         Ok(TaskConclusion::Incomplete)
//!     }
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let scheduler = Scheduler::builder(InMemoryTaskStore::new())
//!     .register(PollBank)
//!     .retry_policies(
//!         "poll-bank",
//!         RetryPolicies::none().with_on_incomplete(RetryPolicy::fixed(Duration::from_secs(60))),
//!     )
//!     .build()?;
//!
//! scheduler.enqueue_now("poll-bank", "connection-7")?;
//! scheduler.start(Duration::from_secs(1))?;
//! // ...
//! scheduler.stop();
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use tasque_core::{InstanceId, OwnerId};

use crate::claimer::{PollLoopHandle, spawn_poll_loop};
use crate::config::SchedulerConfig;
use crate::error::{ConfigurationError, SchedulerError};
use crate::payload::Payload;
use crate::policy::RetryPolicies;
use crate::registry::TaskRegistry;
use crate::stats::{SchedulerStats, StatsCell};
use crate::store::{QueuedTaskInstance, StoreError, StoreStats, TaskStore};
use crate::task::{ErasedTask, Task, TypedTask};
use crate::worker::{ExecutionContext, StoreRetry, WorkerPool};

/// Cheap, clonable enqueue handle.
///
/// Handed to every task through `task_initialised`. It holds the store and the
/// set of registered names, not the registry, so a task keeping one creates no
/// reference cycle.
#[derive(Clone)]
pub struct SchedulerHandle {
    store: Arc<dyn TaskStore>,
    tasks: Arc<HashSet<String>>,
}

impl core::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}

impl SchedulerHandle {
    /// Queue `task` to run as soon as a worker is free.
    pub fn enqueue_now<P: Serialize + ?Sized>(
        &self,
        task: &str,
        payload: &P,
    ) -> Result<InstanceId, SchedulerError> {
        self.enqueue_at(task, payload, Utc::now())
    }

    /// Queue `task` to run at (or after) `at`.
    pub fn enqueue_at<P: Serialize + ?Sized>(
        &self,
        task: &str,
        payload: &P,
        at: DateTime<Utc>,
    ) -> Result<InstanceId, SchedulerError> {
        self.check_registered(task)?;
        let payload = Payload::encode(payload)?;
        self.insert(task, payload, at)
    }

    pub fn is_registered(&self, task: &str) -> bool {
        self.tasks.contains(task)
    }

    fn check_registered(&self, task: &str) -> Result<(), SchedulerError> {
        if self.is_registered(task) {
            Ok(())
        } else {
            Err(SchedulerError::UnknownTask(task.to_string()))
        }
    }

    fn insert(
        &self,
        task: &str,
        payload: Payload,
        at: DateTime<Utc>,
    ) -> Result<InstanceId, SchedulerError> {
        let id = self.store.insert(QueuedTaskInstance::new(task, payload, at))?;
        debug!(instance_id = %id, task = %task, due_at = %at, "task enqueued");
        Ok(id)
    }
}

/// Builder collecting tasks, retry policies and configuration.
pub struct SchedulerBuilder {
    store: Arc<dyn TaskStore>,
    tasks: Vec<Arc<dyn ErasedTask>>,
    policies: HashMap<String, RetryPolicies>,
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    /// Register a task implementation.
    pub fn register<T: Task>(mut self, task: T) -> Self {
        self.tasks.push(Arc::new(TypedTask(task)));
        self
    }

    /// Set the retry policies of a task, overriding any from the config.
    pub fn retry_policies(mut self, task: impl Into<String>, policies: RetryPolicies) -> Self {
        self.policies.insert(task.into(), policies);
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the registry and call `task_initialised` on every task.
    pub fn build(self) -> Result<Scheduler, ConfigurationError> {
        self.config.validate()?;

        let mut policies = self.config.retry_policies.clone();
        policies.extend(self.policies);
        let registry = Arc::new(TaskRegistry::build(self.tasks, policies)?);

        let handle = SchedulerHandle {
            store: self.store.clone(),
            tasks: Arc::new(registry.names()),
        };

        let ctx = Arc::new(ExecutionContext {
            store: self.store,
            registry: registry.clone(),
            owner: OwnerId::new(),
            stats: StatsCell::default(),
            store_retry: StoreRetry {
                attempts: self.config.store_retry_attempts,
                delay: self.config.store_retry_delay,
            },
            claim_timeout: self.config.claim_timeout,
        });

        for definition in registry.definitions() {
            definition.task.initialise(&handle);
        }

        info!(owner = %ctx.owner, tasks = registry.len(), "scheduler built");

        Ok(Scheduler {
            handle,
            ctx,
            config: self.config,
            running: Mutex::new(None),
        })
    }
}

/// Persistent polling task scheduler.
///
/// Enqueue calls only insert rows; tasks run on the worker pool once
/// [`start`](Self::start) has been called. Dropping the scheduler stops it.
pub struct Scheduler {
    handle: SchedulerHandle,
    ctx: Arc<ExecutionContext>,
    config: SchedulerConfig,
    running: Mutex<Option<PollLoopHandle>>,
}

impl Scheduler {
    pub fn builder<S: TaskStore + 'static>(store: S) -> SchedulerBuilder {
        SchedulerBuilder {
            store: Arc::new(store),
            tasks: Vec::new(),
            policies: HashMap::new(),
            config: SchedulerConfig::default(),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn enqueue_now<P: Serialize + ?Sized>(
        &self,
        task: &str,
        payload: &P,
    ) -> Result<InstanceId, SchedulerError> {
        self.handle.enqueue_now(task, payload)
    }

    pub fn enqueue_at<P: Serialize + ?Sized>(
        &self,
        task: &str,
        payload: &P,
        at: DateTime<Utc>,
    ) -> Result<InstanceId, SchedulerError> {
        self.handle.enqueue_at(task, payload, at)
    }

    /// Start the worker pool and the poll loop. A no-op if already running.
    pub fn start(&self, polling_interval: Duration) -> Result<(), SchedulerError> {
        let mut running = self.running();
        if running.is_some() {
            debug!(owner = %self.ctx.owner, "scheduler already running");
            return Ok(());
        }

        let pool = WorkerPool::spawn(self.config.worker_threads, self.ctx.clone())?;
        *running = Some(spawn_poll_loop(self.ctx.clone(), pool, polling_interval)?);

        info!(
            owner = %self.ctx.owner,
            workers = self.config.worker_threads,
            interval_ms = polling_interval.as_millis() as u64,
            "scheduler started"
        );
        Ok(())
    }

    /// [`start`](Self::start) with the configured polling interval
    /// (`TASQUE_POLLING_INTERVAL_MS` when built from the environment).
    pub fn start_configured(&self) -> Result<(), SchedulerError> {
        self.start(self.config.polling_interval)
    }

    /// Stop claiming, release queued claims and wait for in-flight tasks.
    /// A no-op if not running.
    pub fn stop(&self) {
        let Some(poll_loop) = self.running().take() else {
            return;
        };
        poll_loop.shutdown();
        info!(owner = %self.ctx.owner, "scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Interval used by [`start_configured`](Self::start_configured).
    pub fn polling_interval(&self) -> Duration {
        self.config.polling_interval
    }

    /// Claim owner id of this process.
    pub fn owner(&self) -> OwnerId {
        self.ctx.owner
    }

    pub fn stats(&self) -> SchedulerStats {
        self.ctx.stats.snapshot()
    }

    pub fn store_stats(&self) -> Result<StoreStats, StoreError> {
        self.ctx.store.stats()
    }

    fn running(&self) -> MutexGuard<'_, Option<PollLoopHandle>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
