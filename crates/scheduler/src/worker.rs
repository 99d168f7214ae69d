//! Worker pool and per-instance execution.
//!
//! A fixed number of threads take claimed instances off a shared queue, run the
//! task's executor, ask the retry engine what to do next and apply that to the
//! store. Executor errors and panics stop at this boundary; nothing a task does
//! reaches the poll loop.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use tasque_core::{InstanceId, OwnerId};

use crate::policy::{Directive, Outcome, RetryPolicies, decide};
use crate::registry::TaskRegistry;
use crate::stats::StatsCell;
use crate::store::{QueuedTaskInstance, StoreError, TaskStore};

/// Retry budget for store mutations that fail transiently.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StoreRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl StoreRetry {
    /// Run `op`, retrying transient errors.
    pub fn run<T>(
        &self,
        operation: &str,
        op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.run_counted(operation, op).0
    }

    /// Run a mutation whose reply may be lost after it commits.
    ///
    /// Once a transient error has been retried, a final error accepted by
    /// `landed` means an earlier attempt went through and counts as success.
    pub fn run_mutation(
        &self,
        operation: &str,
        op: impl FnMut() -> Result<(), StoreError>,
        landed: impl Fn(&StoreError) -> bool,
    ) -> Result<(), StoreError> {
        match self.run_counted(operation, op) {
            (Err(e), retries) if retries > 0 && landed(&e) => {
                debug!(operation, retries, error = %e, "earlier attempt landed before its reply was lost");
                Ok(())
            }
            (result, _) => result,
        }
    }

    fn run_counted<T>(
        &self,
        operation: &str,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> (Result<T, StoreError>, u32) {
        let mut retries = 0;
        loop {
            match op() {
                Err(e) if e.is_transient() && retries < self.attempts => {
                    retries += 1;
                    warn!(operation, retry = retries, error = %e, "task store call failed; retrying");
                    thread::sleep(self.delay);
                }
                result => return (result, retries),
            }
        }
    }
}

/// Everything a worker needs to settle an instance.
pub(crate) struct ExecutionContext {
    pub store: Arc<dyn TaskStore>,
    pub registry: Arc<TaskRegistry>,
    pub owner: OwnerId,
    pub stats: StatsCell,
    pub store_retry: StoreRetry,
    pub claim_timeout: Option<Duration>,
}

impl ExecutionContext {
    /// A claim older than the timeout may already have been swept and handed
    /// to someone else; it must not run.
    fn claim_expired(&self, instance: &QueuedTaskInstance, now: DateTime<Utc>) -> bool {
        let (Some(timeout), Some(claimed_at)) = (self.claim_timeout, instance.claimed_at) else {
            return false;
        };
        chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| claimed_at.checked_add_signed(t))
            .is_some_and(|deadline| deadline < now)
    }

    /// Give an unexecuted claim back to the store.
    pub fn release(&self, instance: &QueuedTaskInstance) {
        match self
            .store_retry
            .run("release", || self.store.release(instance.id, self.owner))
        {
            Ok(()) => {
                self.stats.update(|s| s.released += 1);
                info!(instance_id = %instance.id, task = %instance.task_name, "released claim without executing");
            }
            Err(e) => {
                self.stats.update(|s| s.store_errors += 1);
                warn!(instance_id = %instance.id, error = %e, "failed to release claim; sweep will recover it");
            }
        }
    }
}

/// Run one claimed instance and settle it in the store.
pub(crate) fn execute_instance(ctx: &ExecutionContext, instance: QueuedTaskInstance) {
    if ctx.claim_expired(&instance, Utc::now()) {
        warn!(
            instance_id = %instance.id,
            task = %instance.task_name,
            "claim expired while queued; skipping"
        );
        return;
    }

    let attempts = instance.attempts();
    let no_policies = RetryPolicies::none();

    let (outcome, policies) = match ctx.registry.get(&instance.task_name) {
        Some(definition) => {
            debug!(
                instance_id = %instance.id,
                task = %instance.task_name,
                failure_count = attempts.failure_count,
                repeat_count = attempts.repeat_count,
                "executing task"
            );

            ctx.stats.update(|s| s.current_running += 1);
            let classified = definition.task.run(&instance.payload, attempts);
            ctx.stats
                .update(|s| s.current_running = s.current_running.saturating_sub(1));

            if let Some(err) = &classified.error {
                warn!(
                    instance_id = %instance.id,
                    task = %instance.task_name,
                    failure_count = attempts.failure_count,
                    error = %err,
                    "task execution failed"
                );
            }
            (classified.outcome, &definition.policies)
        }
        None => {
            // Enqueue checks names, so only a row written by another deployment gets here.
            error!(instance_id = %instance.id, task = %instance.task_name, "no task registered under this name");
            (Outcome::Failure, &no_policies)
        }
    };

    ctx.stats.update(|s| match outcome {
        Outcome::Complete => s.completed += 1,
        Outcome::Incomplete => s.incomplete += 1,
        Outcome::Failure => s.failed += 1,
    });

    let directive = decide(outcome, attempts, policies, Utc::now());
    debug!(instance_id = %instance.id, outcome = ?outcome, directive = ?directive, "retry decision");

    apply_directive(ctx, &instance, directive);
}

fn apply_directive(ctx: &ExecutionContext, instance: &QueuedTaskInstance, directive: Directive) {
    let id = instance.id;

    if let Directive::Reschedule {
        channel,
        attempts,
        due_at,
    } = directive
    {
        // A landed reschedule leaves the row pending, or already reclaimed.
        let result = ctx.store_retry.run_mutation(
            "reschedule",
            || ctx.store.reschedule(id, ctx.owner, attempts, due_at),
            |e| matches!(e, StoreError::NotFound(_) | StoreError::ClaimLost(_)),
        );
        if settled(ctx, id, "reschedule", result) {
            ctx.stats.update(|s| s.rescheduled += 1);
            debug!(
                instance_id = %id,
                channel = %channel,
                failure_count = attempts.failure_count,
                repeat_count = attempts.repeat_count,
                due_at = %due_at,
                "task rescheduled"
            );
        }
        return;
    }

    let result = ctx.store_retry.run_mutation(
        "delete",
        || ctx.store.delete(id, ctx.owner),
        |e| matches!(e, StoreError::NotFound(_)),
    );
    if !settled(ctx, id, "delete", result) {
        // The instance is still in the store; escalating now could run the
        // fallback twice once the instance is retried.
        return;
    }

    match directive {
        Directive::Complete => debug!(instance_id = %id, "task completed"),
        Directive::Abandon { channel, attempts } => {
            ctx.stats.update(|s| s.abandoned += 1);
            warn!(
                instance_id = %id,
                task = %instance.task_name,
                channel = %channel,
                repeat_count = attempts.repeat_count,
                "no retry policy; task abandoned"
            );
        }
        Directive::Exhausted {
            channel,
            attempts,
            escalate_to,
        } => {
            ctx.stats.update(|s| s.exhausted += 1);
            warn!(
                instance_id = %id,
                task = %instance.task_name,
                channel = %channel,
                failure_count = attempts.failure_count,
                repeat_count = attempts.repeat_count,
                "retries exhausted; task removed"
            );
            if let Some(fallback) = escalate_to {
                escalate(ctx, instance, &fallback);
            }
        }
        Directive::Reschedule { .. } => {}
    }
}

/// Enqueue the fallback task now with the exhausted instance's payload bytes.
fn escalate(ctx: &ExecutionContext, exhausted: &QueuedTaskInstance, fallback: &str) {
    let escalation = QueuedTaskInstance::new(fallback, exhausted.payload.clone(), Utc::now());
    let escalation_id = escalation.id;

    let result = ctx.store_retry.run("escalate", || {
        match ctx.store.insert(escalation.clone()) {
            // An earlier attempt landed before its response was lost.
            Err(StoreError::AlreadyExists(id)) if id == escalation_id => Ok(id),
            other => other,
        }
    });

    match result {
        Ok(id) => {
            ctx.stats.update(|s| s.escalated += 1);
            info!(
                instance_id = %exhausted.id,
                task = %exhausted.task_name,
                fallback = %fallback,
                escalation_id = %id,
                "escalated to fallback task"
            );
        }
        Err(e) => {
            ctx.stats.update(|s| s.escalation_failures += 1);
            error!(
                instance_id = %exhausted.id,
                task = %exhausted.task_name,
                fallback = %fallback,
                error = %e,
                "failed to enqueue fallback task"
            );
        }
    }
}

/// Log a failed settle; returns whether it succeeded.
fn settled(ctx: &ExecutionContext, id: InstanceId, operation: &str, result: Result<(), StoreError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e @ (StoreError::ClaimLost(_) | StoreError::NotFound(_))) => {
            ctx.stats.update(|s| s.claims_lost += 1);
            warn!(instance_id = %id, operation, error = %e, "claim lost before the result was recorded");
            false
        }
        Err(e) => {
            ctx.stats.update(|s| s.store_errors += 1);
            error!(instance_id = %id, operation, error = %e, "failed to record task result");
            false
        }
    }
}

/// Fixed-size pool of execution threads fed from one unbounded queue.
pub(crate) struct WorkerPool {
    queue: Option<mpsc::Sender<QueuedTaskInstance>>,
    workers: Vec<thread::JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn spawn(size: usize, ctx: Arc<ExecutionContext>) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<QueuedTaskInstance>();
        let rx = Arc::new(Mutex::new(rx));
        let stopping = Arc::new(AtomicBool::new(false));

        let mut pool = Self {
            queue: Some(tx),
            workers: Vec::with_capacity(size),
            stopping: stopping.clone(),
        };

        for n in 0..size {
            let rx = rx.clone();
            let ctx = ctx.clone();
            let stopping = stopping.clone();
            let spawned = thread::Builder::new()
                .name(format!("tasque-worker-{n}"))
                .spawn(move || worker_loop(&ctx, &rx, &stopping));
            match spawned {
                Ok(join) => pool.workers.push(join),
                Err(e) => {
                    pool.shutdown();
                    return Err(e);
                }
            }
        }

        Ok(pool)
    }

    /// Queue a claimed instance; hands it back if the pool is shut down.
    pub fn dispatch(&self, instance: QueuedTaskInstance) -> Result<(), QueuedTaskInstance> {
        match &self.queue {
            Some(tx) => tx.send(instance).map_err(|e| e.0),
            None => Err(instance),
        }
    }

    /// Close the queue and wait for the workers.
    ///
    /// Queued instances are released, in-flight ones finish.
    pub fn shutdown(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.queue.take();
        for join in self.workers.drain(..) {
            if join.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    ctx: &ExecutionContext,
    queue: &Mutex<mpsc::Receiver<QueuedTaskInstance>>,
    stopping: &AtomicBool,
) {
    loop {
        let next = queue.lock().unwrap_or_else(PoisonError::into_inner).recv();
        let Ok(instance) = next else {
            break;
        };

        if stopping.load(Ordering::SeqCst) {
            ctx.release(&instance);
        } else {
            execute_instance(ctx, instance);
        }
    }
}
