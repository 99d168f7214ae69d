//! Poll loop: sweep, claim due work, hand it to the worker pool.
//!
//! The loop is single-threaded and never runs a task itself. A tick that hits
//! a store error is logged and skipped; the store is authoritative, so the
//! next tick simply tries again.

use std::io;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::sweeper::sweep_expired_claims;
use crate::worker::{ExecutionContext, WorkerPool};

/// Handle to stop and join the poll loop thread.
#[derive(Debug)]
pub(crate) struct PollLoopHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl PollLoopHandle {
    /// Stop polling, drain the worker pool and wait for both.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                warn!("poll loop thread panicked");
            }
        }
    }
}

/// Spawn the poll loop. The loop owns the worker pool and shuts it down on exit.
pub(crate) fn spawn_poll_loop(
    ctx: Arc<ExecutionContext>,
    pool: WorkerPool,
    polling_interval: Duration,
) -> io::Result<PollLoopHandle> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

    let join = thread::Builder::new()
        .name("tasque-poll".to_string())
        .spawn(move || poll_loop(&ctx, pool, polling_interval, &shutdown_rx))?;

    Ok(PollLoopHandle {
        shutdown: shutdown_tx,
        join: Some(join),
    })
}

fn poll_loop(
    ctx: &ExecutionContext,
    mut pool: WorkerPool,
    polling_interval: Duration,
    shutdown_rx: &mpsc::Receiver<()>,
) {
    info!(owner = %ctx.owner, interval_ms = polling_interval.as_millis() as u64, "poll loop started");

    loop {
        tick(ctx, &pool);

        match shutdown_rx.recv_timeout(polling_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    pool.shutdown();
    info!(owner = %ctx.owner, "poll loop stopped");
}

/// One poll: release stale claims, claim everything due, dispatch it.
///
/// Returns the number of instances dispatched.
pub(crate) fn tick(ctx: &ExecutionContext, pool: &WorkerPool) -> usize {
    let now = Utc::now();

    if let Some(timeout) = ctx.claim_timeout {
        sweep_expired_claims(ctx, timeout, now);
    }

    let claimed = match ctx
        .store_retry
        .run("claim_due", || ctx.store.claim_due(ctx.owner, now))
    {
        Ok(claimed) => claimed,
        Err(e) => {
            ctx.stats.update(|s| s.store_errors += 1);
            warn!(owner = %ctx.owner, error = %e, "failed to claim due tasks; skipping tick");
            return 0;
        }
    };

    if claimed.is_empty() {
        return 0;
    }
    ctx.stats.update(|s| s.claimed += claimed.len() as u64);

    let mut dispatched = 0;
    for instance in claimed {
        debug!(
            instance_id = %instance.id,
            task = %instance.task_name,
            due_at = %instance.due_at,
            failure_count = instance.failure_count,
            repeat_count = instance.repeat_count,
            "claimed task"
        );
        match pool.dispatch(instance) {
            Ok(()) => dispatched += 1,
            Err(instance) => ctx.release(&instance),
        }
    }
    dispatched
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use chrono::DateTime;
    use tasque_core::{InstanceId, OwnerId};

    use crate::payload::Payload;
    use crate::registry::TaskRegistry;
    use crate::stats::StatsCell;
    use crate::policy::Attempts;
    use crate::store::{InMemoryTaskStore, QueuedTaskInstance, StoreError, StoreStats, TaskStore};
    use crate::task::{ErasedTask, Task, TaskConclusion, TaskContext, TaskResult, TypedTask};
    use crate::worker::StoreRetry;

    struct Counting(Arc<AtomicU32>);

    impl Task for Counting {
        type Payload = String;

        fn name(&self) -> &str {
            "t"
        }

        fn apply(&self, _context: TaskContext<String>) -> TaskResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(TaskConclusion::Complete)
        }
    }

    /// Store whose claims fail while `down` is set.
    #[derive(Default)]
    struct Outage {
        inner: InMemoryTaskStore,
        down: AtomicBool,
    }

    impl TaskStore for Outage {
        fn insert(&self, instance: QueuedTaskInstance) -> Result<InstanceId, StoreError> {
            self.inner.insert(instance)
        }
        fn get(&self, id: InstanceId) -> Result<Option<QueuedTaskInstance>, StoreError> {
            self.inner.get(id)
        }
        fn claim_due(&self, owner: OwnerId, now: DateTime<Utc>) -> Result<Vec<QueuedTaskInstance>, StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("database is starting up".into()));
            }
            self.inner.claim_due(owner, now)
        }
        fn reschedule(&self, id: InstanceId, owner: OwnerId, attempts: Attempts, due_at: DateTime<Utc>) -> Result<(), StoreError> {
            self.inner.reschedule(id, owner, attempts, due_at)
        }
        fn delete(&self, id: InstanceId, owner: OwnerId) -> Result<(), StoreError> {
            self.inner.delete(id, owner)
        }
        fn release(&self, id: InstanceId, owner: OwnerId) -> Result<(), StoreError> {
            self.inner.release(id, owner)
        }
        fn release_expired_claims(&self, claimed_before: DateTime<Utc>) -> Result<Vec<InstanceId>, StoreError> {
            self.inner.release_expired_claims(claimed_before)
        }
        fn stats(&self) -> Result<StoreStats, StoreError> {
            self.inner.stats()
        }
    }

    fn context(store: Arc<dyn TaskStore>, calls: Arc<AtomicU32>) -> Arc<ExecutionContext> {
        let tasks: Vec<Arc<dyn ErasedTask>> = vec![Arc::new(TypedTask(Counting(calls)))];
        Arc::new(ExecutionContext {
            store,
            registry: Arc::new(TaskRegistry::build(tasks, HashMap::new()).unwrap()),
            owner: OwnerId::new(),
            stats: StatsCell::default(),
            store_retry: StoreRetry {
                attempts: 0,
                delay: Duration::ZERO,
            },
            claim_timeout: Some(Duration::from_secs(60)),
        })
    }

    #[test]
    fn tick_dispatches_only_due_instances() {
        let store = InMemoryTaskStore::arc();
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = context(store.clone(), calls.clone());
        let mut pool = WorkerPool::spawn(1, ctx.clone()).unwrap();

        store
            .insert(QueuedTaskInstance::new("t", Payload::encode("now").unwrap(), Utc::now()))
            .unwrap();
        store
            .insert(QueuedTaskInstance::new(
                "t",
                Payload::encode("later").unwrap(),
                Utc::now() + chrono::Duration::hours(1),
            ))
            .unwrap();

        assert_eq!(tick(&ctx, &pool), 1);
        assert_eq!(tick(&ctx, &pool), 0);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while calls.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        pool.shutdown();

        assert_eq!(ctx.stats.snapshot().claimed, 1);
        assert_eq!(store.stats().unwrap().pending, 1);
    }

    #[test]
    fn tick_after_pool_shutdown_releases_claims() {
        let store = InMemoryTaskStore::arc();
        let ctx = context(store.clone(), Arc::new(AtomicU32::new(0)));
        let mut pool = WorkerPool::spawn(1, ctx.clone()).unwrap();
        pool.shutdown();

        store
            .insert(QueuedTaskInstance::new("t", Payload::default(), Utc::now()))
            .unwrap();

        assert_eq!(tick(&ctx, &pool), 0);
        assert_eq!(store.stats().unwrap().pending, 1);
        assert_eq!(ctx.stats.snapshot().released, 1);
    }

    #[test]
    fn unavailable_store_skips_the_tick() {
        let store = Arc::new(Outage::default());
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = context(store.clone(), calls.clone());
        let mut pool = WorkerPool::spawn(1, ctx.clone()).unwrap();

        for _ in 0..2 {
            store
                .insert(QueuedTaskInstance::new("t", Payload::encode("x").unwrap(), Utc::now()))
                .unwrap();
        }

        store.down.store(true, Ordering::SeqCst);
        assert_eq!(tick(&ctx, &pool), 0);
        assert_eq!(store.stats().unwrap(), StoreStats { pending: 2, claimed: 0 });
        let stats = ctx.stats.snapshot();
        assert_eq!((stats.store_errors, stats.claimed), (1, 0));

        store.down.store(false, Ordering::SeqCst);
        assert_eq!(tick(&ctx, &pool), 2);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while calls.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        pool.shutdown();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(store.inner.is_empty());
    }

    #[test]
    fn poll_loop_runs_until_shutdown() {
        let store = InMemoryTaskStore::arc();
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = context(store.clone(), calls.clone());
        let pool = WorkerPool::spawn(2, ctx.clone()).unwrap();

        for _ in 0..5 {
            store
                .insert(QueuedTaskInstance::new("t", Payload::encode("x").unwrap(), Utc::now()))
                .unwrap();
        }
        let handle = spawn_poll_loop(ctx.clone(), pool, Duration::from_millis(10)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !store.is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();

        assert!(store.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
