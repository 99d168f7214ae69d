//! Scheduler runtime statistics.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Counters since the scheduler was built.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SchedulerStats {
    /// Instances claimed by this process
    pub claimed: u64,
    /// Attempts that returned `Complete`
    pub completed: u64,
    /// Attempts that returned `Incomplete`
    pub incomplete: u64,
    /// Attempts that raised an error, panicked, or could not decode the payload
    pub failed: u64,
    pub rescheduled: u64,
    /// Deleted after one attempt because the channel has no policy
    pub abandoned: u64,
    /// Deleted because the retry budget ran out
    pub exhausted: u64,
    pub escalated: u64,
    pub escalation_failures: u64,
    /// Claimed instances handed back unexecuted at shutdown
    pub released: u64,
    /// Stale claims released by the claim-timeout sweep
    pub swept: u64,
    /// Results dropped because another process held the claim by then
    pub claims_lost: u64,
    /// Store calls that failed after retries
    pub store_errors: u64,
    pub current_running: usize,
}

/// Shared, lock-protected stats cell.
#[derive(Debug, Clone, Default)]
pub(crate) struct StatsCell(Arc<Mutex<SchedulerStats>>);

impl StatsCell {
    pub fn update(&self, f: impl FnOnce(&mut SchedulerStats)) {
        f(&mut self.lock());
    }

    pub fn snapshot(&self) -> SchedulerStats {
        self.lock().clone()
    }

    // Counters stay usable after a panicking writer.
    fn lock(&self) -> MutexGuard<'_, SchedulerStats> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
