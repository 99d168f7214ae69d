use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use tasque_core::{InstanceId, OwnerId};

use crate::payload::Payload;
use crate::policy::Attempts;

/// Claim state of a queued instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    /// Waiting for its due time (or already due and not yet claimed).
    Pending,
    /// Exclusively owned by one scheduler process.
    Claimed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Claimed => "claimed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InstanceState::Pending),
            "claimed" => Some(InstanceState::Claimed),
            _ => None,
        }
    }
}

/// One persisted unit of scheduled work.
///
/// Attempt counters live on the row, never in process memory, so any scheduler
/// process that claims the instance sees the same history.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTaskInstance {
    pub id: InstanceId,
    pub task_name: String,
    pub payload: Payload,
    pub due_at: DateTime<Utc>,
    pub state: InstanceState,
    pub failure_count: u32,
    pub repeat_count: u32,
    pub claim_owner: Option<OwnerId>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl QueuedTaskInstance {
    /// A fresh PENDING instance with zeroed counters.
    pub fn new(task_name: impl Into<String>, payload: Payload, due_at: DateTime<Utc>) -> Self {
        Self {
            id: InstanceId::new(),
            task_name: task_name.into(),
            payload,
            due_at,
            state: InstanceState::Pending,
            failure_count: 0,
            repeat_count: 0,
            claim_owner: None,
            claimed_at: None,
        }
    }

    pub fn attempts(&self) -> Attempts {
        Attempts::new(self.failure_count, self.repeat_count)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == InstanceState::Pending && self.due_at <= now
    }

    pub(crate) fn is_claimed_by(&self, owner: OwnerId) -> bool {
        self.state == InstanceState::Claimed && self.claim_owner == Some(owner)
    }

    pub(crate) fn mark_claimed(&mut self, owner: OwnerId, now: DateTime<Utc>) {
        self.state = InstanceState::Claimed;
        self.claim_owner = Some(owner);
        self.claimed_at = Some(now);
    }

    pub(crate) fn mark_pending(&mut self) {
        self.state = InstanceState::Pending;
        self.claim_owner = None;
        self.claimed_at = None;
    }
}

/// Task store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("task instance not found: {0}")]
    NotFound(InstanceId),
    #[error("task instance already exists: {0}")]
    AlreadyExists(InstanceId),
    #[error("claim on task instance {0} is no longer held by this scheduler")]
    ClaimLost(InstanceId),
    #[error("task store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt task instance row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Instance counts per claim state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub pending: usize,
    pub claimed: usize,
}

/// Durable table of queued task instances.
///
/// The store is the only shared mutable resource between scheduler processes.
/// Every mutation of a claimed row is conditional on the caller still holding
/// the claim; a caller that lost it gets [`StoreError::ClaimLost`].
pub trait TaskStore: Send + Sync {
    /// Persist a new PENDING instance.
    fn insert(&self, instance: QueuedTaskInstance) -> Result<InstanceId, StoreError>;

    /// Fetch an instance by id.
    fn get(&self, id: InstanceId) -> Result<Option<QueuedTaskInstance>, StoreError>;

    /// Atomically move every PENDING instance with `due_at <= now` to CLAIMED
    /// under `owner`, returning them most-overdue first.
    ///
    /// Concurrent callers never receive the same instance.
    fn claim_due(
        &self,
        owner: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedTaskInstance>, StoreError>;

    /// Revert a claimed instance to PENDING with new counters and due time.
    fn reschedule(
        &self,
        id: InstanceId,
        owner: OwnerId,
        attempts: Attempts,
        due_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Remove a claimed instance.
    fn delete(&self, id: InstanceId, owner: OwnerId) -> Result<(), StoreError>;

    /// Give a claim back untouched (counters and due time unchanged).
    fn release(&self, id: InstanceId, owner: OwnerId) -> Result<(), StoreError>;

    /// Release every claim taken before `claimed_before`, whoever holds it.
    ///
    /// Returns the ids that went back to PENDING.
    fn release_expired_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<InstanceId>, StoreError>;

    fn stats(&self) -> Result<StoreStats, StoreError>;
}

impl<S: TaskStore + ?Sized> TaskStore for Arc<S> {
    fn insert(&self, instance: QueuedTaskInstance) -> Result<InstanceId, StoreError> {
        (**self).insert(instance)
    }

    fn get(&self, id: InstanceId) -> Result<Option<QueuedTaskInstance>, StoreError> {
        (**self).get(id)
    }

    fn claim_due(
        &self,
        owner: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedTaskInstance>, StoreError> {
        (**self).claim_due(owner, now)
    }

    fn reschedule(
        &self,
        id: InstanceId,
        owner: OwnerId,
        attempts: Attempts,
        due_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).reschedule(id, owner, attempts, due_at)
    }

    fn delete(&self, id: InstanceId, owner: OwnerId) -> Result<(), StoreError> {
        (**self).delete(id, owner)
    }

    fn release(&self, id: InstanceId, owner: OwnerId) -> Result<(), StoreError> {
        (**self).release(id, owner)
    }

    fn release_expired_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<InstanceId>, StoreError> {
        (**self).release_expired_claims(claimed_before)
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        (**self).stats()
    }
}
