//! In-memory task store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use tasque_core::{InstanceId, OwnerId};

use super::r#trait::{InstanceState, QueuedTaskInstance, StoreError, StoreStats, TaskStore};
use crate::policy::Attempts;

/// In-memory task store.
///
/// Claims run under the single write lock, which makes the
/// PENDING to CLAIMED transition atomic across threads.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    instances: RwLock<HashMap<InstanceId, QueuedTaskInstance>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored instances, in any state.
    pub fn len(&self) -> usize {
        self.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<InstanceId, QueuedTaskInstance>>, StoreError> {
        self.instances
            .read()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }

    fn write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<InstanceId, QueuedTaskInstance>>, StoreError> {
        self.instances
            .write()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }

    /// Run `f` on an instance the caller must hold the claim for.
    fn with_claimed<T>(
        &self,
        id: InstanceId,
        owner: OwnerId,
        f: impl FnOnce(&mut HashMap<InstanceId, QueuedTaskInstance>) -> T,
    ) -> Result<T, StoreError> {
        let mut instances = self.write()?;
        match instances.get(&id) {
            None => Err(StoreError::NotFound(id)),
            Some(instance) if !instance.is_claimed_by(owner) => Err(StoreError::ClaimLost(id)),
            Some(_) => Ok(f(&mut instances)),
        }
    }
}

impl TaskStore for InMemoryTaskStore {
    fn insert(&self, instance: QueuedTaskInstance) -> Result<InstanceId, StoreError> {
        let mut instances = self.write()?;
        if instances.contains_key(&instance.id) {
            return Err(StoreError::AlreadyExists(instance.id));
        }
        let id = instance.id;
        instances.insert(id, instance);
        Ok(id)
    }

    fn get(&self, id: InstanceId) -> Result<Option<QueuedTaskInstance>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    fn claim_due(
        &self,
        owner: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedTaskInstance>, StoreError> {
        let mut instances = self.write()?;

        let mut claimed: Vec<QueuedTaskInstance> = instances
            .values_mut()
            .filter(|i| i.is_due(now))
            .map(|i| {
                i.mark_claimed(owner, now);
                i.clone()
            })
            .collect();

        // Most overdue first
        claimed.sort_by_key(|i| (i.due_at, i.id));
        Ok(claimed)
    }

    fn reschedule(
        &self,
        id: InstanceId,
        owner: OwnerId,
        attempts: Attempts,
        due_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_claimed(id, owner, |instances| {
            if let Some(instance) = instances.get_mut(&id) {
                instance.failure_count = attempts.failure_count;
                instance.repeat_count = attempts.repeat_count;
                instance.due_at = due_at;
                instance.mark_pending();
            }
        })
    }

    fn delete(&self, id: InstanceId, owner: OwnerId) -> Result<(), StoreError> {
        self.with_claimed(id, owner, |instances| {
            instances.remove(&id);
        })
    }

    fn release(&self, id: InstanceId, owner: OwnerId) -> Result<(), StoreError> {
        self.with_claimed(id, owner, |instances| {
            if let Some(instance) = instances.get_mut(&id) {
                instance.mark_pending();
            }
        })
    }

    fn release_expired_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<InstanceId>, StoreError> {
        let mut instances = self.write()?;
        let mut released = Vec::new();
        for instance in instances.values_mut() {
            let expired = instance.state == InstanceState::Claimed
                && instance.claimed_at.is_none_or(|at| at < claimed_before);
            if expired {
                instance.mark_pending();
                released.push(instance.id);
            }
        }
        released.sort();
        Ok(released)
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        let instances = self.read()?;
        let mut stats = StoreStats::default();
        for instance in instances.values() {
            match instance.state {
                InstanceState::Pending => stats.pending += 1,
                InstanceState::Claimed => stats.claimed += 1,
            }
        }
        Ok(stats)
    }
}
