//! Per-session write coordination.
//!
//! The store has exactly two writers, the mutation gateway and the realtime
//! reconciler. Both go through [`SessionState`]: moves hold async partition
//! locks across their persistence call and mark those partitions in-flight,
//! and remote events touching an in-flight partition are queued until the
//! move resolves. The store mutex itself is never held across an `.await`.

use crate::errors::{AppError, AppResult};
use crate::models::{Activity, ActivityChange, PartitionKey, RealtimeEvent};
use crate::reconciler::{self, ReconcileOutcome};
use crate::store::{ActivityStore, StoreChange};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
struct SyncState {
    store: ActivityStore,
    inflight: HashMap<PartitionKey, usize>,
    deferred: VecDeque<RealtimeEvent>,
}

impl SyncState {
    fn is_blocked(&self, event: &RealtimeEvent, deferred_ids: &HashSet<String>) -> bool {
        deferred_ids.contains(&event.activity.id)
            || reconciler::touched_partitions(&self.store, event)
                .iter()
                .any(|key| self.inflight.contains_key(key))
    }
}

/// Held while a move or delete is between its optimistic write and its
/// persistence outcome. Dropping it releases the partitions.
#[derive(Debug)]
pub struct PartitionGuard {
    keys: BTreeSet<PartitionKey>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl PartitionGuard {
    pub fn covers(&self, keys: &BTreeSet<PartitionKey>) -> bool {
        keys.is_subset(&self.keys)
    }
}

#[derive(Debug)]
pub struct SessionState {
    trip_id: String,
    state: Mutex<SyncState>,
    locks: Mutex<HashMap<PartitionKey, Arc<AsyncMutex<()>>>>,
}

impl SessionState {
    pub fn new(trip_id: impl Into<String>) -> Self {
        Self {
            trip_id: trip_id.into(),
            state: Mutex::new(SyncState::default()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn trip_id(&self) -> &str {
        &self.trip_id
    }

    pub fn read<T>(&self, reader: impl FnOnce(&ActivityStore) -> T) -> AppResult<T> {
        let state = self.state.lock().map_err(|_| AppError::poisoned("session state"))?;
        Ok(reader(&state.store))
    }

    pub fn subscribe(&self) -> AppResult<broadcast::Receiver<StoreChange>> {
        self.read(ActivityStore::subscribe)
    }

    /// Replaces the whole store, e.g. on first load.
    pub fn load(&self, activities: Vec<Activity>) -> AppResult<()> {
        let mut state = self.state.lock().map_err(|_| AppError::poisoned("session state"))?;
        state.store.store(activities);
        Ok(())
    }

    pub fn deferred_len(&self) -> AppResult<usize> {
        let state = self.state.lock().map_err(|_| AppError::poisoned("session state"))?;
        Ok(state.deferred.len())
    }

    /// Locks partitions in key order so overlapping callers cannot deadlock.
    /// Tokio mutexes are FIFO, which keeps overlapping moves in issuance order.
    pub async fn lock_partitions(&self, keys: &BTreeSet<PartitionKey>) -> AppResult<PartitionGuard> {
        let mutexes = {
            let mut locks = self.locks.lock().map_err(|_| AppError::poisoned("partition locks"))?;
            keys.iter()
                .map(|key| locks.entry(*key).or_default().clone())
                .collect::<Vec<_>>()
        };

        let mut guards = Vec::with_capacity(mutexes.len());
        for mutex in mutexes {
            guards.push(mutex.lock_owned().await);
        }
        Ok(PartitionGuard {
            keys: keys.clone(),
            _guards: guards,
        })
    }

    /// Applies `changes` optimistically and marks `affected` in-flight.
    /// Returns the prior contents of `affected` for a later restore.
    pub(crate) fn begin_write(
        &self,
        affected: &BTreeSet<PartitionKey>,
        changes: &[ActivityChange],
    ) -> AppResult<Vec<Activity>> {
        let mut state = self.state.lock().map_err(|_| AppError::poisoned("session state"))?;
        let snapshot = state.store.snapshot_partitions(affected);
        state.store.apply_changes(changes);
        for key in affected {
            *state.inflight.entry(*key).or_insert(0) += 1;
        }
        Ok(snapshot)
    }

    /// Marks `affected` in-flight without changing the store (deletes).
    pub(crate) fn mark_inflight(&self, affected: &BTreeSet<PartitionKey>) -> AppResult<()> {
        let mut state = self.state.lock().map_err(|_| AppError::poisoned("session state"))?;
        for key in affected {
            *state.inflight.entry(*key).or_insert(0) += 1;
        }
        Ok(())
    }

    pub(crate) fn replace_partitions(
        &self,
        affected: &BTreeSet<PartitionKey>,
        authoritative: Vec<Activity>,
    ) -> AppResult<()> {
        let mut state = self.state.lock().map_err(|_| AppError::poisoned("session state"))?;
        state.store.replace_partitions(affected, authoritative);
        Ok(())
    }

    /// Clears the in-flight marks and replays queued events that are no longer
    /// blocked, in arrival order. Returns how many were applied.
    pub(crate) fn end_write(&self, affected: &BTreeSet<PartitionKey>) -> AppResult<usize> {
        let mut state = self.state.lock().map_err(|_| AppError::poisoned("session state"))?;
        for key in affected {
            if let Some(count) = state.inflight.get_mut(key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.inflight.remove(key);
                }
            }
        }

        let mut still_deferred = VecDeque::new();
        let mut deferred_ids = HashSet::new();
        let mut replayed = 0usize;
        while let Some(event) = state.deferred.pop_front() {
            if state.is_blocked(&event, &deferred_ids) {
                deferred_ids.insert(event.activity.id.clone());
                still_deferred.push_back(event);
                continue;
            }
            reconciler::merge_event(&mut state.store, &event);
            replayed += 1;
        }
        state.deferred = still_deferred;

        if replayed > 0 {
            tracing::debug!(replayed, remaining = state.deferred.len(), "replayed deferred realtime events");
        }
        Ok(replayed)
    }

    /// Merges a remote event now, or queues it behind an in-flight move.
    pub(crate) fn reconcile(&self, event: RealtimeEvent) -> AppResult<ReconcileOutcome> {
        let mut state = self.state.lock().map_err(|_| AppError::poisoned("session state"))?;
        let deferred_ids = state
            .deferred
            .iter()
            .map(|queued| queued.activity.id.clone())
            .collect::<HashSet<_>>();
        if state.is_blocked(&event, &deferred_ids) {
            tracing::debug!(
                activity_id = %event.activity.id,
                operation = event.operation.as_str(),
                "deferring realtime event behind in-flight move"
            );
            state.deferred.push_back(event);
            return Ok(ReconcileOutcome::Deferred);
        }
        Ok(reconciler::merge_event(&mut state.store, &event))
    }
}
