//! In-memory activity collection with a derived per-partition index.
//!
//! Every mutation bumps [`ActivityStore::version`] and emits one
//! [`StoreChange`] to subscribers. Nothing here suspends.

use crate::models::{Activity, ActivityChange, PartitionKey, TimePeriod};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::broadcast;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Replaced {
        version: u64,
    },
    Upserted {
        version: u64,
        activity_id: String,
        partition: PartitionKey,
    },
    Removed {
        version: u64,
        activity_id: String,
        partition: PartitionKey,
    },
    Reassigned {
        version: u64,
        partitions: Vec<PartitionKey>,
    },
}

#[derive(Debug)]
pub struct ActivityStore {
    activities: HashMap<String, Activity>,
    // (order_index, id) keeps iteration deterministic even on a duplicate index.
    index: BTreeMap<PartitionKey, BTreeSet<(u32, String)>>,
    version: u64,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for ActivityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            activities: HashMap::new(),
            index: BTreeMap::new(),
            version: 0,
            changes,
        }
    }

    pub fn from_activities(activities: impl IntoIterator<Item = Activity>) -> Self {
        let mut store = Self::new();
        store.store(activities);
        store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    pub fn get(&self, activity_id: &str) -> Option<&Activity> {
        self.activities.get(activity_id)
    }

    pub fn contains(&self, activity_id: &str) -> bool {
        self.activities.contains_key(activity_id)
    }

    /// Replaces the whole collection. Duplicate ids keep the last record.
    pub fn store(&mut self, activities: impl IntoIterator<Item = Activity>) {
        self.activities.clear();
        self.index.clear();
        for activity in activities {
            if let Some(previous) = self.activities.remove(&activity.id) {
                self.index_remove(&previous);
            }
            self.index_insert(&activity);
            self.activities.insert(activity.id.clone(), activity);
        }
        let version = self.bump();
        self.emit(StoreChange::Replaced { version });
    }

    pub fn merge(&mut self, activities: impl IntoIterator<Item = Activity>) {
        for activity in activities {
            self.upsert(activity);
        }
    }

    /// Inserts or replaces by id, returning the previous record.
    pub fn upsert(&mut self, activity: Activity) -> Option<Activity> {
        let previous = self.activities.remove(&activity.id);
        if let Some(previous) = previous.as_ref() {
            self.index_remove(previous);
        }
        self.index_insert(&activity);
        let activity_id = activity.id.clone();
        let partition = activity.partition();
        self.activities.insert(activity_id.clone(), activity);

        let version = self.bump();
        self.emit(StoreChange::Upserted {
            version,
            activity_id,
            partition,
        });
        previous
    }

    pub fn remove(&mut self, activity_id: &str) -> Option<Activity> {
        let removed = self.activities.remove(activity_id)?;
        self.index_remove(&removed);
        let version = self.bump();
        self.emit(StoreChange::Removed {
            version,
            activity_id: removed.id.clone(),
            partition: removed.partition(),
        });
        Some(removed)
    }

    /// Members of one partition ordered by `order_index`.
    pub fn partition(&self, key: PartitionKey) -> Vec<&Activity> {
        self.index
            .get(&key)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|(_, id)| self.activities.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn partition_len(&self, key: PartitionKey) -> usize {
        self.index.get(&key).map(BTreeSet::len).unwrap_or(0)
    }

    pub fn partition_keys(&self) -> Vec<PartitionKey> {
        self.index
            .iter()
            .filter(|(_, members)| !members.is_empty())
            .map(|(key, _)| *key)
            .collect()
    }

    /// A day's activities ordered by period rank, then `order_index`.
    pub fn for_day(&self, day_number: u32) -> Vec<&Activity> {
        let first = PartitionKey::new(day_number, TimePeriod::Morning);
        let last = PartitionKey::new(day_number, TimePeriod::Evening);
        self.index
            .range(first..=last)
            .flat_map(|(_, members)| members.iter())
            .filter_map(|(_, id)| self.activities.get(id))
            .collect()
    }

    /// True when the partition's indexes are exactly `1..=N`.
    pub fn is_normalized(&self, key: PartitionKey) -> bool {
        self.index
            .get(&key)
            .map(|members| {
                members
                    .iter()
                    .enumerate()
                    .all(|(position, (order_index, _))| *order_index as usize == position + 1)
            })
            .unwrap_or(true)
    }

    /// Writes plan assignments; day, period and index move together per record.
    /// Returns the number of records written.
    pub fn apply_changes(&mut self, changes: &[ActivityChange]) -> usize {
        let mut partitions = BTreeSet::new();
        let mut applied = 0usize;
        for change in changes {
            let Some(mut activity) = self.activities.remove(&change.activity_id) else {
                tracing::warn!(activity_id = %change.activity_id, "skipping assignment for unknown activity");
                continue;
            };
            self.index_remove(&activity);
            partitions.insert(activity.partition());
            activity.assign(change);
            partitions.insert(activity.partition());
            self.index_insert(&activity);
            self.activities.insert(activity.id.clone(), activity);
            applied += 1;
        }

        if applied > 0 {
            let version = self.bump();
            self.emit(StoreChange::Reassigned {
                version,
                partitions: partitions.into_iter().collect(),
            });
        }
        applied
    }

    /// Copies every member of `keys`, for later restore.
    pub fn snapshot_partitions(&self, keys: &BTreeSet<PartitionKey>) -> Vec<Activity> {
        keys.iter()
            .flat_map(|key| self.partition(*key))
            .cloned()
            .collect()
    }

    /// Drops the local members of `keys` and installs the rows of `authoritative`
    /// that belong to `keys`. Rows for other partitions are ignored.
    pub fn replace_partitions(&mut self, keys: &BTreeSet<PartitionKey>, authoritative: Vec<Activity>) {
        let stale_ids = keys
            .iter()
            .filter_map(|key| self.index.get(key))
            .flat_map(|members| members.iter().map(|(_, id)| id.clone()))
            .collect::<Vec<_>>();
        for id in stale_ids {
            if let Some(stale) = self.activities.remove(&id) {
                self.index_remove(&stale);
            }
        }

        for activity in authoritative {
            if !keys.contains(&activity.partition()) {
                continue;
            }
            if let Some(previous) = self.activities.remove(&activity.id) {
                self.index_remove(&previous);
            }
            self.index_insert(&activity);
            self.activities.insert(activity.id.clone(), activity);
        }

        let version = self.bump();
        self.emit(StoreChange::Reassigned {
            version,
            partitions: keys.iter().copied().collect(),
        });
    }

    fn index_insert(&mut self, activity: &Activity) {
        self.index
            .entry(activity.partition())
            .or_default()
            .insert((activity.order_index, activity.id.clone()));
    }

    fn index_remove(&mut self, activity: &Activity) {
        let key = activity.partition();
        if let Some(members) = self.index.get_mut(&key) {
            members.remove(&(activity.order_index, activity.id.clone()));
            if members.is_empty() {
                self.index.remove(&key);
            }
        }
    }

    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn emit(&self, change: StoreChange) {
        // No subscribers is fine; the host may not be rendering yet.
        let _ = self.changes.send(change);
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::models::{Activity, TimePeriod};

    pub fn activity(id: &str, day_number: u32, time_period: TimePeriod, order_index: u32) -> Activity {
        Activity {
            id: id.to_string(),
            trip_id: "trip-1".to_string(),
            day_number,
            time_period,
            order_index,
            details: serde_json::json!({ "title": id }),
        }
    }
}
