//! Pure reorder planning: `(store snapshot, intent) -> plan`.
//!
//! A plan only lists assignments that differ from the snapshot, so an empty
//! plan means the intent is a no-op. Every partition a plan touches comes out
//! numbered `1..=N`.

use crate::errors::{AppError, AppResult};
use crate::models::{ActivityChange, PartitionKey, TimePeriod};
use crate::store::ActivityStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MoveIntent {
    /// Dropped on another activity.
    Reorder {
        activity_id: String,
        target_activity_id: String,
    },
    /// Dropped on a day selector; keeps the source's time period.
    AppendToDay { activity_id: String, target_day: u32 },
    /// Dropped on a day + time-period region.
    AppendToPartition {
        activity_id: String,
        target_day: u32,
        target_period: TimePeriod,
    },
    /// Lands the activity at `order_index == position`, clamped to the
    /// partition's valid range. Members at or after it shift up by one.
    InsertAt {
        activity_id: String,
        target_day: u32,
        target_period: TimePeriod,
        position: u32,
    },
}

impl MoveIntent {
    pub fn activity_id(&self) -> &str {
        match self {
            Self::Reorder { activity_id, .. }
            | Self::AppendToDay { activity_id, .. }
            | Self::AppendToPartition { activity_id, .. }
            | Self::InsertAt { activity_id, .. } => activity_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Reorder { .. } => "reorder",
            Self::AppendToDay { .. } => "append-to-day",
            Self::AppendToPartition { .. } => "append-to-partition",
            Self::InsertAt { .. } => "insert-at",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderPlan {
    pub activity_id: String,
    /// Sorted by destination partition, then order index.
    pub changes: Vec<ActivityChange>,
    /// Partitions whose membership or numbering changes, before or after.
    pub affected: BTreeSet<PartitionKey>,
}

impl ReorderPlan {
    fn noop(activity_id: &str) -> Self {
        Self {
            activity_id: activity_id.to_string(),
            changes: Vec::new(),
            affected: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

enum Placement {
    End,
    /// Index into the destination list with the source already removed.
    Index(usize),
}

pub fn plan(store: &ActivityStore, intent: &MoveIntent) -> AppResult<ReorderPlan> {
    let activity_id = intent.activity_id();
    let source = store
        .get(activity_id)
        .ok_or_else(|| AppError::Planning(format!("activity {activity_id} is not in the store")))?;
    let source_key = source.partition();

    let (destination, placement) = match intent {
        MoveIntent::Reorder {
            target_activity_id, ..
        } => {
            if target_activity_id == activity_id {
                return Ok(ReorderPlan::noop(activity_id));
            }
            let target = store.get(target_activity_id).ok_or_else(|| {
                AppError::Planning(format!("target activity {target_activity_id} is not in the store"))
            })?;
            let destination = target.partition();
            let target_index = member_ids(store, destination, None)
                .iter()
                .position(|id| id == target_activity_id)
                .unwrap_or(0);
            // Same partition this is remove-then-insert at the target's old index.
            // Across partitions the source lands just before the target.
            (destination, Placement::Index(target_index))
        }
        MoveIntent::AppendToDay { target_day, .. } => {
            let target_day = valid_day(*target_day)?;
            if target_day == source.day_number {
                return Ok(ReorderPlan::noop(activity_id));
            }
            (PartitionKey::new(target_day, source.time_period), Placement::End)
        }
        MoveIntent::AppendToPartition {
            target_day,
            target_period,
            ..
        } => (
            PartitionKey::new(valid_day(*target_day)?, *target_period),
            Placement::End,
        ),
        MoveIntent::InsertAt {
            target_day,
            target_period,
            position,
            ..
        } => {
            let destination = PartitionKey::new(valid_day(*target_day)?, *target_period);
            // The source's own slot is vacated first, so it always lands on `position`.
            let remaining = member_ids(store, destination, Some(activity_id));
            let index = (*position).clamp(1, remaining.len() as u32 + 1) as usize - 1;
            (destination, Placement::Index(index))
        }
    };

    let mut destination_ids = member_ids(store, destination, Some(activity_id));
    let insert_at = match placement {
        Placement::End => destination_ids.len(),
        Placement::Index(index) => index.min(destination_ids.len()),
    };
    destination_ids.insert(insert_at, activity_id.to_string());

    let mut layouts = vec![(destination, destination_ids)];
    if source_key != destination {
        layouts.push((source_key, member_ids(store, source_key, Some(activity_id))));
    }
    layouts.sort_by_key(|(key, _)| *key);

    let mut plan = ReorderPlan::noop(activity_id);
    for (key, ids) in layouts {
        for (position, id) in ids.into_iter().enumerate() {
            let order_index = position as u32 + 1;
            let Some(current) = store.get(&id) else {
                continue;
            };
            if current.partition() == key && current.order_index == order_index {
                continue;
            }
            plan.affected.insert(current.partition());
            plan.affected.insert(key);
            plan.changes.push(ActivityChange {
                activity_id: id,
                day_number: key.day_number,
                time_period: key.time_period,
                order_index,
            });
        }
    }

    Ok(plan)
}

fn member_ids(store: &ActivityStore, key: PartitionKey, exclude: Option<&str>) -> Vec<String> {
    store
        .partition(key)
        .into_iter()
        .filter(|activity| Some(activity.id.as_str()) != exclude)
        .map(|activity| activity.id.clone())
        .collect()
}

fn valid_day(day_number: u32) -> AppResult<u32> {
    if day_number == 0 {
        return Err(AppError::Planning("day numbers start at 1".to_string()));
    }
    Ok(day_number)
}
