//! Merges the per-trip realtime change feed into the local store.
//!
//! Merges are idempotent by id. Updates to the same id apply in arrival
//! order; there is no causal ordering beyond that.

use crate::errors::{AppError, AppResult};
use crate::models::{Activity, FeedOperation, PartitionKey, RealtimeEvent};
use crate::persistence::RealtimeFeed;
use crate::session::SessionState;
use crate::store::ActivityStore;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Insert for an id we already hold, usually our own optimistic echo.
    AlreadyPresent,
    Unchanged,
    UnknownActivity,
    ForeignTrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    Skipped(SkipReason),
    Deferred,
}

/// Partitions an event would write to: where the record is now and where the
/// event says it belongs.
pub(crate) fn touched_partitions(store: &ActivityStore, event: &RealtimeEvent) -> Vec<PartitionKey> {
    let mut keys = vec![event.activity.partition()];
    if let Some(existing) = store.get(&event.activity.id) {
        if existing.partition() != event.activity.partition() {
            keys.push(existing.partition());
        }
    }
    keys
}

pub(crate) fn merge_event(store: &mut ActivityStore, event: &RealtimeEvent) -> ReconcileOutcome {
    let incoming = &event.activity;
    match event.operation {
        FeedOperation::Insert => {
            if store.contains(&incoming.id) {
                return ReconcileOutcome::Skipped(SkipReason::AlreadyPresent);
            }
            store.upsert(incoming.clone());
            ReconcileOutcome::Applied
        }
        FeedOperation::Update => {
            let merged = match store.get(&incoming.id) {
                Some(existing) => {
                    let merged = merge_activity(existing, incoming);
                    if &merged == existing {
                        return ReconcileOutcome::Skipped(SkipReason::Unchanged);
                    }
                    merged
                }
                // Update that overtook its insert.
                None => incoming.clone(),
            };
            store.upsert(merged);
            ReconcileOutcome::Applied
        }
        FeedOperation::Delete => {
            if store.remove(&incoming.id).is_some() {
                ReconcileOutcome::Applied
            } else {
                tracing::debug!(
                    error = %AppError::Reconciliation(format!("delete for unknown activity {}", incoming.id)),
                    "ignoring realtime delete"
                );
                ReconcileOutcome::Skipped(SkipReason::UnknownActivity)
            }
        }
    }
}

fn merge_activity(existing: &Activity, incoming: &Activity) -> Activity {
    let mut merged = incoming.clone();
    merged.details = match (&existing.details, &incoming.details) {
        (serde_json::Value::Object(current), serde_json::Value::Object(patch)) => {
            let mut fields = current.clone();
            for (key, value) in patch {
                fields.insert(key.clone(), value.clone());
            }
            serde_json::Value::Object(fields)
        }
        (current, serde_json::Value::Null) => current.clone(),
        (_, patch) => patch.clone(),
    };
    merged
}

fn apply_event(session: &SessionState, event: RealtimeEvent) -> AppResult<ReconcileOutcome> {
    if event.activity.trip_id != session.trip_id() {
        tracing::debug!(
            activity_id = %event.activity.id,
            trip_id = %event.activity.trip_id,
            "ignoring realtime event for another trip"
        );
        return Ok(ReconcileOutcome::Skipped(SkipReason::ForeignTrip));
    }
    session.reconcile(event)
}

struct FeedTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct RealtimeReconciler {
    session: Arc<SessionState>,
    task: Mutex<Option<FeedTask>>,
}

impl RealtimeReconciler {
    pub fn new(session: Arc<SessionState>) -> Self {
        Self {
            session,
            task: Mutex::new(None),
        }
    }

    pub fn apply(&self, event: RealtimeEvent) -> AppResult<ReconcileOutcome> {
        apply_event(&self.session, event)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().is_some_and(|task| !task.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Subscribes to the trip's feed and consumes it until [`stop`](Self::stop)
    /// or until the feed closes. Calling it while running is a no-op.
    pub fn start(&self, feed: &dyn RealtimeFeed, buffer: usize) -> AppResult<()> {
        let mut task = self.task.lock().map_err(|_| AppError::poisoned("reconciler task"))?;
        if task.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return Ok(());
        }

        let mut subscription = feed.subscribe(self.session.trip_id(), buffer)?;
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let session = self.session.clone();
        let handle = tokio::spawn(async move {
            tracing::info!(trip_id = %subscription.trip_id, "realtime feed subscribed");
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    next = subscription.events.recv() => {
                        let Some(event) = next else {
                            tracing::info!(trip_id = %subscription.trip_id, "realtime feed closed");
                            break;
                        };
                        let activity_id = event.activity.id.clone();
                        let operation = event.operation;
                        match apply_event(&session, event) {
                            Ok(outcome) => tracing::trace!(
                                activity_id = %activity_id,
                                operation = operation.as_str(),
                                ?outcome,
                                "realtime event reconciled"
                            ),
                            Err(error) => tracing::warn!(
                                activity_id = %activity_id,
                                error = %error,
                                "failed to reconcile realtime event"
                            ),
                        }
                    }
                }
            }
            tracing::info!(trip_id = %subscription.trip_id, "realtime feed unsubscribed");
        });

        *task = Some(FeedTask { shutdown, handle });
        Ok(())
    }

    /// Stops consuming and drops the subscription.
    pub async fn stop(&self) {
        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        if let Some(FeedTask { shutdown, handle }) = task {
            let _ = shutdown.send(());
            if let Err(error) = handle.await {
                tracing::warn!(error = %error, "realtime feed task ended abnormally");
            }
        }
    }
}
