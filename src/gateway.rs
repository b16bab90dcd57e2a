//! Optimistic application of reorder plans with persistence-failure correction.

use crate::config::EngineConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{Activity, PartitionKey, TimePeriod};
use crate::persistence::ActivityPersistence;
use crate::planner::{self, MoveIntent, ReorderPlan};
use crate::session::{PartitionGuard, SessionState};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::timeout;

/// Host hook for user-visible failures.
pub type FailureNotifier = Arc<dyn Fn(&AppError) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    NoOp,
    Applied(ReorderPlan),
}

pub struct MutationGateway {
    session: Arc<SessionState>,
    persistence: Arc<dyn ActivityPersistence>,
    config: EngineConfig,
    notifier: RwLock<Option<FailureNotifier>>,
}

impl MutationGateway {
    pub fn new(session: Arc<SessionState>, persistence: Arc<dyn ActivityPersistence>, config: EngineConfig) -> Self {
        Self {
            session,
            persistence,
            config,
            notifier: RwLock::new(None),
        }
    }

    pub fn set_notifier(&self, notifier: FailureNotifier) {
        match self.notifier.write() {
            Ok(mut writer) => *writer = Some(notifier),
            Err(_) => tracing::error!("failure notifier lock poisoned; notifier not installed"),
        }
    }

    /// Plans, applies optimistically, persists, and corrects on failure.
    ///
    /// Moves touching overlapping partitions run one after another in the
    /// order they were issued. A failed or timed-out persistence call returns
    /// [`AppError::Persistence`] after the store has been corrected.
    pub async fn apply_move(&self, intent: MoveIntent) -> AppResult<MoveOutcome> {
        let mut retries = 0u32;
        loop {
            let provisional = self.plan(&intent)?;
            if provisional.is_empty() {
                tracing::debug!(activity_id = %intent.activity_id(), kind = intent.kind(), "move intent is a no-op");
                return Ok(MoveOutcome::NoOp);
            }

            let guard = self.session.lock_partitions(&provisional.affected).await?;
            // The store may have moved on while we waited for the locks.
            let plan = self.plan(&intent)?;
            if plan.is_empty() {
                return Ok(MoveOutcome::NoOp);
            }
            if guard.covers(&plan.affected) {
                return self.commit(plan, guard).await;
            }

            retries += 1;
            if retries > self.config.max_plan_retries {
                let error = AppError::Planning(format!(
                    "partitions for activity {} kept changing; intent dropped",
                    intent.activity_id()
                ));
                tracing::warn!(error = %error, "giving up on move intent");
                return Err(error);
            }
            tracing::debug!(activity_id = %intent.activity_id(), retries, "affected partitions shifted; re-planning");
        }
    }

    pub async fn delete_activity(&self, activity_id: &str) -> AppResult<()> {
        self.remove_activities(&[activity_id.to_string()]).await
    }

    pub async fn bulk_delete(&self, activity_ids: &[String]) -> AppResult<()> {
        self.remove_activities(activity_ids).await
    }

    /// Loads the authoritative state of whole days into the store.
    pub async fn refresh_days(&self, days: &[u32]) -> AppResult<()> {
        let affected = days
            .iter()
            .flat_map(|day| TimePeriod::ALL.map(|period| PartitionKey::new(*day, period)))
            .collect::<BTreeSet<_>>();
        if affected.is_empty() {
            return Ok(());
        }
        let _guard = self.session.lock_partitions(&affected).await?;
        // Remote events for these days queue until the fetched rows are installed.
        self.session.mark_inflight(&affected)?;
        let installed = match self.fetch_days(&affected).await {
            Ok(rows) => {
                tracing::info!(days = ?days, activities = rows.len(), "loaded itinerary days");
                self.session.replace_partitions(&affected, rows)
            }
            Err(error) => {
                tracing::warn!(days = ?days, error = %error, "failed to load itinerary days");
                Err(error)
            }
        };
        self.session.end_write(&affected)?;
        installed
    }

    fn plan(&self, intent: &MoveIntent) -> AppResult<ReorderPlan> {
        self.session
            .read(|store| planner::plan(store, intent))?
            .inspect_err(|error| {
                tracing::warn!(activity_id = %intent.activity_id(), kind = intent.kind(), error = %error, "move intent dropped");
            })
    }

    async fn commit(&self, plan: ReorderPlan, _guard: PartitionGuard) -> AppResult<MoveOutcome> {
        let snapshot = self.session.begin_write(&plan.affected, &plan.changes)?;
        tracing::info!(
            activity_id = %plan.activity_id,
            changes = plan.changes.len(),
            partitions = plan.affected.len(),
            "applied move optimistically"
        );

        let persisted = self
            .bounded(
                self.config.persist_timeout(),
                "batch reassign",
                self.persistence.batch_reassign(&plan.changes),
            )
            .await;

        let outcome = match persisted {
            Ok(()) => Ok(MoveOutcome::Applied(plan.clone())),
            Err(error) => {
                tracing::warn!(activity_id = %plan.activity_id, error = %error, "move not persisted; correcting local state");
                self.correct(&plan.affected, snapshot).await;
                self.notify(&error);
                Err(error)
            }
        };

        self.session.end_write(&plan.affected)?;
        outcome
    }

    async fn remove_activities(&self, activity_ids: &[String]) -> AppResult<()> {
        if activity_ids.is_empty() {
            return Ok(());
        }
        let affected = self.session.read(|store| {
            activity_ids
                .iter()
                .filter_map(|id| store.get(id))
                .map(Activity::partition)
                .collect::<BTreeSet<_>>()
        })?;

        let _guard = self.session.lock_partitions(&affected).await?;
        self.session.mark_inflight(&affected)?;

        let removed = match activity_ids {
            [single] => {
                self.bounded(self.config.persist_timeout(), "delete", self.persistence.delete(single))
                    .await
            }
            many => {
                self.bounded(self.config.persist_timeout(), "bulk delete", self.persistence.bulk_delete(many))
                    .await
            }
        };

        // The backend renumbers what is left; take its numbering either way.
        match self.fetch_days(&affected).await {
            Ok(rows) => {
                if let Err(error) = self.session.replace_partitions(&affected, rows) {
                    tracing::error!(error = %error, "failed to install re-fetched partitions");
                }
            }
            Err(error) => tracing::warn!(error = %error, "re-fetch after delete failed; waiting on realtime feed"),
        }
        self.session.end_write(&affected)?;

        match removed {
            Ok(()) => {
                tracing::info!(count = activity_ids.len(), "deleted activities");
                Ok(())
            }
            Err(error) => {
                tracing::warn!(count = activity_ids.len(), error = %error, "delete failed");
                self.notify(&error);
                Err(error)
            }
        }
    }

    /// Replaces `affected` with authoritative rows, or with the pre-move
    /// snapshot when the backend cannot be read either.
    async fn correct(&self, affected: &BTreeSet<PartitionKey>, snapshot: Vec<Activity>) {
        let installed = match self.fetch_days(affected).await {
            Ok(rows) => {
                tracing::info!(partitions = affected.len(), "restored authoritative partitions");
                self.session.replace_partitions(affected, rows)
            }
            Err(error) => {
                tracing::warn!(error = %error, "re-fetch failed; restoring last known state");
                self.session.replace_partitions(affected, snapshot)
            }
        };
        if let Err(error) = installed {
            tracing::error!(error = %error, "failed to correct local state");
        }
    }

    async fn fetch_days(&self, affected: &BTreeSet<PartitionKey>) -> AppResult<Vec<Activity>> {
        let days = affected.iter().map(|key| key.day_number).collect::<BTreeSet<_>>();
        let mut rows = Vec::new();
        for day in days {
            let fetched = self
                .bounded(
                    self.config.fetch_timeout(),
                    "fetch partition",
                    self.persistence.fetch_partition(self.session.trip_id(), day),
                )
                .await?;
            rows.extend(fetched);
        }
        Ok(rows)
    }

    async fn bounded<T>(
        &self,
        limit: Duration,
        operation: &str,
        call: impl Future<Output = AppResult<T>>,
    ) -> AppResult<T> {
        match timeout(limit, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(AppError::Persistence(message))) => Err(AppError::Persistence(message)),
            Ok(Err(other)) => Err(AppError::Persistence(format!("{operation} failed: {other}"))),
            Err(_) => Err(AppError::Persistence(format!(
                "{operation} timed out after {}ms",
                limit.as_millis()
            ))),
        }
    }

    fn notify(&self, error: &AppError) {
        let notifier = match self.notifier.read() {
            Ok(reader) => reader.clone(),
            Err(_) => None,
        };
        if let Some(notifier) = notifier {
            notifier(error);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedBackend;
    use super::{MoveOutcome, MutationGateway};
    use crate::config::EngineConfig;
    use crate::errors::AppError;
    use crate::models::{Activity, PartitionKey, RealtimeEvent, TimePeriod};
    use crate::planner::MoveIntent;
    use crate::reconciler::ReconcileOutcome;
    use crate::session::SessionState;
    use crate::store::fixtures::activity;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn seed() -> Vec<Activity> {
        vec![
            activity("x", 1, TimePeriod::Afternoon, 1),
            activity("a", 1, TimePeriod::Afternoon, 2),
            activity("y", 1, TimePeriod::Afternoon, 3),
            activity("m1", 2, TimePeriod::Morning, 1),
            activity("m2", 2, TimePeriod::Morning, 2),
        ]
    }

    fn gateway(backend: Arc<ScriptedBackend>) -> (Arc<SessionState>, Arc<MutationGateway>) {
        let session = Arc::new(SessionState::new("trip-1"));
        session.load(seed()).expect("load");
        let config = EngineConfig {
            persist_timeout_ms: 200,
            fetch_timeout_ms: 200,
            ..EngineConfig::default()
        };
        let gateway = Arc::new(MutationGateway::new(session.clone(), backend, config));
        (session, gateway)
    }

    fn cross_day_move() -> MoveIntent {
        MoveIntent::AppendToPartition {
            activity_id: "a".to_string(),
            target_day: 2,
            target_period: TimePeriod::Morning,
        }
    }

    fn placement(session: &SessionState, id: &str) -> (u32, TimePeriod, u32) {
        session
            .read(|store| store.get(id).map(|a| (a.day_number, a.time_period, a.order_index)))
            .expect("read")
            .expect("activity present")
    }

    #[tokio::test]
    async fn successful_move_persists_one_batch() {
        let backend = Arc::new(ScriptedBackend::with_rows(seed()));
        let (session, gateway) = gateway(backend.clone());

        let outcome = gateway.apply_move(cross_day_move()).await.expect("move");
        let MoveOutcome::Applied(plan) = outcome else {
            panic!("expected applied move");
        };
        assert_eq!(plan.changes.len(), 2);
        assert_eq!(backend.batch_count(), 1);
        assert_eq!(placement(&session, "a"), (2, TimePeriod::Morning, 3));
        assert_eq!(placement(&session, "y"), (1, TimePeriod::Afternoon, 2));
    }

    #[tokio::test]
    async fn rejected_batch_restores_authoritative_state_and_notifies() {
        let backend = Arc::new(ScriptedBackend::with_rows(seed()));
        backend.reject_writes.store(true, Ordering::SeqCst);
        let (session, gateway) = gateway(backend.clone());
        let notified = Arc::new(AtomicUsize::new(0));
        gateway.set_notifier({
            let notified = notified.clone();
            Arc::new(move |error: &AppError| {
                assert!(error.is_user_visible());
                notified.fetch_add(1, Ordering::SeqCst);
            })
        });

        let err = gateway.apply_move(cross_day_move()).await.expect_err("write rejected");
        assert!(matches!(err, AppError::Persistence(_)));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(placement(&session, "a"), (1, TimePeriod::Afternoon, 2));
        assert_eq!(placement(&session, "y"), (1, TimePeriod::Afternoon, 3));
        assert_eq!(
            session
                .read(|store| store.partition_len(PartitionKey::new(2, TimePeriod::Morning)))
                .expect("read"),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_treated_as_failure() {
        let backend = Arc::new(ScriptedBackend::with_rows(seed()));
        backend.hang_writes.store(true, Ordering::SeqCst);
        let (session, gateway) = gateway(backend);

        let err = gateway.apply_move(cross_day_move()).await.expect_err("timed out");
        assert!(err.to_string().contains("timed out"));
        assert_eq!(placement(&session, "a"), (1, TimePeriod::Afternoon, 2));
    }

    #[tokio::test]
    async fn unreadable_backend_falls_back_to_pre_move_snapshot() {
        let mut authoritative = seed();
        // Backend drifted from what the session holds; it cannot be read back.
        authoritative.retain(|row| row.id != "x");
        let backend = Arc::new(ScriptedBackend::with_rows(authoritative));
        backend.reject_writes.store(true, Ordering::SeqCst);
        backend.reject_reads.store(true, Ordering::SeqCst);
        let (session, gateway) = gateway(backend);

        gateway.apply_move(cross_day_move()).await.expect_err("write rejected");
        assert_eq!(placement(&session, "x"), (1, TimePeriod::Afternoon, 1));
        assert_eq!(placement(&session, "a"), (1, TimePeriod::Afternoon, 2));
    }

    #[tokio::test]
    async fn noop_and_unknown_intents_never_reach_backend() {
        let backend = Arc::new(ScriptedBackend::with_rows(seed()));
        let (session, gateway) = gateway(backend.clone());
        let version = session.read(|store| store.version()).expect("read");

        let outcome = gateway
            .apply_move(MoveIntent::Reorder {
                activity_id: "a".to_string(),
                target_activity_id: "a".to_string(),
            })
            .await
            .expect("no-op");
        assert_eq!(outcome, MoveOutcome::NoOp);

        let err = gateway
            .apply_move(MoveIntent::AppendToDay {
                activity_id: "ghost".to_string(),
                target_day: 2,
            })
            .await
            .expect_err("unknown activity");
        assert!(matches!(err, AppError::Planning(_)));
        assert_eq!(backend.batch_count(), 0);
        assert_eq!(session.read(|store| store.version()).expect("read"), version);
    }

    #[tokio::test]
    async fn overlapping_moves_apply_in_issue_order() {
        let backend = Arc::new(ScriptedBackend::with_rows(seed()));
        let (session, gateway) = gateway(backend.clone());

        let first = gateway.apply_move(cross_day_move());
        let second = gateway.apply_move(MoveIntent::InsertAt {
            activity_id: "y".to_string(),
            target_day: 2,
            target_period: TimePeriod::Morning,
            position: 1,
        });
        let (first, second) = tokio::join!(first, second);
        first.expect("first move");
        second.expect("second move");

        assert_eq!(backend.batch_count(), 2);
        assert_eq!(placement(&session, "y"), (2, TimePeriod::Morning, 1));
        assert_eq!(placement(&session, "a"), (2, TimePeriod::Morning, 4));
        for key in session.read(|store| store.partition_keys()).expect("read") {
            assert!(session.read(|store| store.is_normalized(key)).expect("read"));
        }
    }

    #[tokio::test]
    async fn remote_event_waits_for_inflight_move() {
        let backend = Arc::new(ScriptedBackend::gated(seed()));
        let (session, gateway) = gateway(backend.clone());

        let pending = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.apply_move(cross_day_move()).await }
        });
        for _ in 0..100 {
            if placement(&session, "a").0 == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(placement(&session, "a"), (2, TimePeriod::Morning, 3));

        let mut remote = activity("m2", 2, TimePeriod::Morning, 2);
        remote.details = serde_json::json!({ "title": "renamed elsewhere" });
        let outcome = session.reconcile(RealtimeEvent::update(remote)).expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::Deferred);

        backend.gate.as_ref().expect("gate").notify_one();
        pending.await.expect("join").expect("move");

        let title = session
            .read(|store| store.get("m2").map(|a| a.details["title"].clone()))
            .expect("read");
        assert_eq!(title, Some(serde_json::json!("renamed elsewhere")));
        assert_eq!(session.deferred_len().expect("len"), 0);
    }

    #[tokio::test]
    async fn delete_takes_backend_renumbering() {
        let backend = Arc::new(ScriptedBackend::with_rows(seed()));
        let (session, gateway) = gateway(backend);

        gateway.delete_activity("x").await.expect("delete");
        assert!(session.read(|store| !store.contains("x")).expect("read"));
        assert_eq!(placement(&session, "a"), (1, TimePeriod::Afternoon, 1));
        assert_eq!(placement(&session, "y"), (1, TimePeriod::Afternoon, 2));

        gateway
            .bulk_delete(&["a".to_string(), "m1".to_string()])
            .await
            .expect("bulk delete");
        assert_eq!(placement(&session, "y"), (1, TimePeriod::Afternoon, 1));
        assert_eq!(placement(&session, "m2"), (2, TimePeriod::Morning, 1));
    }

    #[tokio::test]
    async fn remote_insert_during_refresh_survives_the_reload() {
        let backend = Arc::new(ScriptedBackend::fetch_gated(seed()));
        let (session, gateway) = gateway(backend.clone());

        let pending = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.refresh_days(&[2]).await }
        });
        for _ in 0..100 {
            if backend.fetches.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 1);

        let remote = activity("late", 2, TimePeriod::Evening, 1);
        let outcome = session.reconcile(RealtimeEvent::insert(remote)).expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::Deferred);

        backend.fetch_gate.as_ref().expect("gate").notify_one();
        pending.await.expect("join").expect("refresh");

        assert_eq!(placement(&session, "late"), (2, TimePeriod::Evening, 1));
        assert_eq!(placement(&session, "m1"), (2, TimePeriod::Morning, 1));
        assert_eq!(session.deferred_len().expect("len"), 0);
    }

    #[tokio::test]
    async fn failed_refresh_releases_queued_events() {
        let backend = Arc::new(ScriptedBackend::with_rows(seed()));
        backend.reject_reads.store(true, Ordering::SeqCst);
        let (session, gateway) = gateway(backend);

        let err = gateway.refresh_days(&[2]).await.expect_err("read rejected");
        assert!(matches!(err, AppError::Persistence(_)));
        let remote = activity("late", 2, TimePeriod::Evening, 1);
        assert_eq!(
            session.reconcile(RealtimeEvent::insert(remote)).expect("reconcile"),
            ReconcileOutcome::Applied
        );
    }

    #[tokio::test]
    async fn refresh_days_replaces_local_days() {
        let mut authoritative = seed();
        authoritative.push(activity("new", 2, TimePeriod::Evening, 1));
        let backend = Arc::new(ScriptedBackend::with_rows(authoritative));
        let (session, gateway) = gateway(backend);

        gateway.refresh_days(&[2]).await.expect("refresh");
        assert_eq!(placement(&session, "new"), (2, TimePeriod::Evening, 1));
    }
}
