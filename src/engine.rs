//! One trip session wired end to end.
//!
//! The engine owns the store and hands out the two writers that may touch it:
//! the mutation gateway for local moves and deletes, and the realtime
//! reconciler for remote changes. Presence runs beside them and never touches
//! the store.

use crate::config::EngineConfig;
use crate::drag::{DragController, DragEvent};
use crate::errors::AppResult;
use crate::gateway::{FailureNotifier, MoveOutcome, MutationGateway};
use crate::models::{Activity, PartitionKey, PresenceRecord};
use crate::persistence::{ActivityPersistence, PresenceChannel, RealtimeFeed};
use crate::planner::MoveIntent;
use crate::presence::PresenceTracker;
use crate::reconciler::RealtimeReconciler;
use crate::session::SessionState;
use crate::store::StoreChange;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Host-provided collaborators. One backend may fill several roles.
#[derive(Clone)]
pub struct EngineBackends {
    pub persistence: Arc<dyn ActivityPersistence>,
    pub feed: Arc<dyn RealtimeFeed>,
    pub presence: Arc<dyn PresenceChannel>,
}

pub struct ItineraryEngine {
    config: EngineConfig,
    session: Arc<SessionState>,
    gateway: MutationGateway,
    reconciler: RealtimeReconciler,
    presence: PresenceTracker,
    feed: Arc<dyn RealtimeFeed>,
}

impl ItineraryEngine {
    pub fn new(
        trip_id: impl Into<String>,
        identity: PresenceRecord,
        config: EngineConfig,
        backends: EngineBackends,
    ) -> AppResult<Self> {
        config.validate()?;
        let session = Arc::new(SessionState::new(trip_id));
        let gateway = MutationGateway::new(session.clone(), backends.persistence, config.clone());
        let reconciler = RealtimeReconciler::new(session.clone());
        let presence = PresenceTracker::new(
            session.trip_id(),
            identity,
            backends.presence,
            config.presence_debounce(),
            config.feed_buffer,
        );
        Ok(Self {
            config,
            session,
            gateway,
            reconciler,
            presence,
            feed: backends.feed,
        })
    }

    pub fn trip_id(&self) -> &str {
        self.session.trip_id()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribes to the change feed before loading `days`, so nothing written
    /// between the fetch and the subscription is missed.
    pub async fn start(&self, days: &[u32]) -> AppResult<()> {
        self.reconciler.start(self.feed.as_ref(), self.config.feed_buffer)?;
        self.gateway.refresh_days(days).await?;
        self.presence.start()?;
        tracing::info!(trip_id = %self.trip_id(), days = ?days, "itinerary session started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.presence.stop().await;
        self.reconciler.stop().await;
        tracing::info!(trip_id = %self.trip_id(), "itinerary session stopped");
    }

    pub fn is_running(&self) -> bool {
        self.reconciler.is_running() && self.presence.is_running()
    }

    pub fn on_persistence_failure(&self, notifier: FailureNotifier) {
        self.gateway.set_notifier(notifier);
    }

    pub async fn submit(&self, intent: MoveIntent) -> AppResult<MoveOutcome> {
        self.gateway.apply_move(intent).await
    }

    /// Feeds a gesture event to `controller` and submits the intent it
    /// produces, if any.
    pub async fn handle_gesture(
        &self,
        controller: &mut DragController,
        event: DragEvent,
    ) -> AppResult<Option<MoveOutcome>> {
        match controller.handle(event) {
            Some(intent) => self.submit(intent).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn delete_activity(&self, activity_id: &str) -> AppResult<()> {
        self.gateway.delete_activity(activity_id).await
    }

    pub async fn bulk_delete(&self, activity_ids: &[String]) -> AppResult<()> {
        self.gateway.bulk_delete(activity_ids).await
    }

    pub async fn refresh_days(&self, days: &[u32]) -> AppResult<()> {
        self.gateway.refresh_days(days).await
    }

    pub fn activity(&self, activity_id: &str) -> AppResult<Option<Activity>> {
        self.session.read(|store| store.get(activity_id).cloned())
    }

    /// Activities of one day in display order.
    pub fn day(&self, day_number: u32) -> AppResult<Vec<Activity>> {
        self.session
            .read(|store| store.for_day(day_number).into_iter().cloned().collect())
    }

    pub fn partition(&self, key: PartitionKey) -> AppResult<Vec<Activity>> {
        self.session
            .read(|store| store.partition(key).into_iter().cloned().collect())
    }

    pub fn is_consistent(&self) -> AppResult<bool> {
        self.session.read(|store| {
            store
                .partition_keys()
                .into_iter()
                .all(|key| store.is_normalized(key))
        })
    }

    pub fn deferred_events(&self) -> AppResult<usize> {
        self.session.deferred_len()
    }

    pub fn subscribe_store(&self) -> AppResult<broadcast::Receiver<StoreChange>> {
        self.session.subscribe()
    }

    pub fn set_attention(&self, current_tab: impl Into<String>, current_day: Option<u32>) {
        self.presence.set_attention(current_tab, current_day);
    }

    pub fn peers(&self) -> Vec<PresenceRecord> {
        self.presence.peers()
    }

    pub fn subscribe_presence(&self) -> watch::Receiver<Vec<PresenceRecord>> {
        self.presence.subscribe()
    }
}
