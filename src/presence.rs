//! Ephemeral "who is looking where" records for a trip.

use crate::errors::{AppError, AppResult};
use crate::models::PresenceRecord;
use crate::persistence::PresenceChannel;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct Mirror {
    own_user_id: String,
    records: Mutex<BTreeMap<String, PresenceRecord>>,
    updates: watch::Sender<Vec<PresenceRecord>>,
}

impl Mirror {
    fn receive(&self, records: Vec<PresenceRecord>) -> AppResult<bool> {
        let incoming = records
            .into_iter()
            .filter(|record| record.user_id != self.own_user_id)
            .map(|record| (record.user_id.clone(), record))
            .collect::<BTreeMap<_, _>>();

        let mut current = self.records.lock().map_err(|_| AppError::poisoned("presence mirror"))?;
        if current.keys().eq(incoming.keys()) {
            return Ok(false);
        }
        *current = incoming;
        self.updates.send_replace(current.values().cloned().collect());
        tracing::debug!(peers = current.len(), "presence membership changed");
        Ok(true)
    }
}

pub struct PresenceTracker {
    trip_id: String,
    channel: Arc<dyn PresenceChannel>,
    debounce: Duration,
    buffer: usize,
    outbound: watch::Sender<PresenceRecord>,
    mirror: Arc<Mirror>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PresenceTracker {
    pub fn new(
        trip_id: impl Into<String>,
        own: PresenceRecord,
        channel: Arc<dyn PresenceChannel>,
        debounce: Duration,
        buffer: usize,
    ) -> Self {
        let (updates, _) = watch::channel(Vec::new());
        let mirror = Arc::new(Mirror {
            own_user_id: own.user_id.clone(),
            records: Mutex::new(BTreeMap::new()),
            updates,
        });
        let (outbound, _) = watch::channel(own);
        Self {
            trip_id: trip_id.into(),
            channel,
            debounce,
            buffer,
            outbound,
            mirror,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn own(&self) -> PresenceRecord {
        self.outbound.borrow().clone()
    }

    /// Other users currently known, ordered by user id.
    pub fn peers(&self) -> Vec<PresenceRecord> {
        self.mirror.updates.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PresenceRecord>> {
        self.mirror.updates.subscribe()
    }

    /// Records local navigation. Publishing is debounced by the running tracker.
    pub fn set_attention(&self, current_tab: impl Into<String>, current_day: Option<u32>) {
        let current_tab = current_tab.into();
        self.outbound.send_if_modified(|record| {
            if record.current_tab == current_tab && record.current_day == current_day {
                return false;
            }
            record.current_tab = current_tab;
            record.current_day = current_day;
            record.online_at = Utc::now();
            true
        });
    }

    /// Replaces the mirror only when user-id membership changed.
    /// Returns whether subscribers were notified.
    pub fn receive_remote(&self, records: Vec<PresenceRecord>) -> AppResult<bool> {
        self.mirror.receive(records)
    }

    pub fn is_running(&self) -> bool {
        self.tasks
            .lock()
            .map(|tasks| tasks.iter().any(|task| !task.is_finished()))
            .unwrap_or(false)
    }

    /// Joins the trip's presence channel and starts the publish/receive loops.
    pub fn start(&self) -> AppResult<()> {
        let mut tasks = self.tasks.lock().map_err(|_| AppError::poisoned("presence tasks"))?;
        if tasks.iter().any(|task| !task.is_finished()) {
            return Ok(());
        }
        tasks.clear();

        let mut inbound = self.channel.subscribe(&self.trip_id, self.buffer)?;
        let mirror = self.mirror.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(records) = inbound.recv().await {
                if let Err(error) = mirror.receive(records) {
                    tracing::warn!(error = %error, "failed to apply remote presence");
                }
            }
        }));

        // Subscribed before spawning so edits made right after `start` are seen.
        let mut changes = self.outbound.subscribe();
        let joined = self.outbound.borrow().clone();
        let channel = self.channel.clone();
        let trip_id = self.trip_id.clone();
        let debounce = self.debounce;
        tasks.push(tokio::spawn(async move {
            publish(channel.as_ref(), &trip_id, &joined).await;
            while changes.changed().await.is_ok() {
                // Wait for a quiet window; every change restarts it.
                loop {
                    match timeout(debounce, changes.changed()).await {
                        Ok(Ok(())) => continue,
                        Ok(Err(_)) => return,
                        Err(_) => break,
                    }
                }
                let latest = changes.borrow_and_update().clone();
                publish(channel.as_ref(), &trip_id, &latest).await;
            }
        }));

        tracing::info!(trip_id = %self.trip_id, user_id = %self.mirror.own_user_id, "presence tracking started");
        Ok(())
    }

    pub async fn stop(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            task.abort();
        }
        if let Err(error) = self.channel.leave(&self.trip_id, &self.mirror.own_user_id).await {
            tracing::warn!(error = %error, "failed to leave presence channel");
        }
        tracing::info!(trip_id = %self.trip_id, "presence tracking stopped");
    }
}

async fn publish(channel: &dyn PresenceChannel, trip_id: &str, record: &PresenceRecord) {
    match channel.publish(trip_id, record).await {
        Ok(()) => tracing::debug!(
            user_id = %record.user_id,
            tab = %record.current_tab,
            day = ?record.current_day,
            "presence published"
        ),
        Err(error) => tracing::warn!(error = %error, "presence publish failed"),
    }
}

#[derive(Default)]
struct TripPresence {
    records: BTreeMap<String, PresenceRecord>,
    subscribers: Vec<mpsc::Sender<Vec<PresenceRecord>>>,
}

impl TripPresence {
    /// At-most-once: full or closed subscribers simply miss this snapshot.
    fn broadcast(&mut self) {
        let snapshot = self.records.values().cloned().collect::<Vec<_>>();
        self.subscribers.retain(|subscriber| match subscriber.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// In-process presence channel; every subscriber of a trip receives the full
/// record set after each join, update, or leave.
#[derive(Default)]
pub struct BroadcastPresenceHub {
    trips: Mutex<HashMap<String, TripPresence>>,
}

impl BroadcastPresenceHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn members(&self, trip_id: &str) -> Vec<PresenceRecord> {
        self.trips
            .lock()
            .map(|trips| {
                trips
                    .get(trip_id)
                    .map(|trip| trip.records.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl PresenceChannel for BroadcastPresenceHub {
    async fn publish(&self, trip_id: &str, record: &PresenceRecord) -> AppResult<()> {
        let mut trips = self.trips.lock().map_err(|_| AppError::poisoned("presence hub"))?;
        let trip = trips.entry(trip_id.to_string()).or_default();
        trip.records.insert(record.user_id.clone(), record.clone());
        trip.broadcast();
        Ok(())
    }

    fn subscribe(&self, trip_id: &str, buffer: usize) -> AppResult<mpsc::Receiver<Vec<PresenceRecord>>> {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let mut trips = self.trips.lock().map_err(|_| AppError::poisoned("presence hub"))?;
        let trip = trips.entry(trip_id.to_string()).or_default();
        let _ = sender.try_send(trip.records.values().cloned().collect());
        trip.subscribers.push(sender);
        Ok(receiver)
    }

    async fn leave(&self, trip_id: &str, user_id: &str) -> AppResult<()> {
        let mut trips = self.trips.lock().map_err(|_| AppError::poisoned("presence hub"))?;
        if let Some(trip) = trips.get_mut(trip_id) {
            if trip.records.remove(user_id).is_some() {
                trip.broadcast();
            }
        }
        Ok(())
    }
}
