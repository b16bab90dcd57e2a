use crate::errors::AppResult;
use crate::models::{Activity, ActivityChange, PresenceRecord, RealtimeEvent};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Durable activity storage owned by the backend.
#[async_trait]
pub trait ActivityPersistence: Send + Sync {
    /// Authoritative activities of one day, ordered by period rank then index.
    async fn fetch_partition(&self, trip_id: &str, day_number: u32) -> AppResult<Vec<Activity>>;

    /// Applies every assignment. Callers correct local state on any error,
    /// so backends that cannot apply all-or-nothing are still safe to use.
    async fn batch_reassign(&self, changes: &[ActivityChange]) -> AppResult<()>;

    async fn delete(&self, activity_id: &str) -> AppResult<()>;

    async fn bulk_delete(&self, activity_ids: &[String]) -> AppResult<()>;
}

/// Receiving half of a per-trip change feed. Dropping it unsubscribes.
#[derive(Debug)]
pub struct FeedSubscription {
    pub trip_id: String,
    pub events: mpsc::Receiver<RealtimeEvent>,
}

pub trait RealtimeFeed: Send + Sync {
    fn subscribe(&self, trip_id: &str, buffer: usize) -> AppResult<FeedSubscription>;
}

/// Per-trip, at-most-once presence broadcast.
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    async fn publish(&self, trip_id: &str, record: &PresenceRecord) -> AppResult<()>;

    /// Each message is the full set of records currently known to the channel.
    fn subscribe(&self, trip_id: &str, buffer: usize) -> AppResult<mpsc::Receiver<Vec<PresenceRecord>>>;

    async fn leave(&self, trip_id: &str, user_id: &str) -> AppResult<()>;
}
