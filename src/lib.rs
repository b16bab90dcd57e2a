pub mod config;
pub mod db;
pub mod drag;
pub mod engine;
pub mod errors;
pub mod gateway;
pub mod models;
pub mod persistence;
pub mod planner;
pub mod presence;
pub mod reconciler;
pub mod session;
pub mod store;

pub use crate::config::EngineConfig;
pub use crate::db::Database;
pub use crate::drag::{DragController, DragEvent, DragState, DropTarget, KeyboardCommand};
pub use crate::engine::{EngineBackends, ItineraryEngine};
pub use crate::errors::{AppError, AppResult};
pub use crate::gateway::{FailureNotifier, MoveOutcome, MutationGateway};
pub use crate::models::{
    Activity, ActivityChange, FeedOperation, PartitionKey, PresenceRecord, RealtimeEvent, TimePeriod,
};
pub use crate::persistence::{ActivityPersistence, FeedSubscription, PresenceChannel, RealtimeFeed};
pub use crate::planner::{MoveIntent, ReorderPlan};
pub use crate::presence::{BroadcastPresenceHub, PresenceTracker};
pub use crate::reconciler::{RealtimeReconciler, ReconcileOutcome, SkipReason};
pub use crate::store::{ActivityStore, StoreChange};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs a JSON subscriber writing to a daily-rotated file under
/// `log_dir`. `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing(log_dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "itinerary-sync.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(format!("tracing already initialised: {error}")))
}
