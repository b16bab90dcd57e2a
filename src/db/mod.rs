use crate::errors::{AppError, AppResult};
use crate::models::{Activity, ActivityChange, PartitionKey, RealtimeEvent, TimePeriod};
use crate::persistence::{ActivityPersistence, FeedSubscription, RealtimeFeed};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const ACTIVITY_COLUMNS: &str = "id, trip_id, day_number, time_period, order_index, details_json";

type RawActivity = (String, String, i64, String, i64, String);

#[derive(Debug)]
struct FeedSender {
    trip_id: String,
    sender: mpsc::Sender<RealtimeEvent>,
}

/// SQLite-backed activity storage that also serves the per-trip change feed.
///
/// Batch reassignments run in a single transaction, so they apply all or
/// nothing. Deletes renumber what is left of each touched partition.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    feeds: Mutex<Vec<FeedSender>>,
    db_path: Option<PathBuf>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> AppResult<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, db_path: Option<PathBuf>) -> AppResult<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            feeds: Mutex::new(Vec::new()),
            db_path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn connection(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    /// The "add activity" flow: the new record goes to the end of its partition.
    pub fn insert_activity(
        &self,
        trip_id: &str,
        day_number: u32,
        time_period: TimePeriod,
        details: serde_json::Value,
    ) -> AppResult<Activity> {
        if day_number == 0 {
            return Err(AppError::Persistence("day numbers start at 1".to_string()));
        }

        let activity = {
            let conn = self.connection()?;
            let size: i64 = conn.query_row(
                "SELECT COUNT(*) FROM activities WHERE trip_id = ?1 AND day_number = ?2 AND time_period = ?3",
                params![trip_id, day_number, time_period.as_str()],
                |row| row.get(0),
            )?;
            let activity = Activity {
                id: Uuid::new_v4().to_string(),
                trip_id: trip_id.to_string(),
                day_number,
                time_period,
                order_index: size as u32 + 1,
                details,
            };
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO activities (
                   id, trip_id, day_number, time_period, order_index, details_json, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    activity.id,
                    activity.trip_id,
                    activity.day_number,
                    activity.time_period.as_str(),
                    activity.order_index,
                    serde_json::to_string(&activity.details)?,
                    now,
                    now,
                ],
            )?;
            self.emit(vec![RealtimeEvent::insert(activity.clone())]);
            activity
        };
        Ok(activity)
    }

    pub fn get_activity(&self, activity_id: &str) -> AppResult<Option<Activity>> {
        let conn = self.connection()?;
        load_one(&conn, activity_id)
    }

    pub fn list_trip(&self, trip_id: &str) -> AppResult<Vec<Activity>> {
        let conn = self.connection()?;
        query_activities(
            &conn,
            &format!(
                "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE trip_id = ?1
                 ORDER BY day_number, {}, order_index, id",
                period_rank_sql()
            ),
            params![trip_id],
        )
    }

    fn day_rows(&self, trip_id: &str, day_number: u32) -> AppResult<Vec<Activity>> {
        let conn = self.connection()?;
        query_activities(
            &conn,
            &format!(
                "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE trip_id = ?1 AND day_number = ?2
                 ORDER BY {}, order_index, id",
                period_rank_sql()
            ),
            params![trip_id, day_number],
        )
    }

    /// Events go out while the connection is still held, so subscribers see
    /// commits in commit order.
    fn reassign_rows(&self, changes: &[ActivityChange]) -> AppResult<usize> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut updated = Vec::with_capacity(changes.len());
        for change in changes {
            let count = tx.execute(
                "UPDATE activities SET day_number = ?1, time_period = ?2, order_index = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    change.day_number,
                    change.time_period.as_str(),
                    change.order_index,
                    now,
                    change.activity_id,
                ],
            )?;
            if count == 0 {
                // Dropping the transaction rolls back the earlier rows.
                return Err(AppError::NotFound(format!("activity {}", change.activity_id)));
            }
            if let Some(row) = load_one(&tx, &change.activity_id)? {
                updated.push(row);
            }
        }
        tx.commit()?;
        let count = updated.len();
        self.emit(updated.into_iter().map(RealtimeEvent::update).collect());
        Ok(count)
    }

    fn delete_rows(&self, activity_ids: &[String]) -> AppResult<usize> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let mut deleted = Vec::new();
        for activity_id in activity_ids {
            if let Some(row) = load_one(&tx, activity_id)? {
                tx.execute("DELETE FROM activities WHERE id = ?1", params![activity_id])?;
                deleted.push(row);
            }
        }
        if deleted.is_empty() {
            return Err(AppError::NotFound(format!("activities {}", activity_ids.join(", "))));
        }

        let partitions = deleted
            .iter()
            .map(|row| (row.trip_id.clone(), row.partition()))
            .collect::<BTreeSet<_>>();
        let mut renumbered = Vec::new();
        for (trip_id, key) in partitions {
            renumbered.extend(renumber_partition(&tx, &trip_id, key, &now)?);
        }
        tx.commit()?;

        let count = deleted.len();
        self.emit(
            deleted
                .into_iter()
                .map(RealtimeEvent::delete)
                .chain(renumbered.into_iter().map(RealtimeEvent::update))
                .collect(),
        );
        Ok(count)
    }

    fn emit(&self, events: Vec<RealtimeEvent>) {
        let Ok(mut feeds) = self.feeds.lock() else {
            tracing::error!("feed registry mutex poisoned; realtime events dropped");
            return;
        };
        feeds.retain(|feed| !feed.sender.is_closed());
        for event in events {
            for feed in feeds.iter().filter(|feed| feed.trip_id == event.activity.trip_id) {
                if let Err(mpsc::error::TrySendError::Full(dropped)) = feed.sender.try_send(event.clone()) {
                    tracing::warn!(
                        activity_id = %dropped.activity.id,
                        trip_id = %feed.trip_id,
                        "realtime subscriber lagging; event dropped"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl ActivityPersistence for Database {
    async fn fetch_partition(&self, trip_id: &str, day_number: u32) -> AppResult<Vec<Activity>> {
        self.day_rows(trip_id, day_number)
    }

    async fn batch_reassign(&self, changes: &[ActivityChange]) -> AppResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let rows = self.reassign_rows(changes)?;
        tracing::debug!(rows, "batch reassign committed");
        Ok(())
    }

    async fn delete(&self, activity_id: &str) -> AppResult<()> {
        self.delete_rows(&[activity_id.to_string()])?;
        Ok(())
    }

    async fn bulk_delete(&self, activity_ids: &[String]) -> AppResult<()> {
        if activity_ids.is_empty() {
            return Ok(());
        }
        let deleted = self.delete_rows(activity_ids)?;
        tracing::debug!(requested = activity_ids.len(), deleted, "bulk delete committed");
        Ok(())
    }
}

impl RealtimeFeed for Database {
    fn subscribe(&self, trip_id: &str, buffer: usize) -> AppResult<FeedSubscription> {
        let (sender, events) = mpsc::channel(buffer.max(1));
        let mut feeds = self
            .feeds
            .lock()
            .map_err(|_| AppError::Internal("feed registry mutex poisoned".to_string()))?;
        feeds.push(FeedSender {
            trip_id: trip_id.to_string(),
            sender,
        });
        Ok(FeedSubscription {
            trip_id: trip_id.to_string(),
            events,
        })
    }
}

fn period_rank_sql() -> &'static str {
    "CASE time_period WHEN 'morning' THEN 0 WHEN 'afternoon' THEN 1 ELSE 2 END"
}

fn renumber_partition(
    conn: &Connection,
    trip_id: &str,
    key: PartitionKey,
    now: &str,
) -> AppResult<Vec<Activity>> {
    let members = query_activities(
        conn,
        &format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities
             WHERE trip_id = ?1 AND day_number = ?2 AND time_period = ?3
             ORDER BY order_index, id"
        ),
        params![trip_id, key.day_number, key.time_period.as_str()],
    )?;

    let mut renumbered = Vec::new();
    for (position, mut member) in members.into_iter().enumerate() {
        let order_index = position as u32 + 1;
        if member.order_index == order_index {
            continue;
        }
        conn.execute(
            "UPDATE activities SET order_index = ?1, updated_at = ?2 WHERE id = ?3",
            params![order_index, now, member.id],
        )?;
        member.order_index = order_index;
        renumbered.push(member);
    }
    Ok(renumbered)
}

fn load_one(conn: &Connection, activity_id: &str) -> AppResult<Option<Activity>> {
    let raw = conn
        .query_row(
            &format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE id = ?1"),
            params![activity_id],
            read_raw,
        )
        .optional()?;
    raw.map(activity_from_raw).transpose()
}

fn query_activities(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> AppResult<Vec<Activity>> {
    let mut stmt = conn.prepare(sql)?;
    let raws = stmt
        .query_map(params, read_raw)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(activity_from_raw).collect()
}

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawActivity> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn activity_from_raw(raw: RawActivity) -> AppResult<Activity> {
    let (id, trip_id, day_number, time_period, order_index, details_json) = raw;
    Ok(Activity {
        day_number: u32::try_from(day_number)
            .map_err(|_| AppError::Internal(format!("activity {id} has invalid day {day_number}")))?,
        order_index: u32::try_from(order_index)
            .map_err(|_| AppError::Internal(format!("activity {id} has invalid order index {order_index}")))?,
        time_period: time_period.parse()?,
        details: serde_json::from_str(&details_json)?,
        id,
        trip_id,
    })
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::errors::AppError;
    use crate::models::{ActivityChange, FeedOperation, TimePeriod};
    use crate::persistence::{ActivityPersistence, RealtimeFeed};

    fn add(db: &Database, day: u32, period: TimePeriod, title: &str) -> String {
        db.insert_activity("trip-1", day, period, serde_json::json!({ "title": title }))
            .expect("insert")
            .id
    }

    #[tokio::test]
    async fn inserts_append_and_fetch_orders_by_period() {
        let db = Database::open_in_memory().expect("db");
        add(&db, 1, TimePeriod::Evening, "dinner");
        add(&db, 1, TimePeriod::Morning, "coffee");
        add(&db, 1, TimePeriod::Morning, "walk");
        add(&db, 2, TimePeriod::Morning, "train");

        let day = db.fetch_partition("trip-1", 1).await.expect("fetch");
        let summary = day
            .iter()
            .map(|a| (a.details["title"].as_str().unwrap_or_default().to_string(), a.order_index))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                ("coffee".to_string(), 1),
                ("walk".to_string(), 2),
                ("dinner".to_string(), 1)
            ]
        );
    }

    #[tokio::test]
    async fn batch_reassign_is_all_or_nothing() {
        let db = Database::open_in_memory().expect("db");
        let a = add(&db, 1, TimePeriod::Morning, "a");
        let err = db
            .batch_reassign(&[
                ActivityChange {
                    activity_id: a.clone(),
                    day_number: 2,
                    time_period: TimePeriod::Morning,
                    order_index: 1,
                },
                ActivityChange {
                    activity_id: "ghost".to_string(),
                    day_number: 2,
                    time_period: TimePeriod::Morning,
                    order_index: 2,
                },
            ])
            .await
            .expect_err("unknown id");
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(db.get_activity(&a).expect("get").map(|row| row.day_number), Some(1));
    }

    #[tokio::test]
    async fn delete_renumbers_and_notifies_subscribers() {
        let db = Database::open_in_memory().expect("db");
        let first = add(&db, 1, TimePeriod::Afternoon, "first");
        let second = add(&db, 1, TimePeriod::Afternoon, "second");
        let third = add(&db, 1, TimePeriod::Afternoon, "third");
        let mut feed = db.subscribe("trip-1", 16).expect("subscribe");
        let mut other_trip = db.subscribe("trip-2", 16).expect("subscribe");

        db.delete(&first).await.expect("delete");

        let deleted = feed.events.recv().await.expect("delete event");
        assert_eq!(deleted.operation, FeedOperation::Delete);
        assert_eq!(deleted.activity.id, first);
        let mut renumbered = Vec::new();
        while let Ok(event) = feed.events.try_recv() {
            assert_eq!(event.operation, FeedOperation::Update);
            renumbered.push((event.activity.id, event.activity.order_index));
        }
        assert_eq!(renumbered, vec![(second.clone(), 1), (third.clone(), 2)]);
        assert!(other_trip.events.try_recv().is_err());

        let err = db.delete(&first).await.expect_err("already gone");
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn bulk_delete_renumbers_every_touched_partition() {
        let db = Database::open_in_memory().expect("db");
        let a = add(&db, 1, TimePeriod::Morning, "a");
        let b = add(&db, 1, TimePeriod::Morning, "b");
        let c = add(&db, 2, TimePeriod::Evening, "c");
        let d = add(&db, 2, TimePeriod::Evening, "d");

        db.bulk_delete(&[a, c, "ghost".to_string()]).await.expect("bulk delete");
        assert_eq!(db.get_activity(&b).expect("get").map(|row| row.order_index), Some(1));
        assert_eq!(db.get_activity(&d).expect("get").map(|row| row.order_index), Some(1));
        assert_eq!(db.list_trip("trip-1").expect("list").len(), 2);
    }

    #[tokio::test]
    async fn file_backed_database_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("itinerary.sqlite");
        let id = {
            let db = Database::new(&path).expect("create");
            assert_eq!(db.path(), Some(path.as_path()));
            add(&db, 3, TimePeriod::Evening, "concert")
        };
        let reopened = Database::new(&path).expect("reopen");
        let row = reopened.get_activity(&id).expect("get").expect("row");
        assert_eq!((row.day_number, row.time_period, row.order_index), (3, TimePeriod::Evening, 1));
    }
}
