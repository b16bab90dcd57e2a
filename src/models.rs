use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimePeriod {
    Morning,
    Afternoon,
    Evening,
}

impl TimePeriod {
    pub const ALL: [TimePeriod; 3] = [Self::Morning, Self::Afternoon, Self::Evening];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Morning => "morning",
            Self::Afternoon => "afternoon",
            Self::Evening => "evening",
        }
    }
}

impl fmt::Display for TimePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimePeriod {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "morning" => Ok(Self::Morning),
            "afternoon" => Ok(Self::Afternoon),
            "evening" => Ok(Self::Evening),
            other => Err(AppError::Persistence(format!("unknown time period '{other}'"))),
        }
    }
}

/// A (day, time period) bucket. Ordering is day first, then period rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionKey {
    pub day_number: u32,
    pub time_period: TimePeriod,
}

impl PartitionKey {
    pub fn new(day_number: u32, time_period: TimePeriod) -> Self {
        Self {
            day_number,
            time_period,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "day {}/{}", self.day_number, self.time_period)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: String,
    pub trip_id: String,
    pub day_number: u32,
    pub time_period: TimePeriod,
    pub order_index: u32,
    /// Descriptive payload (title, location, notes...). Never interpreted here.
    #[serde(default)]
    pub details: serde_json::Value,
}

impl Activity {
    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(self.day_number, self.time_period)
    }

    pub fn assign(&mut self, change: &ActivityChange) {
        self.day_number = change.day_number;
        self.time_period = change.time_period;
        self.order_index = change.order_index;
    }
}

/// One row of a reorder plan and of a batch reassignment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityChange {
    pub activity_id: String,
    pub day_number: u32,
    pub time_period: TimePeriod,
    pub order_index: u32,
}

impl ActivityChange {
    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(self.day_number, self.time_period)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedOperation {
    Insert,
    Update,
    Delete,
}

impl FeedOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEvent {
    pub operation: FeedOperation,
    pub activity: Activity,
}

impl RealtimeEvent {
    pub fn insert(activity: Activity) -> Self {
        Self {
            operation: FeedOperation::Insert,
            activity,
        }
    }

    pub fn update(activity: Activity) -> Self {
        Self {
            operation: FeedOperation::Update,
            activity,
        }
    }

    pub fn delete(activity: Activity) -> Self {
        Self {
            operation: FeedOperation::Delete,
            activity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub display_name: String,
    pub current_tab: String,
    pub current_day: Option<u32>,
    pub online_at: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            current_tab: "itinerary".to_string(),
            current_day: None,
            online_at: Utc::now(),
        }
    }
}
