use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::QueueError;

/// Claim priority. Higher values are claimed first.
///
/// The named levels are the ones the bot uses; any other value is accepted so
/// the surrounding application can slot in its own levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(i32);

impl Priority {
    pub const INTERACTIVE: Priority = Priority(30);
    pub const NORMAL: Priority = Priority(20);
    pub const BACKGROUND: Priority = Priority(10);
    pub const BATCH: Priority = Priority(0);

    pub const fn new(value: i32) -> Self {
        Priority(value)
    }

    pub const fn value(self) -> i32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Priority(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Priority::INTERACTIVE => f.write_str("interactive"),
            Priority::NORMAL => f.write_str("normal"),
            Priority::BACKGROUND => f.write_str("background"),
            Priority::BATCH => f.write_str("batch"),
            Priority(other) => write!(f, "{other}"),
        }
    }
}

impl FromStr for Priority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "interactive" => Ok(Priority::INTERACTIVE),
            "normal" => Ok(Priority::NORMAL),
            "background" => Ok(Priority::BACKGROUND),
            "batch" => Ok(Priority::BATCH),
            other => other
                .parse::<i32>()
                .map(Priority)
                .map_err(|_| QueueError::Validation(format!("unknown priority: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    DeadLetter,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Queued => "queued",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::DeadLetter => "dead_letter",
        }
    }

    /// Completed and dead-lettered items never leave their state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::DeadLetter)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "queued" => Ok(ItemStatus::Queued),
            "in_progress" => Ok(ItemStatus::InProgress),
            "completed" => Ok(ItemStatus::Completed),
            "failed" => Ok(ItemStatus::Failed),
            "dead_letter" | "dlq" => Ok(ItemStatus::DeadLetter),
            _ => Err(QueueError::Validation(format!("unknown status: {s}"))),
        }
    }
}

impl TryFrom<String> for ItemStatus {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct QueueItem {
    pub id: Uuid,
    pub seq: i64,

    #[sqlx(try_from = "i32")]
    pub priority: Priority,
    #[sqlx(try_from = "String")]
    pub status: ItemStatus,
    pub task_type: String,

    pub user_id: Option<String>,
    pub channel_id: Option<String>,
    pub payload: Value,

    pub attempt_count: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub worker_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    pub correlation_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub replay_of: Option<Uuid>,
}

impl QueueItem {
    /// Attempt number of the execution currently holding the claim (1-based).
    pub fn current_attempt(&self) -> i32 {
        self.attempt_count + 1
    }
}

pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// A producer's enqueue request.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub task_type: String,
    pub priority: Priority,
    pub payload: Value,
    pub user_id: Option<String>,
    pub channel_id: Option<String>,
    pub max_attempts: i32,
    pub correlation_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl NewItem {
    pub fn new(task_type: impl Into<String>, priority: Priority, payload: Value) -> Self {
        Self {
            task_type: task_type.into(),
            priority,
            payload,
            user_id: None,
            channel_id: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            correlation_id: None,
            parent_id: None,
            scheduled_for: None,
        }
    }

    pub fn route(mut self, user_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Checks that don't need the database. Parent existence is checked at insert.
    pub fn validate(&self, max_payload_bytes: usize) -> Result<(), QueueError> {
        if self.task_type.trim().is_empty() {
            return Err(QueueError::Validation("task_type is required".into()));
        }
        if self.max_attempts < 1 {
            return Err(QueueError::Validation(format!(
                "max_attempts must be >= 1, got {}",
                self.max_attempts
            )));
        }
        if self.payload.is_null() {
            return Err(QueueError::Validation("payload is required".into()));
        }
        let payload_bytes = serde_json::to_vec(&self.payload)
            .map_err(|e| QueueError::Validation(format!("payload is not serializable: {e}")))?
            .len();
        if payload_bytes > max_payload_bytes {
            return Err(QueueError::Validation(format!(
                "payload is {payload_bytes} bytes, limit is {max_payload_bytes}"
            )));
        }
        Ok(())
    }
}
