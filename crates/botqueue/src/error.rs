use uuid::Uuid;

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Failures surfaced by the queue core.
///
/// Processor failures are not errors: handlers report them through
/// [`crate::queue::processor::Outcome`].
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Malformed enqueue request, rejected before anything is persisted.
    #[error("validation error: {0}")]
    Validation(String),

    /// No processor is registered for the item's task type.
    #[error("no processor registered for task_type={0}")]
    UnknownTaskType(String),

    /// The item is not in the state the caller expected.
    #[error("state error for item {id}: expected {expected}, found {found}")]
    State {
        id: Uuid,
        expected: String,
        found: String,
    },

    #[error("item {0} not found")]
    NotFound(Uuid),

    /// The store could not be reached. Callers back off and retry the call.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl QueueError {
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, QueueError::StorageUnavailable(_))
    }

    pub fn is_state(&self) -> bool {
        matches!(self, QueueError::State { .. })
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => QueueError::StorageUnavailable(err.to_string()),
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                QueueError::Validation(format!("reference to unknown item: {}", db.message()))
            }
            sqlx::Error::Database(db) if db.is_check_violation() => {
                QueueError::Validation(db.message().to_string())
            }
            _ => QueueError::Database(err),
        }
    }
}
