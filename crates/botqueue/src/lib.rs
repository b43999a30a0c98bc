//! Durable priority job queue on PostgreSQL.
//!
//! Items are claimed with `FOR UPDATE SKIP LOCKED`, executed by processors
//! registered per task type, and retried with exponential backoff until they
//! complete or land in the dead-letter state.

pub mod config;
pub mod db;
pub mod error;
pub mod queue;
pub mod telemetry;

pub use error::{QueueError, QueueResult};
