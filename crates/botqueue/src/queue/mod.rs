pub mod attempts;
pub mod manager;
pub mod model;
pub mod processor;
pub mod retry;
pub mod store;
pub mod workflow;

pub use attempts::{AttemptsRepo, ItemAttempt};
pub use manager::{ManagerConfig, QueueManager, Settlement};
pub use model::{ItemStatus, NewItem, Priority, QueueItem};
pub use processor::{Outcome, ProcessorOptions, ProcessorRegistry, TaskContext};
pub use retry::{Decision, RetryPolicy};
pub use store::{ItemFilter, ItemStore, ReapedItem};
