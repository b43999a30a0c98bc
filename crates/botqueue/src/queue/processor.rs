use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio::{sync::Semaphore, time::timeout};
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::queue::model::{NewItem, Priority, QueueItem};
use crate::queue::store::ItemStore;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type ProcessorFn =
    dyn for<'a> Fn(&'a Value, &'a TaskContext) -> BoxFuture<'a, Outcome> + Send + Sync;

/// What a processor reports back for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Transient failure; retried per the backoff policy.
    Recoverable(String),
    /// The task can never succeed; dead-lettered without retry.
    Fatal(String),
}

impl Outcome {
    pub fn recoverable(reason: impl Into<String>) -> Self {
        Outcome::Recoverable(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Outcome::Fatal(reason.into())
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Recoverable(reason) => write!(f, "recoverable failure: {reason}"),
            Outcome::Fatal(reason) => write!(f, "fatal failure: {reason}"),
        }
    }
}

/// Everything a processor may know about the item besides its payload.
#[derive(Clone)]
pub struct TaskContext {
    pub item_id: Uuid,
    pub task_type: String,
    pub priority: Priority,
    pub user_id: Option<String>,
    pub channel_id: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub attempt: i32,
    pub max_attempts: i32,
    pub worker_id: String,
    store: ItemStore,
}

impl TaskContext {
    pub fn new(item: &QueueItem, worker_id: &str, store: ItemStore) -> Self {
        Self {
            item_id: item.id,
            task_type: item.task_type.clone(),
            priority: item.priority,
            user_id: item.user_id.clone(),
            channel_id: item.channel_id.clone(),
            correlation_id: item.correlation_id,
            attempt: item.current_attempt(),
            max_attempts: item.max_attempts,
            worker_id: worker_id.to_string(),
            store,
        }
    }

    /// Enqueue a follow-up item owned by the current one. It inherits routing
    /// and the workflow's correlation id.
    pub async fn spawn_child(
        &self,
        task_type: &str,
        priority: Priority,
        payload: Value,
    ) -> QueueResult<Uuid> {
        let mut child = NewItem::new(task_type, priority, payload).parent(self.item_id);
        child.user_id = self.user_id.clone();
        child.channel_id = self.channel_id.clone();
        child.correlation_id = self.correlation_id;
        self.store.enqueue(child).await
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[derive(Clone)]
pub struct ProcessorEntry {
    pub processor: Arc<ProcessorFn>,
    pub semaphore: Option<Arc<Semaphore>>,
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
pub struct ProcessorOptions {
    max_concurrency: Option<usize>,
    timeout: Option<Duration>,
}

impl ProcessorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }
}

/// Binds task types to processors. Built once at startup and handed to the manager.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, ProcessorEntry>,
    default_timeout: Option<Duration>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Budget for processors registered without their own timeout.
    pub fn with_default_timeout(mut self, dur: Duration) -> Self {
        self.default_timeout = Some(dur);
        self
    }

    pub fn register<F>(&mut self, task_type: &str, processor: F)
    where
        F: for<'a> Fn(&'a Value, &'a TaskContext) -> BoxFuture<'a, Outcome>
            + Send
            + Sync
            + 'static,
    {
        self.register_with_options(task_type, processor, ProcessorOptions::new());
    }

    pub fn register_with_options<F>(&mut self, task_type: &str, processor: F, opts: ProcessorOptions)
    where
        F: for<'a> Fn(&'a Value, &'a TaskContext) -> BoxFuture<'a, Outcome>
            + Send
            + Sync
            + 'static,
    {
        let semaphore = opts
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        self.processors.insert(
            task_type.to_string(),
            ProcessorEntry {
                processor: Arc::new(processor),
                semaphore,
                timeout: opts.timeout,
            },
        );
    }

    pub fn processor_for(&self, task_type: &str) -> Option<&ProcessorEntry> {
        self.processors.get(task_type)
    }

    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.processors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Run the processor registered for `ctx.task_type`.
    pub async fn dispatch(&self, payload: &Value, ctx: &TaskContext) -> QueueResult<Outcome> {
        let entry = self
            .processor_for(&ctx.task_type)
            .ok_or_else(|| QueueError::UnknownTaskType(ctx.task_type.clone()))?;
        Ok(entry.run(payload, ctx, self.default_timeout).await)
    }
}

impl ProcessorEntry {
    pub async fn run(
        &self,
        payload: &Value,
        ctx: &TaskContext,
        default_timeout: Option<Duration>,
    ) -> Outcome {
        let _permit = match &self.semaphore {
            Some(sem) => match sem.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return Outcome::recoverable("processor semaphore closed"),
            },
            None => None,
        };

        let fut = (self.processor)(payload, ctx);
        match self.timeout.or(default_timeout) {
            Some(dur) => match timeout(dur, fut).await {
                Ok(outcome) => outcome,
                Err(_) => Outcome::recoverable(format!(
                    "processor timeout after {}ms",
                    dur.as_millis()
                )),
            },
            None => fut.await,
        }
    }
}

/// Decode a payload into the processor's own schema. A mismatch can never
/// succeed on retry, so it is reported as `Fatal`.
pub fn parse_payload<T: DeserializeOwned>(payload: &Value) -> Result<T, Outcome> {
    serde_json::from_value(payload.clone())
        .map_err(|e| Outcome::fatal(format!("bad payload: {e}")))
}

pub fn boxed<'a, T>(fut: impl Future<Output = T> + Send + 'a) -> BoxFuture<'a, T> {
    Box::pin(fut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;
    use sqlx::postgres::PgPoolOptions;

    use crate::queue::model::ItemStatus;

    fn item(task_type: &str) -> QueueItem {
        let now = Utc::now();
        QueueItem {
            id: Uuid::new_v4(),
            seq: 1,
            priority: Priority::NORMAL,
            status: ItemStatus::InProgress,
            task_type: task_type.to_string(),
            user_id: Some("u-1".into()),
            channel_id: Some("c-1".into()),
            payload: json!({"text": "hello"}),
            attempt_count: 0,
            max_attempts: 3,
            last_error: None,
            worker_id: Some("w-1".into()),
            created_at: now,
            scheduled_for: now,
            started_at: Some(now),
            completed_at: None,
            updated_at: now,
            correlation_id: None,
            parent_id: None,
            replay_of: None,
        }
    }

    // never connects; processors in these tests don't touch the store
    fn ctx_for(item: &QueueItem) -> TaskContext {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://botqueue@localhost/botqueue_unused")
            .unwrap();
        TaskContext::new(item, "w-1", ItemStore::new(pool))
    }

    #[derive(Deserialize)]
    struct ChatPayload {
        text: String,
    }

    fn registry() -> ProcessorRegistry {
        let mut registry = ProcessorRegistry::new();
        registry.register("chat_message", |payload, _ctx| {
            boxed(async move {
                match parse_payload::<ChatPayload>(payload) {
                    Ok(p) if p.text.is_empty() => Outcome::fatal("empty message"),
                    Ok(_) => Outcome::Success,
                    Err(outcome) => outcome,
                }
            })
        });
        registry.register_with_options(
            "slow",
            |_payload, _ctx| {
                boxed(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Outcome::Success
                })
            },
            ProcessorOptions::new().timeout(Duration::from_millis(20)),
        );
        registry.register("flaky", |_payload, ctx| {
            boxed(async move {
                if ctx.is_last_attempt() {
                    Outcome::Success
                } else {
                    Outcome::recoverable("upstream 503")
                }
            })
        });
        registry
    }

    #[tokio::test]
    async fn dispatches_by_task_type() {
        let registry = registry();
        let item = item("chat_message");
        let ctx = ctx_for(&item);
        let outcome = registry.dispatch(&item.payload, &ctx).await.unwrap();
        assert_eq!(outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn schema_mismatch_is_fatal() {
        let registry = registry();
        let item = item("chat_message");
        let ctx = ctx_for(&item);
        let outcome = registry.dispatch(&json!({"txt": 1}), &ctx).await.unwrap();
        assert!(matches!(outcome, Outcome::Fatal(_)), "{outcome:?}");
    }

    #[tokio::test]
    async fn unknown_task_type_is_an_error() {
        let registry = registry();
        let item = item("email_digest");
        let ctx = ctx_for(&item);
        let err = registry.dispatch(&item.payload, &ctx).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownTaskType(t) if t == "email_digest"));
    }

    #[tokio::test]
    async fn timeout_is_recoverable() {
        let registry = registry();
        let item = item("slow");
        let ctx = ctx_for(&item);
        let outcome = registry.dispatch(&item.payload, &ctx).await.unwrap();
        assert!(matches!(outcome, Outcome::Recoverable(ref r) if r.contains("timeout")));
    }

    #[tokio::test]
    async fn default_timeout_applies_to_processors_without_one() {
        let mut registry = ProcessorRegistry::new().with_default_timeout(Duration::from_millis(20));
        registry.register("hang", |_payload, _ctx| {
            boxed(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Outcome::Success
            })
        });
        let item = item("hang");
        let ctx = ctx_for(&item);
        let outcome = registry.dispatch(&item.payload, &ctx).await.unwrap();
        assert!(matches!(outcome, Outcome::Recoverable(_)));
    }

    #[tokio::test]
    async fn context_exposes_attempt_number() {
        let registry = registry();
        let mut last = item("flaky");
        last.attempt_count = 2;
        let ctx = ctx_for(&last);
        assert_eq!(ctx.attempt, 3);
        let outcome = registry.dispatch(&last.payload, &ctx).await.unwrap();
        assert_eq!(outcome, Outcome::Success);

        let first = item("flaky");
        let ctx = ctx_for(&first);
        let outcome = registry.dispatch(&first.payload, &ctx).await.unwrap();
        assert!(matches!(outcome, Outcome::Recoverable(_)));
    }

    #[test]
    fn task_types_are_sorted() {
        assert_eq!(registry().task_types(), vec!["chat_message", "flaky", "slow"]);
    }
}
