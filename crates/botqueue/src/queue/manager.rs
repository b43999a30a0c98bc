use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::queue::attempts::AttemptsRepo;
use crate::queue::model::QueueItem;
use crate::queue::processor::{Outcome, ProcessorRegistry, TaskContext};
use crate::queue::retry::{Decision, RetryPolicy};
use crate::queue::store::ItemStore;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub worker_id: String,
    /// Number of concurrent poll loops in this process.
    pub concurrency: usize,
    /// Sleep between polls when nothing is due.
    pub poll_interval: Duration,
    pub reap_interval: Duration,
    /// IN_PROGRESS for longer than this means the claimant is presumed dead.
    pub stale_timeout: Duration,
    /// Backoff for storage outages, separate from task retries.
    pub storage_backoff: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            concurrency: 4,
            poll_interval: Duration::from_millis(250),
            reap_interval: Duration::from_secs(15),
            stale_timeout: Duration::from_secs(300),
            storage_backoff: RetryPolicy::fixed(Duration::from_millis(500), Duration::from_secs(30)),
        }
    }
}

/// The store transition an execution result maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Complete,
    Requeue { delay: Duration, reason: String },
    DeadLetter { reason: String },
}

/// Map a processor outcome to a transition. Fatal failures skip the retry policy.
pub fn settle(
    outcome: &Outcome,
    attempt_count: i32,
    max_attempts: i32,
    policy: &RetryPolicy,
) -> Settlement {
    match outcome {
        Outcome::Success => Settlement::Complete,
        Outcome::Fatal(reason) => Settlement::DeadLetter {
            reason: reason.clone(),
        },
        Outcome::Recoverable(reason) => match policy.decide(attempt_count, max_attempts) {
            Decision::Requeue(delay) => Settlement::Requeue {
                delay,
                reason: reason.clone(),
            },
            Decision::DeadLetter => Settlement::DeadLetter {
                reason: reason.clone(),
            },
        },
    }
}

/// Result of one claimed item, as seen by the poll loop.
#[derive(Debug, Clone)]
pub struct Processed {
    pub item_id: Uuid,
    pub task_type: String,
    pub settlement: Settlement,
    /// False when the store refused the transition (the reaper got there first).
    pub applied: bool,
}

#[derive(Clone)]
pub struct QueueManager {
    store: ItemStore,
    attempts: AttemptsRepo,
    registry: Arc<ProcessorRegistry>,
    policy: RetryPolicy,
    cfg: ManagerConfig,
}

impl QueueManager {
    pub fn new(
        store: ItemStore,
        attempts: AttemptsRepo,
        registry: Arc<ProcessorRegistry>,
        policy: RetryPolicy,
        cfg: ManagerConfig,
    ) -> Self {
        Self {
            store,
            attempts,
            registry,
            policy,
            cfg,
        }
    }

    pub fn store(&self) -> &ItemStore {
        &self.store
    }

    /// Claim one due item as `worker_id`, run it and write the result back.
    /// `Ok(None)` when nothing was due.
    pub async fn process_one(&self, worker_id: &str) -> QueueResult<Option<Processed>> {
        self.process(worker_id, None).await
    }

    async fn process(
        &self,
        worker_id: &str,
        mut shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> QueueResult<Option<Processed>> {
        let Some((item, attempt)) = self.store.claim_with_attempt(worker_id).await? else {
            return Ok(None);
        };

        let claimed_at = Instant::now();
        let result = self.execute(&item, worker_id).await;
        let latency_ms = i32::try_from(claimed_at.elapsed().as_millis()).unwrap_or(i32::MAX);

        let settlement = match result {
            Ok(outcome) => settle(&outcome, item.attempt_count, item.max_attempts, &self.policy),
            // retrying cannot make a processor appear
            Err(e @ QueueError::UnknownTaskType(_)) => Settlement::DeadLetter {
                reason: e.to_string(),
            },
            Err(e) => settle(
                &Outcome::recoverable(e.to_string()),
                item.attempt_count,
                item.max_attempts,
                &self.policy,
            ),
        };

        let applied = self
            .apply_durably(&item, worker_id, &settlement, claimed_at, shutdown.as_deref_mut())
            .await?;

        // audit only; the item's state is already settled
        let audit = match &settlement {
            Settlement::Complete => self.attempts.finish_succeeded(attempt.id, latency_ms).await,
            Settlement::Requeue { reason, .. } | Settlement::DeadLetter { reason } => {
                self.attempts
                    .finish_failed(attempt.id, latency_ms, reason)
                    .await
            }
        };
        if let Err(e) = audit {
            warn!(item_id = %item.id, attempt_id = %attempt.id, error = %e, "could not close attempt row");
        }

        Ok(Some(Processed {
            item_id: item.id,
            task_type: item.task_type,
            settlement,
            applied,
        }))
    }

    async fn execute(&self, item: &QueueItem, worker_id: &str) -> QueueResult<Outcome> {
        let registry = self.registry.clone();
        let payload = item.payload.clone();
        let ctx = TaskContext::new(item, worker_id, self.store.clone());

        // own task so a panicking processor can't take the poll loop down
        let handle = tokio::spawn(async move { registry.dispatch(&payload, &ctx).await });
        match handle.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => Ok(Outcome::recoverable("processor panicked")),
            Err(join_err) => Ok(Outcome::recoverable(format!(
                "processor task aborted: {join_err}"
            ))),
        }
    }

    /// Write `settlement`, retrying the write itself while storage is
    /// unavailable. Gives up on shutdown, or once the item has been held for
    /// `stale_timeout`; past that point the reaper owns it.
    async fn apply_durably(
        &self,
        item: &QueueItem,
        worker_id: &str,
        settlement: &Settlement,
        claimed_at: Instant,
        mut shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> QueueResult<bool> {
        let mut failures: u32 = 0;
        loop {
            let err = match self.apply(item, worker_id, settlement).await {
                Err(e) if e.is_storage_unavailable() => e,
                other => return other,
            };

            failures = failures.saturating_add(1);
            let delay = self.cfg.storage_backoff.backoff_delay(failures);
            if claimed_at.elapsed() + delay >= self.cfg.stale_timeout {
                error!(
                    item_id = %item.id,
                    worker_id,
                    failures,
                    error = %err,
                    "could not record result before the stale timeout; leaving item to the reaper"
                );
                return Err(err);
            }

            warn!(
                item_id = %item.id,
                worker_id,
                failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "storage unavailable while recording result; retrying"
            );

            let stop = match shutdown.as_deref_mut() {
                Some(rx) => pause(delay, rx).await,
                None => {
                    tokio::time::sleep(delay).await;
                    false
                }
            };
            if stop {
                warn!(item_id = %item.id, worker_id, "shutdown while recording result");
                return Err(err);
            }
        }
    }

    async fn apply(
        &self,
        item: &QueueItem,
        worker_id: &str,
        settlement: &Settlement,
    ) -> QueueResult<bool> {
        let res = match settlement {
            Settlement::Complete => self.store.complete(item.id, worker_id).await.map(|_| ()),
            Settlement::Requeue { delay, reason } => self
                .store
                .requeue(item.id, worker_id, *delay, reason)
                .await
                .map(|_| ()),
            Settlement::DeadLetter { reason } => self
                .store
                .dead_letter(item.id, Some(worker_id), reason)
                .await
                .map(|_| ()),
        };

        match res {
            Ok(()) => {
                match settlement {
                    Settlement::Complete => debug!(
                        item_id = %item.id,
                        task_type = %item.task_type,
                        worker_id,
                        "completed"
                    ),
                    Settlement::Requeue { delay, reason } => warn!(
                        item_id = %item.id,
                        task_type = %item.task_type,
                        worker_id,
                        attempt = item.current_attempt(),
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "requeued for retry"
                    ),
                    Settlement::DeadLetter { reason } => error!(
                        item_id = %item.id,
                        task_type = %item.task_type,
                        worker_id,
                        attempt = item.current_attempt(),
                        %reason,
                        "dead-lettered"
                    ),
                }
                Ok(true)
            }
            Err(e) if e.is_state() => {
                // lost the item to the reaper; its decision stands
                warn!(item_id = %item.id, worker_id, error = %e, "transition refused; ignoring");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Run the poll loops and the reaper until `shutdown` flips to true.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> QueueResult<()> {
        let mut set = JoinSet::new();

        for slot in 0..self.cfg.concurrency.max(1) {
            let manager = self.clone();
            let slot_worker = format!("{}/{}", self.cfg.worker_id, slot);
            let shutdown = shutdown.clone();
            set.spawn(async move { manager.poll_loop(slot_worker, shutdown).await });
        }

        {
            let manager = self.clone();
            let shutdown = shutdown.clone();
            set.spawn(async move { manager.reap_loop(shutdown).await });
        }

        info!(
            worker_id = %self.cfg.worker_id,
            concurrency = self.cfg.concurrency.max(1),
            processors = ?self.registry.task_types(),
            "queue manager started"
        );

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "queue manager task failed");
            }
        }

        info!(worker_id = %self.cfg.worker_id, "queue manager stopped");
        Ok(())
    }

    async fn poll_loop(self, worker_id: String, mut shutdown: watch::Receiver<bool>) {
        let mut storage_failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause_for = match self.process(&worker_id, Some(&mut shutdown)).await {
                Ok(Some(_)) => {
                    storage_failures = 0;
                    None
                }
                Ok(None) => {
                    storage_failures = 0;
                    Some(self.cfg.poll_interval)
                }
                Err(e) if e.is_storage_unavailable() => {
                    storage_failures = storage_failures.saturating_add(1);
                    let delay = self.cfg.storage_backoff.backoff_delay(storage_failures);
                    warn!(
                        worker_id = %worker_id,
                        failures = storage_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "storage unavailable; backing off"
                    );
                    Some(delay)
                }
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "poll iteration failed");
                    Some(self.cfg.poll_interval)
                }
            };

            if let Some(delay) = pause_for {
                if pause(delay, &mut shutdown).await {
                    break;
                }
            }
        }

        debug!(worker_id = %worker_id, "poll loop stopped");
    }

    async fn reap_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut storage_failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self
                .store
                .reap_stale(self.cfg.stale_timeout, &self.policy)
                .await
            {
                Ok(reaped) => {
                    storage_failures = 0;
                    for r in &reaped {
                        warn!(
                            item_id = %r.item.id,
                            task_type = %r.item.task_type,
                            stale_worker = r.stale_worker.as_deref().unwrap_or("-"),
                            status = %r.item.status,
                            "reclaimed item from stale worker"
                        );
                    }
                    self.cfg.reap_interval
                }
                Err(e) => {
                    storage_failures = storage_failures.saturating_add(1);
                    warn!(error = %e, failures = storage_failures, "reap sweep failed");
                    if e.is_storage_unavailable() {
                        self.cfg.storage_backoff.backoff_delay(storage_failures)
                    } else {
                        self.cfg.reap_interval
                    }
                }
            };

            if pause(delay, &mut shutdown).await {
                break;
            }
        }
    }
}

/// Sleep for `delay` unless shutdown is signalled first. Returns true to stop.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sender_gone = tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err(),
    };
    sender_gone || *shutdown.borrow()
}
