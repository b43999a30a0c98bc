//! Read-only views that stitch items, their attempts and their children together.

use serde::Serialize;
use uuid::Uuid;

use crate::error::QueueResult;
use crate::queue::attempts::{AttemptsRepo, ItemAttempt};
use crate::queue::model::{ItemStatus, QueueItem};
use crate::queue::store::ItemStore;

#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub item: QueueItem,
    pub attempts: Vec<ItemAttempt>,
    pub children: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowTrace {
    pub correlation_id: Uuid,
    pub items: Vec<QueueItem>,
    pub summary: WorkflowSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkflowSummary {
    pub total: usize,
    pub queued: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub dead_letter: usize,
    pub failed: usize,
}

impl WorkflowSummary {
    pub fn from_items(items: &[QueueItem]) -> Self {
        let mut s = WorkflowSummary {
            total: items.len(),
            ..WorkflowSummary::default()
        };
        for item in items {
            match item.status {
                ItemStatus::Queued => s.queued += 1,
                ItemStatus::InProgress => s.in_progress += 1,
                ItemStatus::Completed => s.completed += 1,
                ItemStatus::DeadLetter => s.dead_letter += 1,
                ItemStatus::Failed => s.failed += 1,
            }
        }
        s
    }

    /// Every item reached a terminal state.
    pub fn is_settled(&self) -> bool {
        self.completed + self.dead_letter == self.total
    }
}

pub async fn explain(
    store: &ItemStore,
    attempts: &AttemptsRepo,
    id: Uuid,
) -> QueueResult<Option<ItemReport>> {
    let Some(item) = store.get(id).await? else {
        return Ok(None);
    };
    let attempts = attempts.list_for_item(id).await?;
    let children = store
        .children_of(id)
        .await?
        .into_iter()
        .map(|c| c.id)
        .collect();

    Ok(Some(ItemReport {
        item,
        attempts,
        children,
    }))
}

pub async fn trace(store: &ItemStore, correlation_id: Uuid) -> QueueResult<WorkflowTrace> {
    let items = store.by_correlation(correlation_id).await?;
    let summary = WorkflowSummary::from_items(&items);
    Ok(WorkflowTrace {
        correlation_id,
        items,
        summary,
    })
}
