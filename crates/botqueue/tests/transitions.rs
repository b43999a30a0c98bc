mod common;

use common::{enqueue, setup_db};

use botqueue::queue::{ItemStatus, ItemStore, NewItem, Priority};
use botqueue::QueueError;
use serde_json::{json, Value};
use serial_test::serial;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
#[serial]
async fn enqueue_claim_complete_round_trip() {
    let Some(pool) = setup_db().await else { return };
    let store = ItemStore::new(pool.clone());

    let id = store
        .enqueue(
            NewItem::new("chat_message", Priority::INTERACTIVE, json!({"text": "hi"}))
                .route("user-1", "dm-1")
                .max_attempts(3),
        )
        .await
        .unwrap();

    let queued = store.get(id).await.unwrap().unwrap();
    assert_eq!(queued.status, ItemStatus::Queued);
    assert_eq!(queued.attempt_count, 0);
    assert_eq!(queued.worker_id, None);
    assert!(queued.scheduled_for >= queued.created_at);

    let claimed = store.claim_next("worker-a").await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.status, ItemStatus::InProgress);

    let done = store.complete(id, "worker-a").await.unwrap();
    assert_eq!(done.status, ItemStatus::Completed);
    assert!(done.completed_at.is_some());
    assert_eq!(done.worker_id.as_deref(), Some("worker-a"));
    assert_eq!(done.user_id.as_deref(), Some("user-1"));
    assert_eq!(done.channel_id.as_deref(), Some("dm-1"));
    assert_eq!(done.payload, json!({"text": "hi"}));
}

#[tokio::test]
#[serial]
async fn enqueue_rejects_invalid_requests() {
    let Some(pool) = setup_db().await else { return };
    let store = ItemStore::new(pool.clone()).with_max_payload_bytes(64);

    let zero = store
        .enqueue(NewItem::new("notification", Priority::NORMAL, json!({})).max_attempts(0))
        .await;
    assert!(matches!(zero, Err(QueueError::Validation(_))));

    let unset = store
        .enqueue(NewItem::new("notification", Priority::NORMAL, Value::Null))
        .await;
    assert!(matches!(unset, Err(QueueError::Validation(_))));

    let big = store
        .enqueue(NewItem::new(
            "notification",
            Priority::NORMAL,
            json!({"body": "x".repeat(100)}),
        ))
        .await;
    assert!(matches!(big, Err(QueueError::Validation(_))));

    let orphan = store
        .enqueue(NewItem::new("notification", Priority::NORMAL, json!({})).parent(Uuid::new_v4()))
        .await;
    assert!(matches!(orphan, Err(QueueError::Validation(_))));

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_items")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0, "rejected requests must not be persisted");
}

#[tokio::test]
#[serial]
async fn complete_by_another_worker_is_a_state_error() {
    let Some(pool) = setup_db().await else { return };
    let store = ItemStore::new(pool.clone());

    let id = enqueue(&store, "notification", Priority::NORMAL).await;
    store.claim_next("worker-a").await.unwrap().unwrap();

    let err = store.complete(id, "worker-b").await.unwrap_err();
    assert!(err.is_state(), "{err}");

    let item = store.get(id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::InProgress);
    assert_eq!(item.worker_id.as_deref(), Some("worker-a"));
}

#[tokio::test]
#[serial]
async fn complete_of_queued_item_is_a_state_error() {
    let Some(pool) = setup_db().await else { return };
    let store = ItemStore::new(pool.clone());

    let id = enqueue(&store, "notification", Priority::NORMAL).await;
    let err = store.complete(id, "worker-a").await.unwrap_err();
    assert!(err.is_state(), "{err}");

    let missing = store.complete(Uuid::new_v4(), "worker-a").await.unwrap_err();
    assert!(matches!(missing, QueueError::NotFound(_)));
}

#[tokio::test]
#[serial]
async fn terminal_items_never_transition_again() {
    let Some(pool) = setup_db().await else { return };
    let store = ItemStore::new(pool.clone());

    let id = enqueue(&store, "notification", Priority::NORMAL).await;
    store.claim_next("worker-a").await.unwrap().unwrap();
    store.complete(id, "worker-a").await.unwrap();

    assert!(store.complete(id, "worker-a").await.unwrap_err().is_state());
    assert!(store
        .requeue(id, "worker-a", Duration::ZERO, "again")
        .await
        .unwrap_err()
        .is_state());
    assert!(store
        .dead_letter(id, Some("worker-a"), "late")
        .await
        .unwrap_err()
        .is_state());
    assert!(store.dead_letter(id, None, "late").await.unwrap_err().is_state());
    assert!(store.claim_next("worker-b").await.unwrap().is_none());

    let item = store.get(id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Completed);
}

#[tokio::test]
#[serial]
async fn requeue_pushes_schedule_and_counts_attempt() {
    let Some(pool) = setup_db().await else { return };
    let store = ItemStore::new(pool.clone());

    let id = store
        .enqueue(NewItem::new("skill_call", Priority::NORMAL, json!({"skill": "weather"})).max_attempts(5))
        .await
        .unwrap();
    let claimed = store.claim_next("worker-a").await.unwrap().unwrap();

    let requeued = store
        .requeue(id, "worker-a", Duration::from_secs(60), "upstream 503")
        .await
        .unwrap();
    assert_eq!(requeued.status, ItemStatus::Queued);
    assert_eq!(requeued.attempt_count, 1);
    assert_eq!(requeued.worker_id, None);
    assert_eq!(requeued.last_error.as_deref(), Some("upstream 503"));
    assert!(requeued.scheduled_for > claimed.started_at.unwrap());

    // not due for another minute
    assert!(store.claim_next("worker-b").await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn requeue_refuses_to_exceed_max_attempts() {
    let Some(pool) = setup_db().await else { return };
    let store = ItemStore::new(pool.clone());

    let id = store
        .enqueue(NewItem::new("skill_call", Priority::NORMAL, json!({})).max_attempts(1))
        .await
        .unwrap();
    store.claim_next("worker-a").await.unwrap().unwrap();

    let err = store
        .requeue(id, "worker-a", Duration::ZERO, "boom")
        .await
        .unwrap_err();
    assert!(err.is_state(), "{err}");

    let dl = store.dead_letter(id, Some("worker-a"), "boom").await.unwrap();
    assert_eq!(dl.status, ItemStatus::DeadLetter);
    assert_eq!(dl.attempt_count, 1);
    assert_eq!(dl.last_error.as_deref(), Some("boom"));
}

#[tokio::test]
#[serial]
async fn operator_can_quarantine_a_queued_item() {
    let Some(pool) = setup_db().await else { return };
    let store = ItemStore::new(pool.clone());

    let id = enqueue(&store, "notification", Priority::NORMAL).await;
    let dl = store.dead_letter(id, None, "cancelled by user").await.unwrap();
    assert_eq!(dl.status, ItemStatus::DeadLetter);
    assert_eq!(dl.attempt_count, 0);

    assert!(store.claim_next("worker-a").await.unwrap().is_none());

    let counts = store.status_counts().await.unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].status, ItemStatus::DeadLetter);
    assert_eq!(counts[0].count, 1);
}
