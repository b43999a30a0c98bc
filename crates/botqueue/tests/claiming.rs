// tests/claiming.rs
mod common;

use common::{enqueue, make_due, setup_db};

use botqueue::queue::{ItemStatus, ItemStore, NewItem, Priority};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use serial_test::serial;
use std::collections::HashSet;
use uuid::Uuid;

#[tokio::test]
#[serial]
async fn two_workers_never_claim_the_same_item() {
    let Some(pool) = setup_db().await else { return };
    let store = ItemStore::new(pool.clone());

    let id = enqueue(&store, "chat_message", Priority::NORMAL).await;

    let store_a = store.clone();
    let store_b = store.clone();
    let (a, b) = tokio::join!(
        async move { store_a.claim_next("worker-a").await.unwrap() },
        async move { store_b.claim_next("worker-b").await.unwrap() },
    );

    assert!(
        a.is_some() ^ b.is_some(),
        "expected exactly one claimant, got a={} b={}",
        a.is_some(),
        b.is_some()
    );

    let item = store.get(id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::InProgress);
    assert!(matches!(
        item.worker_id.as_deref(),
        Some("worker-a") | Some("worker-b")
    ));
}

#[tokio::test]
#[serial]
async fn concurrent_pollers_get_disjoint_items() {
    let Some(pool) = setup_db().await else { return };
    let store = ItemStore::new(pool.clone());

    let mut enqueued = HashSet::new();
    for i in 0..20 {
        let priority = if i % 2 == 0 { Priority::NORMAL } else { Priority::BATCH };
        enqueued.insert(enqueue(&store, "notification", priority).await);
    }

    let mut handles = Vec::new();
    for w in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let worker = format!("worker-{w}");
            let mut got = Vec::new();
            while let Some(item) = store.claim_next(&worker).await.unwrap() {
                got.push(item.id);
            }
            got
        }));
    }

    let mut claimed: Vec<Uuid> = Vec::new();
    for h in handles {
        claimed.extend(h.await.unwrap());
    }

    let unique: HashSet<Uuid> = claimed.iter().copied().collect();
    assert_eq!(unique.len(), claimed.len(), "an item was claimed twice");
    assert_eq!(unique, enqueued, "every item should be claimed exactly once");
}

#[tokio::test]
#[serial]
async fn higher_priority_is_claimed_first() {
    let Some(pool) = setup_db().await else { return };
    let store = ItemStore::new(pool.clone());

    let batch = enqueue(&store, "digest", Priority::BATCH).await;
    let normal = enqueue(&store, "notification", Priority::NORMAL).await;
    let interactive = enqueue(&store, "chat_message", Priority::INTERACTIVE).await;

    let order: Vec<Uuid> = {
        let mut v = Vec::new();
        while let Some(item) = store.claim_next("worker-a").await.unwrap() {
            v.push(item.id);
        }
        v
    };

    assert_eq!(order, vec![interactive, normal, batch]);
}

#[tokio::test]
#[serial]
async fn same_priority_is_claimed_oldest_first() {
    let Some(pool) = setup_db().await else { return };
    let store = ItemStore::new(pool.clone());

    let first = enqueue(&store, "notification", Priority::NORMAL).await;
    let second = enqueue(&store, "notification", Priority::NORMAL).await;
    let third = enqueue(&store, "notification", Priority::NORMAL).await;

    let mut order = Vec::new();
    while let Some(item) = store.claim_next("worker-a").await.unwrap() {
        order.push(item.id);
    }
    assert_eq!(order, vec![first, second, third]);
}

#[tokio::test]
#[serial]
async fn scheduled_item_is_not_claimed_early() {
    let Some(pool) = setup_db().await else { return };
    let store = ItemStore::new(pool.clone());

    let later = Utc::now() + ChronoDuration::minutes(10);
    let id = store
        .enqueue(
            NewItem::new("reminder", Priority::NORMAL, json!({"text": "stand up"}))
                .scheduled_for(later),
        )
        .await
        .unwrap();

    let early = store.claim_next("worker-a").await.unwrap();
    assert!(early.is_none(), "should not claim before scheduled_for");

    make_due(&pool, id).await;

    let claimed = store
        .claim_next("worker-a")
        .await
        .unwrap()
        .expect("should claim once due");
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.worker_id.as_deref(), Some("worker-a"));
    assert!(claimed.started_at.is_some());
}

#[tokio::test]
#[serial]
async fn future_high_priority_does_not_block_due_items() {
    let Some(pool) = setup_db().await else { return };
    let store = ItemStore::new(pool.clone());

    let _future = store
        .enqueue(
            NewItem::new("chat_message", Priority::INTERACTIVE, json!({}))
                .scheduled_for(Utc::now() + ChronoDuration::minutes(5)),
        )
        .await
        .unwrap();
    let due = enqueue(&store, "digest", Priority::BATCH).await;

    let claimed = store.claim_next("worker-a").await.unwrap().unwrap();
    assert_eq!(claimed.id, due);
    assert!(store.claim_next("worker-a").await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn empty_queue_returns_none() {
    let Some(pool) = setup_db().await else { return };
    let store = ItemStore::new(pool);

    assert!(store.claim_next("worker-a").await.unwrap().is_none());
}
