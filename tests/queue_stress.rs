//! Concurrent claimers on one database file never share an item.

use std::collections::HashSet;
use std::sync::Arc;

use chat_automator::queue::{ActionQueue, QueueStatus};
use chat_automator::store::{Database, LibSqlBackend};

const ITEMS: usize = 200;
const CLAIMERS: usize = 8;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Database> =
        Arc::new(LibSqlBackend::new_local(&dir.path().join("queue.db")).await.unwrap());
    let queue = ActionQueue::new(Arc::clone(&store), 3);

    for n in 0..ITEMS {
        queue
            .enqueue("message.created", serde_json::json!({ "n": n }))
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for c in 0..CLAIMERS {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let worker = format!("claimer-{c}");
            let mut mine = Vec::new();
            loop {
                let batch = queue.claim_batch(&worker, 7).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                for item in batch {
                    assert_eq!(item.status, QueueStatus::Processing);
                    assert_eq!(item.claimed_by.as_deref(), Some(worker.as_str()));
                    queue.mark_completed(item.id, &worker).await.unwrap();
                    mine.push(item.id);
                }
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for task in tasks {
        for id in task.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "item {id} claimed twice");
        }
    }
    assert_eq!(total, ITEMS);

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.completed, ITEMS as u64);
    assert_eq!(stats.pending + stats.processing + stats.failed, 0);
}

#[tokio::test]
async fn exhausted_item_fails_once_and_is_never_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Database> =
        Arc::new(LibSqlBackend::new_local(&dir.path().join("dlq.db")).await.unwrap());
    let queue = ActionQueue::new(Arc::clone(&store), 2);
    let id = queue
        .enqueue("message.created", serde_json::json!({}))
        .await
        .unwrap();

    let mut statuses = Vec::new();
    for _ in 0..2 {
        let batch = queue.claim_batch("w", 1).await.unwrap();
        assert_eq!(batch.len(), 1);
        statuses.push(queue.mark_failed(id, "w", "boom").await.unwrap());
    }
    assert_eq!(statuses, vec![QueueStatus::Pending, QueueStatus::Failed]);

    assert!(queue.claim_batch("w", 10).await.unwrap().is_empty());
    assert!(queue.mark_failed(id, "w", "again").await.is_err());

    let dead = queue.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 2);
    assert_eq!(dead[0].last_error.as_deref(), Some("boom"));
}
