//! Worker pool: N independent poll loops plus a stale-claim reaper.
//!
//! Each loop:
//! 1. Claims a batch (bounded by the claim timeout)
//! 2. Renews each claim, then runs the `ItemHandler` on its own task
//!    with a budget below the lease
//! 3. Marks each item completed or failed (a panic or an overrun is a
//!    failure)
//! 4. Sleeps for the poll interval when the queue was empty
//!
//! Shutdown is a `watch` channel handed to every loop; it is checked
//! between batches and wakes idle sleeps. Items already claimed are
//! finished before a loop exits.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{PipelineError, QueueError};
use crate::queue::{ActionQueue, QueueItem};

/// Processes one claimed item. `Err` sends the item back for retry.
#[async_trait]
pub trait ItemHandler: Send + Sync {
    async fn handle(&self, item: &QueueItem) -> Result<(), PipelineError>;
}

/// A fixed-size set of poll loops sharing one queue.
pub struct WorkerPool {
    queue: ActionQueue,
    handler: Arc<dyn ItemHandler>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(queue: ActionQueue, handler: Arc<dyn ItemHandler>, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    /// Spawn the poll loops and the reaper. Send `true` on the shutdown channel to stop them.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let workers = self.config.workers.max(1);
        info!(workers, batch_size = self.config.batch_size, "Starting worker pool");

        let mut handles = Vec::with_capacity(workers + 1);
        for n in 0..workers {
            let worker = PollLoop {
                id: format!("worker-{n}"),
                queue: self.queue.clone(),
                handler: Arc::clone(&self.handler),
                config: self.config.clone(),
            };
            handles.push(tokio::spawn(worker.run(shutdown.clone())));
        }
        handles.push(spawn_reaper(
            self.queue.clone(),
            self.config.clone(),
            shutdown,
        ));
        handles
    }
}

struct PollLoop {
    id: String,
    queue: ActionQueue,
    handler: Arc<dyn ItemHandler>,
    config: WorkerConfig,
}

impl PollLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = %self.id, "Poll loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let claimed = self
                .queue
                .claim_batch_within(&self.id, self.config.batch_size, self.config.claim_timeout)
                .await;

            match claimed {
                Ok(items) if !items.is_empty() => {
                    for item in items {
                        self.process(item).await;
                    }
                    continue;
                }
                Ok(_) => {}
                // Contention is transient; the next poll tries again.
                Err(QueueError::ClaimTimeout(t)) => {
                    debug!(worker = %self.id, timeout = ?t, "Claim timed out");
                }
                Err(e) => {
                    warn!(worker = %self.id, error = %e, "Claim failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(worker = %self.id, "Poll loop stopped");
    }

    async fn process(&self, item: QueueItem) {
        let item_id = item.id;
        let attempt = item.attempts;

        // Later items in a batch wait their turn; restart their lease.
        match self.queue.renew_claim(item_id, &self.id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(worker = %self.id, item_id = %item_id, "Claim lost before processing, skipping");
                return;
            }
            Err(e) => {
                warn!(worker = %self.id, item_id = %item_id, error = %e, "Claim renewal failed, skipping");
                return;
            }
        }

        let budget = self.config.handler_budget();
        let handler = Arc::clone(&self.handler);
        let mut task = tokio::spawn(async move { handler.handle(&item).await });

        let outcome = match tokio::time::timeout(budget, &mut task).await {
            Ok(Ok(result)) => result.map_err(|e| e.to_string()),
            Ok(Err(join)) if join.is_panic() => Err(format!("handler panicked: {join}")),
            Ok(Err(join)) => Err(format!("handler task failed: {join}")),
            Err(_) => {
                task.abort();
                let _ = task.await;
                Err(format!("handler exceeded {budget:?}"))
            }
        };

        match outcome {
            Ok(()) => match self.queue.mark_completed(item_id, &self.id).await {
                Ok(()) => {}
                Err(QueueError::ClaimLost { .. }) => {
                    warn!(worker = %self.id, item_id = %item_id, "Claim lost while processing; result discarded");
                }
                Err(e) => {
                    error!(worker = %self.id, item_id = %item_id, error = %e, "Failed to mark item completed");
                }
            },
            Err(reason) => {
                match self.queue.mark_failed(item_id, &self.id, &reason).await {
                    Ok(status) => {
                        warn!(
                            worker = %self.id,
                            item_id = %item_id,
                            attempt,
                            next = %status,
                            error = %reason,
                            "Item processing failed"
                        );
                    }
                    Err(e) => {
                        error!(worker = %self.id, item_id = %item_id, error = %e, "Failed to mark item failed");
                    }
                }
            }
        }
    }
}

/// Periodically return abandoned claims to the queue.
fn spawn_reaper(
    queue: ActionQueue,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.reaper_interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = queue.requeue_stale(config.lease).await {
                        warn!(error = %e, "Stale-claim sweep failed");
                    }
                }
                // Only `true` is ever sent; a dropped sender also means stop.
                _ = shutdown.changed() => break,
            }
        }
        debug!("Reaper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueStatus;
    use crate::store::LibSqlBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingHandler {
        seen: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ItemHandler for CountingHandler {
        async fn handle(&self, _item: &QueueItem) -> Result<(), PipelineError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(PipelineError::RunsIncomplete { failed: 1, total: 1 })
            } else {
                Ok(())
            }
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            workers: 2,
            batch_size: 2,
            poll_interval: Duration::from_millis(10),
            ..WorkerConfig::default()
        }
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..300 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn pool_drains_queue_and_stops() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = ActionQueue::new(store, 3);
        for n in 0..5 {
            queue
                .enqueue("message.created", serde_json::json!({ "n": n }))
                .await
                .unwrap();
        }

        let handler = Arc::new(CountingHandler {
            seen: AtomicUsize::new(0),
            fail: false,
        });
        let pool = WorkerPool::new(queue.clone(), handler.clone(), fast_config());
        let (tx, rx) = watch::channel(false);
        let handles = pool.spawn(rx);

        let q = queue.clone();
        wait_until(|| {
            let q = q.clone();
            async move { q.stats().await.unwrap().completed == 5 }
        })
        .await;
        assert_eq!(handler.seen.load(Ordering::SeqCst), 5);

        tx.send(true).unwrap();
        for h in handles {
            tokio::time::timeout(Duration::from_secs(2), h)
                .await
                .expect("worker did not stop")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn failing_handler_exhausts_attempts() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = ActionQueue::new(store, 2);
        let id = queue
            .enqueue("message.created", serde_json::json!({}))
            .await
            .unwrap();

        let handler = Arc::new(CountingHandler {
            seen: AtomicUsize::new(0),
            fail: true,
        });
        let pool = WorkerPool::new(queue.clone(), handler.clone(), fast_config());
        let (tx, rx) = watch::channel(false);
        let handles = pool.spawn(rx);

        let q = queue.clone();
        wait_until(|| {
            let q = q.clone();
            async move { q.stats().await.unwrap().failed == 1 }
        })
        .await;

        // Give the loops a few more polls; the dead letter must stay put.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.seen.load(Ordering::SeqCst), 2);
        let item = queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.attempts, 2);

        tx.send(true).unwrap();
        for h in handles {
            let _ = tokio::time::timeout(Duration::from_secs(2), h).await;
        }
    }

    /// Sleeps far past any test lease while tracking how many calls overlap.
    #[derive(Default)]
    struct SlowHandler {
        calls: AtomicUsize,
        running: Arc<AtomicUsize>,
        max_running: AtomicUsize,
    }

    struct Running(Arc<AtomicUsize>);

    impl Drop for Running {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ItemHandler for SlowHandler {
        async fn handle(&self, _item: &QueueItem) -> Result<(), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            let _running = Running(Arc::clone(&self.running));
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn overrunning_handler_fails_before_lease_expires() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = ActionQueue::new(store, 2);
        let id = queue
            .enqueue("message.created", serde_json::json!({}))
            .await
            .unwrap();

        let handler = Arc::new(SlowHandler::default());
        let config = WorkerConfig {
            lease: Duration::from_millis(200),
            reaper_interval: Duration::from_millis(20),
            ..fast_config()
        };
        let pool = WorkerPool::new(queue.clone(), handler.clone(), config);
        let (tx, rx) = watch::channel(false);
        let handles = pool.spawn(rx);

        let q = queue.clone();
        wait_until(|| {
            let q = q.clone();
            async move { q.stats().await.unwrap().failed == 1 }
        })
        .await;

        // The reaper never handed the item to a second worker mid-run.
        assert_eq!(handler.max_running.load(Ordering::SeqCst), 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        let item = queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.attempts, 2);
        assert!(item.last_error.unwrap().contains("exceeded"));

        tx.send(true).unwrap();
        for h in handles {
            let _ = tokio::time::timeout(Duration::from_secs(2), h).await;
        }
    }

    /// Panics on its first call only.
    struct PanicOnceHandler {
        calls: AtomicUsize,
        first: std::sync::Mutex<Option<uuid::Uuid>>,
    }

    #[async_trait]
    impl ItemHandler for PanicOnceHandler {
        async fn handle(&self, item: &QueueItem) -> Result<(), PipelineError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                *self.first.lock().unwrap() = Some(item.id);
                panic!("malformed payload");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn handler_panic_fails_the_item_and_loop_keeps_polling() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = ActionQueue::new(store, 3);
        for n in 0..2 {
            queue
                .enqueue("message.created", serde_json::json!({ "n": n }))
                .await
                .unwrap();
        }

        let handler = Arc::new(PanicOnceHandler {
            calls: AtomicUsize::new(0),
            first: std::sync::Mutex::new(None),
        });
        let config = WorkerConfig {
            workers: 1,
            ..fast_config()
        };
        let pool = WorkerPool::new(queue.clone(), handler.clone(), config);
        let (tx, rx) = watch::channel(false);
        let handles = pool.spawn(rx);

        let q = queue.clone();
        wait_until(|| {
            let q = q.clone();
            async move { q.stats().await.unwrap().completed == 2 }
        })
        .await;

        let panicked = handler.first.lock().unwrap().unwrap();
        let item = queue.get(panicked).await.unwrap().unwrap();
        assert_eq!(item.attempts, 2);
        assert!(item.last_error.unwrap().contains("panicked"));

        tx.send(true).unwrap();
        for h in handles {
            tokio::time::timeout(Duration::from_secs(2), h)
                .await
                .expect("worker did not stop")
                .unwrap();
        }
    }
}
