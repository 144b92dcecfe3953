//! Durable action queue.
//!
//! Items are claimed in batches inside a single write transaction, so two
//! workers never hold the same item. Failed items go back to `pending`
//! until their attempt budget is spent, then stay in `failed` as dead
//! letters for an operator to inspect or reset.

pub mod model;
pub mod worker;

pub use model::{QueueItem, QueueStats, QueueStatus};
pub use worker::{ItemHandler, WorkerPool};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::pipeline::types::QueueEvent;
use crate::store::{Database, StoredEvent};

/// Handle to the queue. Cheap to clone.
#[derive(Clone)]
pub struct ActionQueue {
    store: Arc<dyn Database>,
    max_attempts: u32,
}

impl ActionQueue {
    pub fn new(store: Arc<dyn Database>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Add a pending item and return its id.
    pub async fn enqueue(
        &self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid, QueueError> {
        let item = QueueItem::new(event_type, payload, self.max_attempts);
        self.store.insert_queue_item(&item).await?;
        debug!(item_id = %item.id, event_type, "Enqueued item");
        Ok(item.id)
    }

    /// Enqueue a typed pipeline event.
    pub async fn enqueue_event(&self, event: &QueueEvent) -> Result<Uuid, QueueError> {
        self.enqueue(event.event_type(), event_payload(event)?).await
    }

    /// Record a received event and enqueue it in one write. `None` if the
    /// event was already recorded.
    pub async fn enqueue_received(
        &self,
        stored: &StoredEvent,
        event: &QueueEvent,
    ) -> Result<Option<Uuid>, QueueError> {
        let item = QueueItem::new(event.event_type(), event_payload(event)?, self.max_attempts);
        if !self.store.insert_event_with_item(stored, &item).await? {
            return Ok(None);
        }
        debug!(item_id = %item.id, event_type = %item.event_type, "Enqueued item");
        Ok(Some(item.id))
    }

    /// Fire one rule explicitly on behalf of `actor`.
    pub async fn enqueue_manual(&self, rule_id: Uuid, actor: &str) -> Result<Uuid, QueueError> {
        self.store
            .get_rule(rule_id)
            .await?
            .ok_or(QueueError::Database(crate::error::DatabaseError::NotFound {
                entity: "rule".into(),
                id: rule_id.to_string(),
            }))?;
        let event = QueueEvent::Manual {
            request_id: Uuid::new_v4(),
            rule_id,
            actor: actor.to_string(),
        };
        let id = self.enqueue_event(&event).await?;
        info!(item_id = %id, rule_id = %rule_id, actor, "Manual trigger enqueued");
        Ok(id)
    }

    /// Claim up to `limit` pending items for `worker_id`, oldest first.
    pub async fn claim_batch(
        &self,
        worker_id: &str,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let items = self
            .store
            .claim_queue_items(worker_id, limit, Utc::now())
            .await?;
        if !items.is_empty() {
            debug!(worker = worker_id, count = items.len(), "Claimed batch");
        }
        Ok(items)
    }

    /// Like `claim_batch`, bounded by `timeout`. A timeout yields `ClaimTimeout`.
    pub async fn claim_batch_within(
        &self,
        worker_id: &str,
        limit: usize,
        timeout: Duration,
    ) -> Result<Vec<QueueItem>, QueueError> {
        tokio::time::timeout(timeout, self.claim_batch(worker_id, limit))
            .await
            .map_err(|_| QueueError::ClaimTimeout(timeout))?
    }

    /// Restart the lease on a claim `worker_id` still holds. False if the
    /// claim was reaped or taken over.
    pub async fn renew_claim(&self, id: Uuid, worker_id: &str) -> Result<bool, QueueError> {
        Ok(self
            .store
            .renew_queue_claim(id, worker_id, Utc::now())
            .await?)
    }

    /// Mark an item `worker_id` is processing as completed.
    pub async fn mark_completed(&self, id: Uuid, worker_id: &str) -> Result<(), QueueError> {
        if self
            .store
            .complete_queue_item(id, worker_id, Utc::now())
            .await?
        {
            return Ok(());
        }
        Err(self
            .transition_error(id, QueueStatus::Processing, Some(worker_id))
            .await)
    }

    /// Record a failure by the claim holder. Returns the resulting status
    /// (`Pending` or `Failed`).
    pub async fn mark_failed(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<QueueStatus, QueueError> {
        match self.store.fail_queue_item(id, worker_id, error).await? {
            Some(status) => {
                if status == QueueStatus::Failed {
                    warn!(item_id = %id, error, "Queue item exhausted its attempts");
                }
                Ok(status)
            }
            None => Err(self
                .transition_error(id, QueueStatus::Processing, Some(worker_id))
                .await),
        }
    }

    /// Return abandoned claims older than `lease` to the queue.
    pub async fn requeue_stale(&self, lease: Duration) -> Result<usize, QueueError> {
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(lease)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let n = self.store.requeue_stale_queue_items(cutoff).await?;
        if n > 0 {
            info!(count = n, "Requeued stale claims");
        }
        Ok(n)
    }

    /// Terminally failed items, newest first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<QueueItem>, QueueError> {
        Ok(self
            .store
            .list_queue_items(QueueStatus::Failed, limit)
            .await?)
    }

    /// Reset a dead letter to pending with a fresh attempt budget.
    pub async fn retry_dead_letter(&self, id: Uuid) -> Result<(), QueueError> {
        if self.store.reset_queue_item(id).await? {
            info!(item_id = %id, "Dead letter reset to pending");
            return Ok(());
        }
        Err(self.transition_error(id, QueueStatus::Failed, None).await)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<QueueItem>, QueueError> {
        Ok(self.store.get_queue_item(id).await?)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.store.queue_stats().await?)
    }

    async fn transition_error(
        &self,
        id: Uuid,
        expected: QueueStatus,
        worker_id: Option<&str>,
    ) -> QueueError {
        match self.store.get_queue_item(id).await {
            Ok(Some(item)) => match worker_id {
                // Right status, wrong holder.
                Some(worker) if item.status == expected => QueueError::ClaimLost {
                    id,
                    worker: worker.to_string(),
                },
                _ => QueueError::InvalidTransition {
                    id,
                    status: item.status.to_string(),
                    expected: expected.to_string(),
                },
            },
            Ok(None) => QueueError::NotFound { id },
            Err(e) => QueueError::Database(e),
        }
    }
}

fn event_payload(event: &QueueEvent) -> Result<serde_json::Value, QueueError> {
    serde_json::to_value(event).map_err(|e| {
        QueueError::Database(crate::error::DatabaseError::Serialization(e.to_string()))
    })
}
