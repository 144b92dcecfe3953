//! Unified `Database` trait: a single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{
    BillRecord, CalendarEventRecord, EntityKind, NoteRecord, ReminderRecord, TaskRecord,
};
use crate::error::DatabaseError;
use crate::ledger::ExecutionRecord;
use crate::queue::{QueueItem, QueueStats, QueueStatus};
use crate::rules::{Rule, TriggerType};

/// A raw inbound event, persisted before anything else runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: Uuid,
    /// Provider-assigned id; the idempotency key for ingestion.
    pub provider_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// A chat participant or group known to the messaging provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// Natural key from the provider.
    pub provider_id: String,
    pub display_name: Option<String>,
    pub is_group: bool,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of an idempotent insert keyed on a natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upsert {
    pub id: Uuid,
    /// False when a record with the same key already existed.
    pub created: bool,
}

/// Backend-agnostic database trait covering the queue, rules, ledger,
/// ingestion and domain records.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Queue ───────────────────────────────────────────────────────

    async fn insert_queue_item(&self, item: &QueueItem) -> Result<(), DatabaseError>;

    /// Atomically move up to `limit` pending items (oldest first) to
    /// `processing`, incrementing their attempt counters.
    async fn claim_queue_items(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, DatabaseError>;

    /// Restamp `claimed_at` on a claim still held by `worker_id`.
    async fn renew_queue_claim(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// `processing → completed`. False unless `worker_id` holds the claim.
    async fn complete_queue_item(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// `processing → pending | failed`. `None` unless `worker_id` holds the claim.
    async fn fail_queue_item(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<Option<QueueStatus>, DatabaseError>;

    /// Release `processing` items claimed at or before `cutoff`.
    async fn requeue_stale_queue_items(&self, cutoff: DateTime<Utc>)
    -> Result<usize, DatabaseError>;

    /// `failed → pending` with attempts reset. False if the item was not failed.
    async fn reset_queue_item(&self, id: Uuid) -> Result<bool, DatabaseError>;

    async fn get_queue_item(&self, id: Uuid) -> Result<Option<QueueItem>, DatabaseError>;

    async fn list_queue_items(
        &self,
        status: QueueStatus,
        limit: usize,
    ) -> Result<Vec<QueueItem>, DatabaseError>;

    async fn queue_stats(&self) -> Result<QueueStats, DatabaseError>;

    // ── Rules ───────────────────────────────────────────────────────

    /// Insert or replace a rule together with its conditions and actions.
    async fn save_rule(&self, rule: &Rule) -> Result<(), DatabaseError>;

    async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>, DatabaseError>;

    /// Active rules of one trigger type, by priority then creation order.
    async fn list_active_rules(&self, trigger_type: TriggerType)
    -> Result<Vec<Rule>, DatabaseError>;

    async fn set_rule_active(&self, id: Uuid, active: bool) -> Result<bool, DatabaseError>;

    async fn set_rule_next_fire(
        &self,
        id: Uuid,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    async fn delete_rule(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Execution ledger ────────────────────────────────────────────

    /// Append a record and bump the rule's counters in one transaction.
    async fn record_execution(&self, record: &ExecutionRecord) -> Result<(), DatabaseError>;

    /// Newest first.
    async fn list_executions(
        &self,
        rule_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, DatabaseError>;

    /// Every run of `rule_id` for one queue item, newest first.
    async fn list_executions_for_item(
        &self,
        rule_id: Uuid,
        queue_item_id: Uuid,
    ) -> Result<Vec<ExecutionRecord>, DatabaseError>;

    // ── Ingestion ───────────────────────────────────────────────────

    /// Store the event and its queue item together, or neither. False
    /// (and nothing written) if the event was already stored.
    async fn insert_event_with_item(
        &self,
        event: &StoredEvent,
        item: &QueueItem,
    ) -> Result<bool, DatabaseError>;

    async fn get_event(
        &self,
        provider_event_id: &str,
    ) -> Result<Option<StoredEvent>, DatabaseError>;

    async fn upsert_contact(&self, contact: &Contact) -> Result<(), DatabaseError>;

    async fn get_contact(&self, provider_id: &str) -> Result<Option<Contact>, DatabaseError>;

    async fn save_media(
        &self,
        reference: &str,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<(), DatabaseError>;

    async fn get_media(&self, reference: &str) -> Result<Option<Vec<u8>>, DatabaseError>;

    // ── Domain records ──────────────────────────────────────────────

    async fn upsert_task(&self, task: &TaskRecord) -> Result<Upsert, DatabaseError>;

    async fn upsert_note(&self, note: &NoteRecord) -> Result<Upsert, DatabaseError>;

    async fn upsert_reminder(&self, reminder: &ReminderRecord) -> Result<Upsert, DatabaseError>;

    async fn upsert_bill(&self, bill: &BillRecord) -> Result<Upsert, DatabaseError>;

    async fn upsert_calendar_event(
        &self,
        event: &CalendarEventRecord,
    ) -> Result<Upsert, DatabaseError>;

    async fn set_calendar_provider_id(
        &self,
        id: Uuid,
        provider_event_id: &str,
    ) -> Result<(), DatabaseError>;

    async fn get_calendar_event(
        &self,
        id: Uuid,
    ) -> Result<Option<CalendarEventRecord>, DatabaseError>;

    async fn list_calendar_events(
        &self,
        owner_id: &str,
    ) -> Result<Vec<CalendarEventRecord>, DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError>;

    async fn list_tasks(&self, owner_id: &str) -> Result<Vec<TaskRecord>, DatabaseError>;

    async fn list_bills(&self, owner_id: &str) -> Result<Vec<BillRecord>, DatabaseError>;

    async fn count_entities(&self, kind: EntityKind) -> Result<u64, DatabaseError>;

    /// Apply whitelisted column changes. False if no record has that id.
    async fn update_entity(
        &self,
        kind: EntityKind,
        id: Uuid,
        changes: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<bool, DatabaseError>;
}
