//! Execution ledger: append-only run history plus per-rule counters.
//!
//! Counters on the rule row are only ever written here, in the same
//! transaction as the record insert.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::Database;

/// Outcome of one rule run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Every runnable action succeeded.
    Success,
    /// Some actions succeeded and some failed.
    Partial,
    /// Failures and nothing succeeded, or the run timed out.
    Failed,
    /// Nothing was runnable.
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Partial => "partial",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
        }
    }

    /// Whether the queue item should be retried for this run.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ExecutionStatus::Partial | ExecutionStatus::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ExecutionStatus::Success),
            "partial" => Ok(ExecutionStatus::Partial),
            "failed" => Ok(ExecutionStatus::Failed),
            "skipped" => Ok(ExecutionStatus::Skipped),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// A single rule run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub queue_item_id: Option<Uuid>,
    /// Snapshot of the match context the run saw.
    pub trigger_payload: serde_json::Value,
    /// Per-action outcomes.
    pub result: serde_json::Value,
    pub status: ExecutionStatus,
    pub actions_executed: u32,
    pub actions_failed: u32,
    pub duration_ms: u64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(
        rule_id: Uuid,
        queue_item_id: Option<Uuid>,
        trigger_payload: serde_json::Value,
        status: ExecutionStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_id,
            queue_item_id,
            trigger_payload,
            result: serde_json::Value::Array(Vec::new()),
            status,
            actions_executed: 0,
            actions_failed: 0,
            duration_ms: 0,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }
}

/// Counter snapshot for one rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RuleStats {
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
}

impl RuleStats {
    /// Fraction of runs that succeeded; `None` before the first run.
    pub fn success_rate(&self) -> Option<f64> {
        (self.execution_count > 0).then(|| self.success_count as f64 / self.execution_count as f64)
    }
}

/// Writes and reads run history.
#[derive(Clone)]
pub struct ExecutionLedger {
    store: Arc<dyn Database>,
}

impl ExecutionLedger {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    /// Append a record and bump the rule's counters atomically.
    pub async fn record(&self, record: &ExecutionRecord) -> Result<(), DatabaseError> {
        self.store.record_execution(record).await?;
        debug!(
            rule_id = %record.rule_id,
            status = %record.status,
            executed = record.actions_executed,
            failed = record.actions_failed,
            duration_ms = record.duration_ms,
            "Execution recorded"
        );
        Ok(())
    }

    /// Newest first.
    pub async fn executions_for_rule(
        &self,
        rule_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        self.store.list_executions(rule_id, limit).await
    }

    /// Runs of one rule triggered by one queue item.
    pub async fn executions_for_item(
        &self,
        rule_id: Uuid,
        queue_item_id: Uuid,
    ) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        self.store
            .list_executions_for_item(rule_id, queue_item_id)
            .await
    }

    pub async fn rule_stats(&self, rule_id: Uuid) -> Result<Option<RuleStats>, DatabaseError> {
        Ok(self.store.get_rule(rule_id).await?.map(|rule| RuleStats {
            execution_count: rule.execution_count,
            success_count: rule.success_count,
            failure_count: rule.failure_count,
            last_executed_at: rule.last_executed_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Rule, TriggerType};
    use crate::store::LibSqlBackend;
    use serde_json::json;

    #[test]
    fn status_display_parse() {
        for s in [
            ExecutionStatus::Success,
            ExecutionStatus::Partial,
            ExecutionStatus::Failed,
            ExecutionStatus::Skipped,
        ] {
            assert_eq!(s.to_string().parse::<ExecutionStatus>().unwrap(), s);
        }
        assert!(ExecutionStatus::Partial.is_incomplete());
        assert!(!ExecutionStatus::Skipped.is_incomplete());
    }

    #[tokio::test]
    async fn stats_follow_records() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let ledger = ExecutionLedger::new(store.clone());
        let rule = Rule::new("notes", "owner", TriggerType::IncomingMessage);
        store.save_rule(&rule).await.unwrap();

        let before = ledger.rule_stats(rule.id).await.unwrap().unwrap();
        assert_eq!(before.execution_count, 0);
        assert_eq!(before.success_rate(), None);

        for status in [ExecutionStatus::Success, ExecutionStatus::Success, ExecutionStatus::Failed] {
            ledger
                .record(&ExecutionRecord::new(rule.id, None, json!({}), status))
                .await
                .unwrap();
        }

        let stats = ledger.rule_stats(rule.id).await.unwrap().unwrap();
        assert_eq!(stats.execution_count, 3);
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.failure_count, 1);
        assert!((stats.success_rate().unwrap() - 2.0 / 3.0).abs() < 1e-9);

        let history = ledger.executions_for_rule(rule.id, 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_rule_has_no_stats() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let ledger = ExecutionLedger::new(store);
        assert!(ledger.rule_stats(Uuid::new_v4()).await.unwrap().is_none());
    }
}
