//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. One connection per
//! backend; every mutating method holds `write_lock` so a multi-statement
//! transaction is never interleaved with another task's writes on the same
//! connection. Separate backends on the same file coordinate through
//! SQLite's own locking (`BEGIN IMMEDIATE` + `busy_timeout`).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entities::{
    BillRecord, CalendarEventRecord, EntityKind, NoteRecord, ReminderRecord, TaskRecord,
};
use crate::error::DatabaseError;
use crate::ledger::{ExecutionRecord, ExecutionStatus};
use crate::queue::{QueueItem, QueueStats, QueueStatus};
use crate::rules::expr::Expr;
use crate::rules::{
    Action, ActionParams, Condition, FailurePolicy, PerformerFilter, Rule, TriggerConfig,
    TriggerType,
};
use crate::store::migrations;
use crate::store::traits::{Contact, Database, StoredEvent, Upsert};

/// How long a connection waits on another connection's write lock.
const BUSY_TIMEOUT_MS: u64 = 5000;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // PRAGMAs return a row, so go through `query`.
        conn.query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy_timeout: {e}")))?;
        conn.query("PRAGMA journal_mode = WAL", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable WAL: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Insert keyed on `source_key`, then read back the surviving id.
    async fn upsert_by_source_key(
        &self,
        op: &str,
        table: &str,
        source_key: &str,
        insert_sql: &str,
        values: Vec<libsql::Value>,
    ) -> Result<Upsert, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn();
        let inserted = conn
            .execute(insert_sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut rows = conn
            .query(
                &format!("SELECT id FROM {table} WHERE source_key = ?1"),
                params![source_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: table.to_string(),
                id: source_key.to_string(),
            })?;
        let id = parse_uuid(&row.get::<String>(0).unwrap_or_default())?;
        if inserted == 0 {
            debug!(table, source_key, "Record already exists for source key");
        }
        Ok(Upsert {
            id,
            created: inserted > 0,
        })
    }

    async fn load_rule_children(&self, rule: &mut Rule) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let rule_id = rule.id.to_string();

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CONDITION_COLUMNS} FROM rule_conditions WHERE rule_id = ?1 ORDER BY position"
                ),
                params![rule_id.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_conditions: {e}")))?;
        let mut conditions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load_conditions: {e}")))?
        {
            conditions.push(row_to_condition(&row)?);
        }

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ACTION_COLUMNS} FROM rule_actions WHERE rule_id = ?1 ORDER BY position"
                ),
                params![rule_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_actions: {e}")))?;
        let mut actions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load_actions: {e}")))?
        {
            actions.push(row_to_action(&row)?);
        }

        rule.conditions = conditions;
        rule.actions = actions;
        Ok(())
    }

    async fn query_queue_items(
        &self,
        op: &str,
        sql: &str,
        values: Params,
    ) -> Result<Vec<QueueItem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            items.push(row_to_queue_item(&row)?);
        }
        Ok(items)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed width, so text order is time order.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    s.parse()
        .map_err(|e| DatabaseError::Serialization(format!("invalid uuid '{s}': {e}")))
}

fn parse_json(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or(serde_json::Value::Null)
}

fn to_json_text<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

fn text(s: impl Into<String>) -> libsql::Value {
    libsql::Value::Text(s.into())
}

fn int(n: i64) -> libsql::Value {
    libsql::Value::Integer(n)
}

/// Map a JSON change value to a column value.
fn json_to_column(value: &serde_json::Value) -> libsql::Value {
    match value {
        serde_json::Value::Null => libsql::Value::Null,
        serde_json::Value::Bool(b) => int(*b as i64),
        serde_json::Value::Number(n) => text(n.to_string()),
        serde_json::Value::String(s) => text(s.clone()),
        other => text(other.to_string()),
    }
}

const QUEUE_COLUMNS: &str = "id, event_type, payload, status, attempts, max_attempts, last_error, created_at, claimed_at, claimed_by, completed_at";

fn insert_queue_item_sql() -> String {
    format!(
        "INSERT INTO queue_items ({QUEUE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
    )
}

fn queue_item_params(item: &QueueItem) -> Result<Params, DatabaseError> {
    Ok(Params::Positional(vec![
        text(item.id.to_string()),
        text(item.event_type.clone()),
        text(to_json_text(&item.payload)?),
        text(item.status.as_str()),
        int(item.attempts as i64),
        int(item.max_attempts as i64),
        opt_text(item.last_error.as_deref()),
        text(fmt_ts(item.created_at)),
        opt_ts(item.claimed_at),
        opt_text(item.claimed_by.as_deref()),
        opt_ts(item.completed_at),
    ]))
}

const RULE_COLUMNS: &str = "id, name, owner_id, active, trigger_type, trigger_config, performer, priority, execution_count, success_count, failure_count, last_executed_at, next_fire_at, created_at, updated_at";

const CONDITION_COLUMNS: &str =
    "id, condition_group, group_operator, operator, field, value, negate";

const ACTION_COLUMNS: &str =
    "id, position, action_type, params, is_conditional, condition_expr, max_attempts, on_failure";

const EXECUTION_COLUMNS: &str = "id, rule_id, queue_item_id, trigger_payload, result, status, actions_executed, actions_failed, duration_ms, metadata, created_at";

const TASK_COLUMNS: &str =
    "id, source_key, owner_id, title, description, status, due_at, created_at, updated_at";

const BILL_COLUMNS: &str = "id, source_key, owner_id, vendor, description, amount, currency, due_date, note, priority, status, created_at, updated_at";

const CALENDAR_COLUMNS: &str = "id, source_key, owner_id, title, start_at, end_at, all_day, location, is_virtual, meeting_link, provider_event_id, created_at, updated_at";

fn row_to_queue_item(row: &libsql::Row) -> Result<QueueItem, DatabaseError> {
    let status: QueueStatus = row
        .get::<String>(3)
        .unwrap_or_default()
        .parse()
        .map_err(DatabaseError::Serialization)?;
    Ok(QueueItem {
        id: parse_uuid(&row.get::<String>(0).unwrap_or_default())?,
        event_type: row.get(1).unwrap_or_default(),
        payload: parse_json(&row.get::<String>(2).unwrap_or_default()),
        status,
        attempts: row.get::<i64>(4).unwrap_or(0) as u32,
        max_attempts: row.get::<i64>(5).unwrap_or(1) as u32,
        last_error: row.get::<String>(6).ok(),
        created_at: parse_datetime(&row.get::<String>(7).unwrap_or_default()),
        claimed_at: parse_optional_datetime(row.get::<String>(8).ok()),
        claimed_by: row.get::<String>(9).ok(),
        completed_at: parse_optional_datetime(row.get::<String>(10).ok()),
    })
}

fn row_to_rule(row: &libsql::Row) -> Result<Rule, DatabaseError> {
    let trigger_type: TriggerType = row
        .get::<String>(4)
        .unwrap_or_default()
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let trigger_config: TriggerConfig =
        serde_json::from_str(&row.get::<String>(5).unwrap_or_else(|_| "{}".into()))
            .map_err(|e| DatabaseError::Serialization(format!("trigger_config: {e}")))?;
    let performer: PerformerFilter =
        serde_json::from_str(&row.get::<String>(6).unwrap_or_default()).unwrap_or_default();

    Ok(Rule {
        id: parse_uuid(&row.get::<String>(0).unwrap_or_default())?,
        name: row.get(1).unwrap_or_default(),
        owner_id: row.get(2).unwrap_or_default(),
        active: row.get::<i64>(3).unwrap_or(0) != 0,
        trigger_type,
        trigger_config,
        performer,
        priority: row.get::<i64>(7).unwrap_or(100) as i32,
        conditions: Vec::new(),
        actions: Vec::new(),
        execution_count: row.get::<i64>(8).unwrap_or(0) as u64,
        success_count: row.get::<i64>(9).unwrap_or(0) as u64,
        failure_count: row.get::<i64>(10).unwrap_or(0) as u64,
        last_executed_at: parse_optional_datetime(row.get::<String>(11).ok()),
        next_fire_at: parse_optional_datetime(row.get::<String>(12).ok()),
        created_at: parse_datetime(&row.get::<String>(13).unwrap_or_default()),
        updated_at: parse_datetime(&row.get::<String>(14).unwrap_or_default()),
    })
}

fn row_to_condition(row: &libsql::Row) -> Result<Condition, DatabaseError> {
    Ok(Condition {
        id: parse_uuid(&row.get::<String>(0).unwrap_or_default())?,
        group: row.get::<i64>(1).unwrap_or(0) as i32,
        group_operator: row
            .get::<String>(2)
            .unwrap_or_else(|_| "and".into())
            .parse()
            .map_err(DatabaseError::Serialization)?,
        operator: row
            .get::<String>(3)
            .unwrap_or_default()
            .parse()
            .map_err(DatabaseError::Serialization)?,
        field: row.get(4).unwrap_or_default(),
        value: parse_json(&row.get::<String>(5).unwrap_or_default()),
        negate: row.get::<i64>(6).unwrap_or(0) != 0,
    })
}

fn row_to_action(row: &libsql::Row) -> Result<Action, DatabaseError> {
    let action_type: String = row.get(2).unwrap_or_default();
    let params_str: String = row.get(3).unwrap_or_else(|_| "{}".into());
    let params = ActionParams::from_db(&action_type, parse_json(&params_str))
        .map_err(DatabaseError::Serialization)?;

    let is_conditional = row.get::<i64>(4).unwrap_or(0) != 0;
    let condition = if is_conditional {
        let raw: String = row.get(5).unwrap_or_default();
        Some(Expr::parse(&raw).map_err(|e| {
            DatabaseError::Serialization(format!("condition '{raw}' on {action_type}: {e}"))
        })?)
    } else {
        None
    };

    let on_failure = match row.get::<String>(7).ok() {
        Some(s) => Some(s.parse::<FailurePolicy>().map_err(DatabaseError::Serialization)?),
        None => None,
    };

    Ok(Action {
        id: parse_uuid(&row.get::<String>(0).unwrap_or_default())?,
        order: row.get::<i64>(1).unwrap_or(0) as i32,
        params,
        condition,
        max_attempts: row.get::<i64>(6).unwrap_or(1).max(1) as u32,
        on_failure,
    })
}

fn row_to_execution(row: &libsql::Row) -> Result<ExecutionRecord, DatabaseError> {
    let status: ExecutionStatus = row
        .get::<String>(5)
        .unwrap_or_default()
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let queue_item_id = match row.get::<String>(2).ok() {
        Some(s) => Some(parse_uuid(&s)?),
        None => None,
    };
    Ok(ExecutionRecord {
        id: parse_uuid(&row.get::<String>(0).unwrap_or_default())?,
        rule_id: parse_uuid(&row.get::<String>(1).unwrap_or_default())?,
        queue_item_id,
        trigger_payload: parse_json(&row.get::<String>(3).unwrap_or_default()),
        result: parse_json(&row.get::<String>(4).unwrap_or_default()),
        status,
        actions_executed: row.get::<i64>(6).unwrap_or(0) as u32,
        actions_failed: row.get::<i64>(7).unwrap_or(0) as u32,
        duration_ms: row.get::<i64>(8).unwrap_or(0) as u64,
        metadata: parse_json(&row.get::<String>(9).unwrap_or_else(|_| "{}".into())),
        created_at: parse_datetime(&row.get::<String>(10).unwrap_or_default()),
    })
}

fn row_to_task(row: &libsql::Row) -> Result<TaskRecord, DatabaseError> {
    Ok(TaskRecord {
        id: parse_uuid(&row.get::<String>(0).unwrap_or_default())?,
        source_key: row.get(1).unwrap_or_default(),
        owner_id: row.get(2).unwrap_or_default(),
        title: row.get(3).unwrap_or_default(),
        description: row.get::<String>(4).ok(),
        status: row.get(5).unwrap_or_else(|_| "open".into()),
        due_at: parse_optional_datetime(row.get::<String>(6).ok()),
        created_at: parse_datetime(&row.get::<String>(7).unwrap_or_default()),
        updated_at: parse_datetime(&row.get::<String>(8).unwrap_or_default()),
    })
}

fn row_to_bill(row: &libsql::Row) -> Result<BillRecord, DatabaseError> {
    let amount: Decimal = row
        .get::<String>(5)
        .unwrap_or_default()
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("bill amount: {e}")))?;
    let due_date = row
        .get::<String>(7)
        .ok()
        .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok());
    Ok(BillRecord {
        id: parse_uuid(&row.get::<String>(0).unwrap_or_default())?,
        source_key: row.get(1).unwrap_or_default(),
        owner_id: row.get(2).unwrap_or_default(),
        vendor: row.get(3).unwrap_or_default(),
        description: row.get(4).unwrap_or_default(),
        amount,
        currency: row.get(6).unwrap_or_default(),
        due_date,
        note: row.get::<String>(8).ok(),
        priority: row
            .get::<String>(9)
            .unwrap_or_default()
            .parse()
            .unwrap_or_default(),
        status: row.get(10).unwrap_or_else(|_| "pending".into()),
        created_at: parse_datetime(&row.get::<String>(11).unwrap_or_default()),
        updated_at: parse_datetime(&row.get::<String>(12).unwrap_or_default()),
    })
}

fn row_to_calendar_event(row: &libsql::Row) -> Result<CalendarEventRecord, DatabaseError> {
    Ok(CalendarEventRecord {
        id: parse_uuid(&row.get::<String>(0).unwrap_or_default())?,
        source_key: row.get(1).unwrap_or_default(),
        owner_id: row.get(2).unwrap_or_default(),
        title: row.get(3).unwrap_or_default(),
        start_at: parse_datetime(&row.get::<String>(4).unwrap_or_default()),
        end_at: parse_datetime(&row.get::<String>(5).unwrap_or_default()),
        all_day: row.get::<i64>(6).unwrap_or(0) != 0,
        location: row.get::<String>(7).ok(),
        is_virtual: row.get::<i64>(8).unwrap_or(0) != 0,
        meeting_link: row.get::<String>(9).ok(),
        provider_event_id: row.get::<String>(10).ok(),
        created_at: parse_datetime(&row.get::<String>(11).unwrap_or_default()),
        updated_at: parse_datetime(&row.get::<String>(12).unwrap_or_default()),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Queue ───────────────────────────────────────────────────────

    async fn insert_queue_item(&self, item: &QueueItem) -> Result<(), DatabaseError> {
        let params = queue_item_params(item)?;
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(&insert_queue_item_sql(), params)
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_queue_item: {e}")))?;
        Ok(())
    }

    async fn claim_queue_items(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_queue_items: begin: {e}")))?;

        let mut ids = Vec::new();
        {
            let mut rows = tx
                .query(
                    "SELECT id FROM queue_items WHERE status = 'pending' ORDER BY created_at ASC, rowid ASC LIMIT ?1",
                    params![limit as i64],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("claim_queue_items: select: {e}")))?;
            while let Some(row) = rows
                .next()
                .await
                .map_err(|e| DatabaseError::Query(format!("claim_queue_items: select: {e}")))?
            {
                ids.push(row.get::<String>(0).unwrap_or_default());
            }
        }

        let claimed_at = fmt_ts(now);
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            let changed = tx
                .execute(
                    "UPDATE queue_items SET status = 'processing', attempts = attempts + 1, claimed_at = ?2, claimed_by = ?3 WHERE id = ?1 AND status = 'pending'",
                    params![id.clone(), claimed_at.clone(), worker_id],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("claim_queue_items: update: {e}")))?;
            if changed == 0 {
                continue;
            }
            let mut rows = tx
                .query(
                    &format!("SELECT {QUEUE_COLUMNS} FROM queue_items WHERE id = ?1"),
                    params![id],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("claim_queue_items: reload: {e}")))?;
            if let Some(row) = rows
                .next()
                .await
                .map_err(|e| DatabaseError::Query(format!("claim_queue_items: reload: {e}")))?
            {
                items.push(row_to_queue_item(&row)?);
            }
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_queue_items: commit: {e}")))?;
        Ok(items)
    }

    async fn renew_queue_claim(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE queue_items SET claimed_at = ?3 WHERE id = ?1 AND status = 'processing' AND claimed_by = ?2",
                params![id.to_string(), worker_id, fmt_ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("renew_queue_claim: {e}")))?;
        Ok(changed > 0)
    }

    async fn complete_queue_item(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE queue_items SET status = 'completed', completed_at = ?2 WHERE id = ?1 AND status = 'processing' AND claimed_by = ?3",
                params![id.to_string(), fmt_ts(now), worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_queue_item: {e}")))?;
        Ok(changed > 0)
    }

    async fn fail_queue_item(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<Option<QueueStatus>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE queue_items SET
                    status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                    completed_at = CASE WHEN attempts >= max_attempts THEN ?3 ELSE NULL END,
                    last_error = ?2, claimed_at = NULL, claimed_by = NULL
                 WHERE id = ?1 AND status = 'processing' AND claimed_by = ?4",
                params![id.to_string(), error, fmt_ts(Utc::now()), worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_queue_item: {e}")))?;
        if changed == 0 {
            return Ok(None);
        }

        let mut rows = conn
            .query(
                "SELECT status FROM queue_items WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_queue_item: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row.get::<String>(0)
                    .unwrap_or_default()
                    .parse()
                    .map_err(DatabaseError::Serialization)?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("fail_queue_item: {e}"))),
        }
    }

    async fn requeue_stale_queue_items(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE queue_items SET
                    status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                    completed_at = CASE WHEN attempts >= max_attempts THEN ?2 ELSE NULL END,
                    last_error = 'claim lease expired', claimed_at = NULL, claimed_by = NULL
                 WHERE status = 'processing' AND claimed_at <= ?1",
                params![fmt_ts(cutoff), fmt_ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_stale_queue_items: {e}")))?;
        Ok(changed as usize)
    }

    async fn reset_queue_item(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE queue_items SET status = 'pending', attempts = 0, claimed_at = NULL, claimed_by = NULL, completed_at = NULL WHERE id = ?1 AND status = 'failed'",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_queue_item: {e}")))?;
        Ok(changed > 0)
    }

    async fn get_queue_item(&self, id: Uuid) -> Result<Option<QueueItem>, DatabaseError> {
        let items = self
            .query_queue_items(
                "get_queue_item",
                &format!("SELECT {QUEUE_COLUMNS} FROM queue_items WHERE id = ?1"),
                Params::Positional(vec![text(id.to_string())]),
            )
            .await?;
        Ok(items.into_iter().next())
    }

    async fn list_queue_items(
        &self,
        status: QueueStatus,
        limit: usize,
    ) -> Result<Vec<QueueItem>, DatabaseError> {
        self.query_queue_items(
            "list_queue_items",
            &format!(
                "SELECT {QUEUE_COLUMNS} FROM queue_items WHERE status = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
            ),
            Params::Positional(vec![text(status.as_str()), int(limit as i64)]),
        )
        .await
    }

    async fn queue_stats(&self) -> Result<QueueStats, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM queue_items GROUP BY status",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_stats: {e}")))?;
        let mut stats = QueueStats::default();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_stats: {e}")))?
        {
            let count = row.get::<i64>(1).unwrap_or(0) as u64;
            match row.get::<String>(0).unwrap_or_default().parse() {
                Ok(QueueStatus::Pending) => stats.pending = count,
                Ok(QueueStatus::Processing) => stats.processing = count,
                Ok(QueueStatus::Completed) => stats.completed = count,
                Ok(QueueStatus::Failed) => stats.failed = count,
                Err(e) => warn!("Skipping queue status row: {e}"),
            }
        }
        Ok(stats)
    }

    // ── Rules ───────────────────────────────────────────────────────

    async fn save_rule(&self, rule: &Rule) -> Result<(), DatabaseError> {
        rule.validate().map_err(DatabaseError::Constraint)?;
        let trigger_config = to_json_text(&rule.trigger_config)?;
        let performer = to_json_text(&rule.performer)?;
        let now = fmt_ts(Utc::now());
        let rule_id = rule.id.to_string();

        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("save_rule: begin: {e}")))?;

        // Counters are owned by the ledger; an update never touches them.
        tx.execute(
            &format!(
                "INSERT INTO rules ({RULE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    owner_id = excluded.owner_id,
                    active = excluded.active,
                    trigger_type = excluded.trigger_type,
                    trigger_config = excluded.trigger_config,
                    performer = excluded.performer,
                    priority = excluded.priority,
                    next_fire_at = excluded.next_fire_at,
                    updated_at = excluded.updated_at"
            ),
            Params::Positional(vec![
                text(rule_id.clone()),
                text(rule.name.clone()),
                text(rule.owner_id.clone()),
                int(rule.active as i64),
                text(rule.trigger_type.as_str()),
                text(trigger_config),
                text(performer),
                int(rule.priority as i64),
                int(rule.execution_count as i64),
                int(rule.success_count as i64),
                int(rule.failure_count as i64),
                opt_ts(rule.last_executed_at),
                opt_ts(rule.next_fire_at),
                text(fmt_ts(rule.created_at)),
                text(now),
            ]),
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("save_rule: {e}")))?;

        tx.execute(
            "DELETE FROM rule_conditions WHERE rule_id = ?1",
            params![rule_id.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("save_rule: conditions: {e}")))?;
        tx.execute(
            "DELETE FROM rule_actions WHERE rule_id = ?1",
            params![rule_id.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("save_rule: actions: {e}")))?;

        for (position, cond) in rule.conditions.iter().enumerate() {
            tx.execute(
                "INSERT INTO rule_conditions (id, rule_id, condition_group, group_operator, operator, field, value, negate, position) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                Params::Positional(vec![
                    text(cond.id.to_string()),
                    text(rule_id.clone()),
                    int(cond.group as i64),
                    text(cond.group_operator.as_str()),
                    text(cond.operator.as_str()),
                    text(cond.field.clone()),
                    text(to_json_text(&cond.value)?),
                    int(cond.negate as i64),
                    int(position as i64),
                ]),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_rule: condition: {e}")))?;
        }

        for action in &rule.actions {
            let params_json = to_json_text(&action.params.to_config_json())?;
            tx.execute(
                &format!(
                    "INSERT INTO rule_actions (rule_id, {ACTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                Params::Positional(vec![
                    text(rule_id.clone()),
                    text(action.id.to_string()),
                    int(action.order as i64),
                    text(action.action_type().as_str()),
                    text(params_json),
                    int(action.is_conditional() as i64),
                    opt_text(action.condition.as_ref().map(|c| c.to_string()).as_deref()),
                    int(action.max_attempts as i64),
                    opt_text(action.on_failure.map(|p| p.as_str())),
                ]),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_rule: action: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("save_rule: commit: {e}")))?;
        debug!(rule = %rule.name, rule_id = %rule.id, "Rule saved");
        Ok(())
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>, DatabaseError> {
        let mut rule = {
            let mut rows = self
                .conn()
                .query(
                    &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1"),
                    params![id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("get_rule: {e}")))?;
            match rows.next().await {
                Ok(Some(row)) => row_to_rule(&row)?,
                Ok(None) => return Ok(None),
                Err(e) => return Err(DatabaseError::Query(format!("get_rule: {e}"))),
            }
        };
        self.load_rule_children(&mut rule).await?;
        Ok(Some(rule))
    }

    async fn list_active_rules(
        &self,
        trigger_type: TriggerType,
    ) -> Result<Vec<Rule>, DatabaseError> {
        let mut headers = Vec::new();
        {
            let mut rows = self
                .conn()
                .query(
                    &format!(
                        "SELECT {RULE_COLUMNS} FROM rules WHERE active = 1 AND trigger_type = ?1 ORDER BY priority ASC, created_at ASC, rowid ASC"
                    ),
                    params![trigger_type.as_str()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("list_active_rules: {e}")))?;
            while let Some(row) = rows
                .next()
                .await
                .map_err(|e| DatabaseError::Query(format!("list_active_rules: {e}")))?
            {
                match row_to_rule(&row) {
                    Ok(rule) => headers.push(rule),
                    Err(e) => warn!("Skipping rule row: {e}"),
                }
            }
        }

        let mut rules = Vec::with_capacity(headers.len());
        for mut rule in headers {
            match self.load_rule_children(&mut rule).await {
                Ok(()) => rules.push(rule),
                Err(DatabaseError::Serialization(reason)) => {
                    warn!(rule = %rule.name, rule_id = %rule.id, %reason, "Skipping rule with malformed definition");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(rules)
    }

    async fn set_rule_active(&self, id: Uuid, active: bool) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE rules SET active = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), active as i64, fmt_ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_rule_active: {e}")))?;
        Ok(changed > 0)
    }

    async fn set_rule_next_fire(
        &self,
        id: Uuid,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE rules SET next_fire_at = ?2 WHERE id = ?1",
                Params::Positional(vec![text(id.to_string()), opt_ts(next_fire_at)]),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_rule_next_fire: {e}")))?;
        Ok(())
    }

    async fn delete_rule(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule: begin: {e}")))?;
        for table in ["rule_conditions", "rule_actions"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE rule_id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule: {table}: {e}")))?;
        }
        let count = tx
            .execute("DELETE FROM rules WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule: commit: {e}")))?;
        Ok(count > 0)
    }

    // ── Execution ledger ────────────────────────────────────────────

    async fn record_execution(&self, record: &ExecutionRecord) -> Result<(), DatabaseError> {
        let trigger_payload = to_json_text(&record.trigger_payload)?;
        let result = to_json_text(&record.result)?;
        let metadata = to_json_text(&record.metadata)?;
        let success = matches!(record.status, ExecutionStatus::Success) as i64;
        let failure = matches!(
            record.status,
            ExecutionStatus::Failed | ExecutionStatus::Partial
        ) as i64;

        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("record_execution: begin: {e}")))?;

        tx.execute(
            &format!(
                "INSERT INTO rule_executions ({EXECUTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            Params::Positional(vec![
                text(record.id.to_string()),
                text(record.rule_id.to_string()),
                opt_text(record.queue_item_id.map(|id| id.to_string()).as_deref()),
                text(trigger_payload),
                text(result),
                text(record.status.as_str()),
                int(record.actions_executed as i64),
                int(record.actions_failed as i64),
                int(record.duration_ms as i64),
                text(metadata),
                text(fmt_ts(record.created_at)),
            ]),
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_execution: insert: {e}")))?;

        let updated = tx
            .execute(
                "UPDATE rules SET
                    execution_count = execution_count + 1,
                    success_count = success_count + ?2,
                    failure_count = failure_count + ?3,
                    last_executed_at = ?4
                 WHERE id = ?1",
                params![
                    record.rule_id.to_string(),
                    success,
                    failure,
                    fmt_ts(record.created_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_execution: counters: {e}")))?;
        if updated == 0 {
            // Dropping the transaction rolls the insert back.
            return Err(DatabaseError::NotFound {
                entity: "rule".into(),
                id: record.rule_id.to_string(),
            });
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("record_execution: commit: {e}")))?;
        Ok(())
    }

    async fn list_executions(
        &self,
        rule_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM rule_executions WHERE rule_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                params![rule_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_executions: {e}")))?;
        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_executions: {e}")))?
        {
            records.push(row_to_execution(&row)?);
        }
        Ok(records)
    }

    async fn list_executions_for_item(
        &self,
        rule_id: Uuid,
        queue_item_id: Uuid,
    ) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM rule_executions WHERE rule_id = ?1 AND queue_item_id = ?2 ORDER BY created_at DESC, rowid DESC"
                ),
                params![rule_id.to_string(), queue_item_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_executions_for_item: {e}")))?;
        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_executions_for_item: {e}")))?
        {
            records.push(row_to_execution(&row)?);
        }
        Ok(records)
    }

    // ── Ingestion ───────────────────────────────────────────────────

    async fn insert_event_with_item(
        &self,
        event: &StoredEvent,
        item: &QueueItem,
    ) -> Result<bool, DatabaseError> {
        let payload = to_json_text(&event.payload)?;
        let item_params = queue_item_params(item)?;

        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_event_with_item: begin: {e}")))?;

        let inserted = tx
            .execute(
                "INSERT INTO events (id, provider_event_id, event_type, payload, received_at) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(provider_event_id) DO NOTHING",
                params![
                    event.id.to_string(),
                    event.provider_event_id.clone(),
                    event.event_type.clone(),
                    payload,
                    fmt_ts(event.received_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_event_with_item: event: {e}")))?;
        if inserted == 0 {
            return Ok(false);
        }

        // An error here drops the transaction and the event row with it.
        tx.execute(&insert_queue_item_sql(), item_params)
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_event_with_item: item: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_event_with_item: commit: {e}")))?;
        Ok(true)
    }

    async fn get_event(
        &self,
        provider_event_id: &str,
    ) -> Result<Option<StoredEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, provider_event_id, event_type, payload, received_at FROM events WHERE provider_event_id = ?1",
                params![provider_event_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_event: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(StoredEvent {
                id: parse_uuid(&row.get::<String>(0).unwrap_or_default())?,
                provider_event_id: row.get(1).unwrap_or_default(),
                event_type: row.get(2).unwrap_or_default(),
                payload: parse_json(&row.get::<String>(3).unwrap_or_default()),
                received_at: parse_datetime(&row.get::<String>(4).unwrap_or_default()),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_event: {e}"))),
        }
    }

    async fn upsert_contact(&self, contact: &Contact) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let ts = fmt_ts(contact.updated_at);
        self.conn()
            .execute(
                "INSERT INTO contacts (provider_id, display_name, is_group, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(provider_id) DO UPDATE SET
                    display_name = COALESCE(excluded.display_name, contacts.display_name),
                    is_group = excluded.is_group,
                    updated_at = excluded.updated_at",
                Params::Positional(vec![
                    text(contact.provider_id.clone()),
                    opt_text(contact.display_name.as_deref()),
                    int(contact.is_group as i64),
                    text(ts),
                ]),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_contact: {e}")))?;
        Ok(())
    }

    async fn get_contact(&self, provider_id: &str) -> Result<Option<Contact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT provider_id, display_name, is_group, updated_at FROM contacts WHERE provider_id = ?1",
                params![provider_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_contact: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(Contact {
                provider_id: row.get(0).unwrap_or_default(),
                display_name: row.get::<String>(1).ok(),
                is_group: row.get::<i64>(2).unwrap_or(0) != 0,
                updated_at: parse_datetime(&row.get::<String>(3).unwrap_or_default()),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_contact: {e}"))),
        }
    }

    async fn save_media(
        &self,
        reference: &str,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO media (reference, content_type, bytes, fetched_at) VALUES (?1, ?2, ?3, ?4)",
                Params::Positional(vec![
                    text(reference),
                    opt_text(content_type),
                    libsql::Value::Blob(bytes.to_vec()),
                    text(fmt_ts(Utc::now())),
                ]),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_media: {e}")))?;
        Ok(())
    }

    async fn get_media(&self, reference: &str) -> Result<Option<Vec<u8>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT bytes FROM media WHERE reference = ?1",
                params![reference],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_media: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<Vec<u8>>(0).ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_media: {e}"))),
        }
    }

    // ── Domain records ──────────────────────────────────────────────

    async fn upsert_task(&self, task: &TaskRecord) -> Result<Upsert, DatabaseError> {
        self.upsert_by_source_key(
            "upsert_task",
            "tasks",
            &task.source_key,
            &format!(
                "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) ON CONFLICT(source_key) DO NOTHING"
            ),
            vec![
                text(task.id.to_string()),
                text(task.source_key.clone()),
                text(task.owner_id.clone()),
                text(task.title.clone()),
                opt_text(task.description.as_deref()),
                text(task.status.clone()),
                opt_ts(task.due_at),
                text(fmt_ts(task.created_at)),
                text(fmt_ts(task.updated_at)),
            ],
        )
        .await
    }

    async fn upsert_note(&self, note: &NoteRecord) -> Result<Upsert, DatabaseError> {
        self.upsert_by_source_key(
            "upsert_note",
            "notes",
            &note.source_key,
            "INSERT INTO notes (id, source_key, owner_id, title, body, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) ON CONFLICT(source_key) DO NOTHING",
            vec![
                text(note.id.to_string()),
                text(note.source_key.clone()),
                text(note.owner_id.clone()),
                opt_text(note.title.as_deref()),
                text(note.body.clone()),
                text(fmt_ts(note.created_at)),
                text(fmt_ts(note.updated_at)),
            ],
        )
        .await
    }

    async fn upsert_reminder(&self, reminder: &ReminderRecord) -> Result<Upsert, DatabaseError> {
        self.upsert_by_source_key(
            "upsert_reminder",
            "reminders",
            &reminder.source_key,
            "INSERT INTO reminders (id, source_key, owner_id, chat_id, text, remind_at, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) ON CONFLICT(source_key) DO NOTHING",
            vec![
                text(reminder.id.to_string()),
                text(reminder.source_key.clone()),
                text(reminder.owner_id.clone()),
                text(reminder.chat_id.clone()),
                text(reminder.text.clone()),
                text(fmt_ts(reminder.remind_at)),
                text(reminder.status.clone()),
                text(fmt_ts(reminder.created_at)),
                text(fmt_ts(reminder.updated_at)),
            ],
        )
        .await
    }

    async fn upsert_bill(&self, bill: &BillRecord) -> Result<Upsert, DatabaseError> {
        self.upsert_by_source_key(
            "upsert_bill",
            "bills",
            &bill.source_key,
            &format!(
                "INSERT INTO bills ({BILL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) ON CONFLICT(source_key) DO NOTHING"
            ),
            vec![
                text(bill.id.to_string()),
                text(bill.source_key.clone()),
                text(bill.owner_id.clone()),
                text(bill.vendor.clone()),
                text(bill.description.clone()),
                text(bill.amount.to_string()),
                text(bill.currency.clone()),
                opt_text(bill.due_date.map(|d| d.format("%Y-%m-%d").to_string()).as_deref()),
                opt_text(bill.note.as_deref()),
                text(bill.priority.as_str()),
                text(bill.status.clone()),
                text(fmt_ts(bill.created_at)),
                text(fmt_ts(bill.updated_at)),
            ],
        )
        .await
    }

    async fn upsert_calendar_event(
        &self,
        event: &CalendarEventRecord,
    ) -> Result<Upsert, DatabaseError> {
        self.upsert_by_source_key(
            "upsert_calendar_event",
            "calendar_events",
            &event.source_key,
            &format!(
                "INSERT INTO calendar_events ({CALENDAR_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) ON CONFLICT(source_key) DO NOTHING"
            ),
            vec![
                text(event.id.to_string()),
                text(event.source_key.clone()),
                text(event.owner_id.clone()),
                text(event.title.clone()),
                text(fmt_ts(event.start_at)),
                text(fmt_ts(event.end_at)),
                int(event.all_day as i64),
                opt_text(event.location.as_deref()),
                int(event.is_virtual as i64),
                opt_text(event.meeting_link.as_deref()),
                opt_text(event.provider_event_id.as_deref()),
                text(fmt_ts(event.created_at)),
                text(fmt_ts(event.updated_at)),
            ],
        )
        .await
    }

    async fn set_calendar_provider_id(
        &self,
        id: Uuid,
        provider_event_id: &str,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE calendar_events SET provider_event_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), provider_event_id, fmt_ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_calendar_provider_id: {e}")))?;
        Ok(())
    }

    async fn get_calendar_event(
        &self,
        id: Uuid,
    ) -> Result<Option<CalendarEventRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CALENDAR_COLUMNS} FROM calendar_events WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_calendar_event: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_calendar_event(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_calendar_event: {e}"))),
        }
    }

    async fn list_calendar_events(
        &self,
        owner_id: &str,
    ) -> Result<Vec<CalendarEventRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CALENDAR_COLUMNS} FROM calendar_events WHERE owner_id = ?1 ORDER BY start_at"
                ),
                params![owner_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_calendar_events: {e}")))?;
        let mut events = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_calendar_events: {e}")))?
        {
            events.push(row_to_calendar_event(&row)?);
        }
        Ok(events)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn list_tasks(&self, owner_id: &str) -> Result<Vec<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE owner_id = ?1 ORDER BY created_at"),
                params![owner_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;
        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn list_bills(&self, owner_id: &str) -> Result<Vec<BillRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {BILL_COLUMNS} FROM bills WHERE owner_id = ?1 ORDER BY created_at, rowid"
                ),
                params![owner_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_bills: {e}")))?;
        let mut bills = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_bills: {e}")))?
        {
            bills.push(row_to_bill(&row)?);
        }
        Ok(bills)
    }

    async fn count_entities(&self, kind: EntityKind) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(&format!("SELECT COUNT(*) FROM {}", kind.table()), ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_entities: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_entities: {e}"))),
        }
    }

    async fn update_entity(
        &self,
        kind: EntityKind,
        id: Uuid,
        changes: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<bool, DatabaseError> {
        if changes.is_empty() {
            return Err(DatabaseError::Constraint(format!(
                "update of {kind} {id} has no changes"
            )));
        }
        let allowed = kind.updatable_columns();
        let mut assignments = Vec::with_capacity(changes.len() + 1);
        let mut values = vec![text(id.to_string())];
        for (column, value) in changes {
            // Column names come from a fixed whitelist, never from input.
            let Some(column) = allowed.iter().find(|c| **c == column.as_str()) else {
                return Err(DatabaseError::Constraint(format!(
                    "column '{column}' cannot be updated on {kind}"
                )));
            };
            values.push(json_to_column(value));
            assignments.push(format!("{column} = ?{}", values.len()));
        }
        values.push(text(fmt_ts(Utc::now())));
        assignments.push(format!("updated_at = ?{}", values.len()));

        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                &format!(
                    "UPDATE {} SET {} WHERE id = ?1",
                    kind.table(),
                    assignments.join(", ")
                ),
                Params::Positional(values),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_entity: {e}")))?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::source_key;
    use crate::nlp::BillPriority;
    use crate::rules::{ConditionOperator, WebhookMethod};
    use rust_decimal_macros::dec;
    use serde_json::json;

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn sample_rule() -> Rule {
        Rule::new("calendar from reaction", "owner-1", TriggerType::Reaction)
            .with_allowed_values(["📅"])
            .with_performer(PerformerFilter::Owner)
            .with_priority(10)
            .with_condition(Condition::new(
                1,
                "quoted.content",
                ConditionOperator::Contains,
                "hoy",
            ))
            .with_condition(
                Condition::new(2, "chat.is_group", ConditionOperator::Equals, true).negated(),
            )
            .with_action(Action::new(
                1,
                ActionParams::CreateEvent {
                    title: None,
                    sync: true,
                },
            ))
            .with_action(
                Action::new(
                    2,
                    ActionParams::CallWebhook {
                        url: "https://hooks.example.com/x".into(),
                        method: WebhookMethod::Put,
                        body: None,
                    },
                )
                .when(Expr::parse("actions.1.status == 'succeeded'").unwrap())
                .with_failure_policy(FailurePolicy::Continue),
            )
    }

    #[tokio::test]
    async fn rule_roundtrip_keeps_children() {
        let db = backend().await;
        let rule = sample_rule();
        db.save_rule(&rule).await.unwrap();

        let loaded = db.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, rule.name);
        assert_eq!(loaded.performer, PerformerFilter::Owner);
        assert_eq!(loaded.trigger_config.allowed_values, vec!["📅".to_string()]);
        assert_eq!(loaded.conditions, rule.conditions);
        assert_eq!(loaded.actions.len(), 2);
        assert_eq!(loaded.actions[1].condition, rule.actions[1].condition);
        assert_eq!(
            loaded.actions[1].on_failure,
            Some(FailurePolicy::Continue)
        );
        assert_eq!(loaded.actions[1].params, rule.actions[1].params);
    }

    #[tokio::test]
    async fn save_rule_replaces_children() {
        let db = backend().await;
        let mut rule = sample_rule();
        db.save_rule(&rule).await.unwrap();

        rule.actions.truncate(1);
        rule.conditions.clear();
        db.save_rule(&rule).await.unwrap();

        let loaded = db.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(loaded.actions.len(), 1);
        assert!(loaded.conditions.is_empty());
    }

    #[tokio::test]
    async fn malformed_action_row_skips_rule() {
        let db = backend().await;
        let good = Rule::new("good", "o", TriggerType::IncomingMessage);
        let bad = sample_rule();
        let mut bad = bad;
        bad.trigger_type = TriggerType::IncomingMessage;
        bad.trigger_config.allowed_values.clear();
        db.save_rule(&good).await.unwrap();
        db.save_rule(&bad).await.unwrap();

        db.conn()
            .execute(
                "UPDATE rule_actions SET condition_expr = 'actions.1.status ==' WHERE rule_id = ?1 AND position = 2",
                params![bad.id.to_string()],
            )
            .await
            .unwrap();

        let rules = db
            .list_active_rules(TriggerType::IncomingMessage)
            .await
            .unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "good");
        assert!(db.get_rule(bad.id).await.is_err());
    }

    #[tokio::test]
    async fn record_execution_updates_counters_atomically() {
        let db = backend().await;
        let rule = sample_rule();
        db.save_rule(&rule).await.unwrap();

        for status in [
            ExecutionStatus::Success,
            ExecutionStatus::Partial,
            ExecutionStatus::Failed,
            ExecutionStatus::Skipped,
        ] {
            let record = ExecutionRecord::new(rule.id, None, json!({}), status);
            db.record_execution(&record).await.unwrap();
        }

        let loaded = db.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(loaded.execution_count, 4);
        assert_eq!(loaded.success_count, 1);
        assert_eq!(loaded.failure_count, 2);
        assert!(loaded.last_executed_at.is_some());
        assert_eq!(db.list_executions(rule.id, 10).await.unwrap().len(), 4);

        // Saving the rule again leaves ledger counters alone.
        db.save_rule(&rule).await.unwrap();
        let reloaded = db.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(reloaded.execution_count, 4);
    }

    #[tokio::test]
    async fn record_execution_for_unknown_rule_leaves_no_row() {
        let db = backend().await;
        let orphan = Uuid::new_v4();
        let record = ExecutionRecord::new(orphan, None, json!({}), ExecutionStatus::Success);
        assert!(matches!(
            db.record_execution(&record).await,
            Err(DatabaseError::NotFound { .. })
        ));
        assert!(db.list_executions(orphan, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn event_and_item_are_stored_together_once() {
        let db = backend().await;
        let event = StoredEvent {
            id: Uuid::new_v4(),
            provider_event_id: "wamid.1".into(),
            event_type: "message.created".into(),
            payload: json!({ "content": "hola" }),
            received_at: Utc::now(),
        };
        let item = QueueItem::new("message.created", json!({}), 3);
        assert!(db.insert_event_with_item(&event, &item).await.unwrap());

        let again = StoredEvent {
            id: Uuid::new_v4(),
            ..event.clone()
        };
        let second = QueueItem::new("message.created", json!({}), 3);
        assert!(!db.insert_event_with_item(&again, &second).await.unwrap());
        assert_eq!(db.get_event("wamid.1").await.unwrap().unwrap().id, event.id);
        assert!(db.get_queue_item(second.id).await.unwrap().is_none());
        assert_eq!(db.queue_stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn failed_enqueue_leaves_event_unrecorded() {
        let db = backend().await;
        let taken = QueueItem::new("message.created", json!({}), 3);
        db.insert_queue_item(&taken).await.unwrap();

        let event = StoredEvent {
            id: Uuid::new_v4(),
            provider_event_id: "wamid.2".into(),
            event_type: "message.created".into(),
            payload: json!({}),
            received_at: Utc::now(),
        };
        // Reusing an item id makes the queue insert fail after the event insert.
        assert!(db.insert_event_with_item(&event, &taken).await.is_err());
        assert!(db.get_event("wamid.2").await.unwrap().is_none());

        // The redelivery is accepted and queued.
        let fresh = QueueItem::new("message.created", json!({}), 3);
        assert!(db.insert_event_with_item(&event, &fresh).await.unwrap());
        assert!(db.get_queue_item(fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn contact_upsert_keeps_known_name() {
        let db = backend().await;
        let mut contact = Contact {
            provider_id: "569123".into(),
            display_name: Some("Lisi".into()),
            is_group: false,
            updated_at: Utc::now(),
        };
        db.upsert_contact(&contact).await.unwrap();
        contact.display_name = None;
        db.upsert_contact(&contact).await.unwrap();
        let loaded = db.get_contact("569123").await.unwrap().unwrap();
        assert_eq!(loaded.display_name.as_deref(), Some("Lisi"));
    }

    #[tokio::test]
    async fn domain_upsert_is_idempotent_on_source_key() {
        let db = backend().await;
        let key = source_key("evt-1", Uuid::nil(), 1, 0);
        let bill = BillRecord {
            id: Uuid::new_v4(),
            source_key: key.clone(),
            owner_id: "owner".into(),
            vendor: "tarjeta lisi".into(),
            description: "tarjeta lisi".into(),
            amount: dec!(80120),
            currency: "CLP".into(),
            due_date: NaiveDate::from_ymd_opt(2026, 6, 7),
            note: None,
            priority: BillPriority::High,
            status: "pending".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let first = db.upsert_bill(&bill).await.unwrap();
        assert!(first.created);
        let second = db
            .upsert_bill(&BillRecord {
                id: Uuid::new_v4(),
                ..bill.clone()
            })
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.id, first.id);
        assert_eq!(db.count_entities(EntityKind::Bill).await.unwrap(), 1);

        let stored = db.list_bills("owner").await.unwrap();
        assert_eq!(stored[0].amount, dec!(80120));
        assert_eq!(stored[0].priority, BillPriority::High);
    }

    #[tokio::test]
    async fn update_entity_uses_whitelist() {
        let db = backend().await;
        let task = TaskRecord::new(source_key("e", Uuid::nil(), 1, 0), "owner", "Llamar");
        let up = db.upsert_task(&task).await.unwrap();

        let mut changes = serde_json::Map::new();
        changes.insert("status".into(), json!("done"));
        assert!(db.update_entity(EntityKind::Task, up.id, &changes).await.unwrap());
        assert_eq!(db.get_task(up.id).await.unwrap().unwrap().status, "done");

        let mut bad = serde_json::Map::new();
        bad.insert("owner_id".into(), json!("mallory"));
        assert!(matches!(
            db.update_entity(EntityKind::Task, up.id, &bad).await,
            Err(DatabaseError::Constraint(_))
        ));
        assert!(!db
            .update_entity(EntityKind::Task, Uuid::new_v4(), &changes)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn media_roundtrip() {
        let db = backend().await;
        db.save_media("media-1", Some("image/jpeg"), &[1, 2, 3])
            .await
            .unwrap();
        assert_eq!(db.get_media("media-1").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(db.get_media("missing").await.unwrap(), None);
    }
}
