//! Schema migrations for the libSQL backend.
//!
//! Versions are recorded in `_migrations`; each pending version is applied
//! together with its version row in one transaction, so a crash mid-way
//! leaves the schema at the previous version.

use libsql::Connection;
use tracing::{debug, info};

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "queue_and_rules",
        sql: r#"
            CREATE TABLE IF NOT EXISTS queue_items (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                last_error TEXT,
                created_at TEXT NOT NULL,
                claimed_at TEXT,
                claimed_by TEXT,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_queue_items_status_created
                ON queue_items(status, created_at);

            CREATE TABLE IF NOT EXISTS rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                trigger_type TEXT NOT NULL,
                trigger_config TEXT NOT NULL DEFAULT '{}',
                performer TEXT NOT NULL DEFAULT '{"type":"anyone"}',
                priority INTEGER NOT NULL DEFAULT 100,
                execution_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                last_executed_at TEXT,
                next_fire_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rules_trigger
                ON rules(trigger_type, active, priority, created_at);

            CREATE TABLE IF NOT EXISTS rule_conditions (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
                condition_group INTEGER NOT NULL DEFAULT 0,
                group_operator TEXT NOT NULL DEFAULT 'and',
                operator TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                negate INTEGER NOT NULL DEFAULT 0,
                position INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rule_conditions_rule ON rule_conditions(rule_id);

            CREATE TABLE IF NOT EXISTS rule_actions (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                action_type TEXT NOT NULL,
                params TEXT NOT NULL DEFAULT '{}',
                is_conditional INTEGER NOT NULL DEFAULT 0,
                condition_expr TEXT,
                max_attempts INTEGER NOT NULL DEFAULT 1,
                on_failure TEXT,
                UNIQUE(rule_id, position)
            );

            CREATE TABLE IF NOT EXISTS rule_executions (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL,
                queue_item_id TEXT,
                trigger_payload TEXT NOT NULL,
                result TEXT NOT NULL,
                status TEXT NOT NULL,
                actions_executed INTEGER NOT NULL DEFAULT 0,
                actions_failed INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rule_executions_rule
                ON rule_executions(rule_id, created_at DESC);
        "#,
    },
    Migration {
        version: 2,
        name: "ingestion",
        sql: r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                provider_event_id TEXT NOT NULL UNIQUE,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                received_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS contacts (
                provider_id TEXT PRIMARY KEY,
                display_name TEXT,
                is_group INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS media (
                reference TEXT PRIMARY KEY,
                content_type TEXT,
                bytes BLOB NOT NULL,
                fetched_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 3,
        name: "domain_records",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                source_key TEXT NOT NULL UNIQUE,
                owner_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'open',
                due_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner_id);

            CREATE TABLE IF NOT EXISTS notes (
                id TEXT PRIMARY KEY,
                source_key TEXT NOT NULL UNIQUE,
                owner_id TEXT NOT NULL,
                title TEXT,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reminders (
                id TEXT PRIMARY KEY,
                source_key TEXT NOT NULL UNIQUE,
                owner_id TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                text TEXT NOT NULL,
                remind_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'scheduled',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS bills (
                id TEXT PRIMARY KEY,
                source_key TEXT NOT NULL UNIQUE,
                owner_id TEXT NOT NULL,
                vendor TEXT NOT NULL,
                description TEXT NOT NULL,
                amount TEXT NOT NULL,
                currency TEXT NOT NULL,
                due_date TEXT,
                note TEXT,
                priority TEXT NOT NULL DEFAULT 'normal',
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bills_owner ON bills(owner_id);

            CREATE TABLE IF NOT EXISTS calendar_events (
                id TEXT PRIMARY KEY,
                source_key TEXT NOT NULL UNIQUE,
                owner_id TEXT NOT NULL,
                title TEXT NOT NULL,
                start_at TEXT NOT NULL,
                end_at TEXT NOT NULL,
                all_day INTEGER NOT NULL DEFAULT 0,
                location TEXT,
                is_virtual INTEGER NOT NULL DEFAULT 0,
                meeting_link TEXT,
                provider_event_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_calendar_events_owner ON calendar_events(owner_id);
        "#,
    },
    Migration {
        version: 4,
        name: "execution_item_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_rule_executions_item
                ON rule_executions(rule_id, queue_item_id);
        "#,
    },
];

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

fn migration_error(context: impl std::fmt::Display, e: libsql::Error) -> DatabaseError {
    DatabaseError::Migration(format!("{context}: {e}"))
}

/// Bring the schema up to the latest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(VERSION_TABLE, ())
        .await
        .map_err(|e| migration_error("create _migrations", e))?;

    let applied = applied_version(conn).await?;
    let mut latest = applied;
    for migration in MIGRATIONS.iter().filter(|m| m.version > applied) {
        apply(conn, migration).await?;
        latest = migration.version;
    }
    debug!(from = applied, to = latest, "Schema up to date");
    Ok(())
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    let label = format!("V{} ({})", migration.version, migration.name);
    info!(version = migration.version, name = migration.name, "Applying migration");

    let tx = conn
        .transaction()
        .await
        .map_err(|e| migration_error(&label, e))?;
    tx.execute_batch(migration.sql)
        .await
        .map_err(|e| migration_error(&label, e))?;
    tx.execute(
        "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![migration.version, migration.name],
    )
    .await
    .map_err(|e| migration_error(&label, e))?;
    tx.commit().await.map_err(|e| migration_error(&label, e))
}

async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| migration_error("read schema version", e))?;
    match rows
        .next()
        .await
        .map_err(|e| migration_error("read schema version", e))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| migration_error("read schema version", e)),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_conn() -> Connection {
        libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap()
            .connect()
            .unwrap()
    }

    async fn recorded_versions(conn: &Connection) -> Vec<(i64, String)> {
        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            out.push((row.get(0).unwrap(), row.get(1).unwrap()));
        }
        out
    }

    #[tokio::test]
    async fn fresh_database_gets_every_table() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();

        let expected = [
            "queue_items",
            "rules",
            "rule_conditions",
            "rule_actions",
            "rule_executions",
            "events",
            "contacts",
            "media",
            "tasks",
            "notes",
            "reminders",
            "bills",
            "calendar_events",
        ];
        let mut rows = conn
            .query("SELECT name FROM sqlite_master WHERE type = 'table'", ())
            .await
            .unwrap();
        let mut present = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            present.push(row.get::<String>(0).unwrap());
        }
        for table in expected {
            assert!(present.iter().any(|t| t == table), "missing table {table}");
        }
    }

    #[tokio::test]
    async fn rerun_applies_nothing_new() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        assert_eq!(applied_version(&conn).await.unwrap(), 4);
        assert_eq!(
            recorded_versions(&conn).await,
            vec![
                (1, "queue_and_rules".to_string()),
                (2, "ingestion".to_string()),
                (3, "domain_records".to_string()),
                (4, "execution_item_index".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn action_order_unique_per_rule() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();
        conn.execute(
            "INSERT INTO rules (id, name, owner_id, trigger_type, created_at, updated_at) VALUES ('r1', 'n', 'o', 'manual', 't', 't')",
            (),
        )
        .await
        .unwrap();
        conn.execute(
            "INSERT INTO rule_actions (id, rule_id, position, action_type) VALUES ('a1', 'r1', 1, 'create_task')",
            (),
        )
        .await
        .unwrap();
        let dup = conn
            .execute(
                "INSERT INTO rule_actions (id, rule_id, position, action_type) VALUES ('a2', 'r1', 1, 'create_note')",
                (),
            )
            .await;
        assert!(dup.is_err());
    }
}
