//! Domain records created or updated by rule actions.
//!
//! Every record carries a `source_key` derived from the event, rule, action
//! and entity index that produced it. Storage upserts on that key, so a
//! re-delivered event never produces a second record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::nlp::BillPriority;

/// Kinds of record an action can touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Note,
    Reminder,
    Bill,
    CalendarEvent,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::Note => "note",
            EntityKind::Reminder => "reminder",
            EntityKind::Bill => "bill",
            EntityKind::CalendarEvent => "calendar_event",
        }
    }

    /// Backing table.
    pub(crate) fn table(&self) -> &'static str {
        match self {
            EntityKind::Task => "tasks",
            EntityKind::Note => "notes",
            EntityKind::Reminder => "reminders",
            EntityKind::Bill => "bills",
            EntityKind::CalendarEvent => "calendar_events",
        }
    }

    /// Columns an update-entity action may change.
    pub(crate) fn updatable_columns(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Task => &["title", "description", "status", "due_at"],
            EntityKind::Note => &["title", "body"],
            EntityKind::Reminder => &["text", "remind_at", "status"],
            EntityKind::Bill => &["vendor", "amount", "due_date", "note", "priority", "status"],
            EntityKind::CalendarEvent => &["title", "start_at", "end_at", "location"],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(EntityKind::Task),
            "note" => Ok(EntityKind::Note),
            "reminder" => Ok(EntityKind::Reminder),
            "bill" => Ok(EntityKind::Bill),
            "calendar_event" | "event" => Ok(EntityKind::CalendarEvent),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// Build the idempotency key for a record produced by an action.
pub fn source_key(event_id: &str, rule_id: Uuid, action_order: i32, entity_index: usize) -> String {
    format!("{event_id}:{rule_id}:{action_order}:{entity_index}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub source_key: String,
    pub owner_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(source_key: String, owner_id: &str, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_key,
            owner_id: owner_id.to_string(),
            title: title.into(),
            description: None,
            status: "open".into(),
            due_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub id: Uuid,
    pub source_key: String,
    pub owner_id: String,
    pub title: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NoteRecord {
    pub fn new(source_key: String, owner_id: &str, body: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_key,
            owner_id: owner_id.to_string(),
            title: None,
            body: body.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderRecord {
    pub id: Uuid,
    pub source_key: String,
    pub owner_id: String,
    /// Chat the reminder is delivered to.
    pub chat_id: String,
    pub text: String,
    pub remind_at: DateTime<Utc>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillRecord {
    pub id: Uuid,
    pub source_key: String,
    pub owner_id: String,
    pub vendor: String,
    pub description: String,
    pub amount: Decimal,
    pub currency: String,
    pub due_date: Option<NaiveDate>,
    pub note: Option<String>,
    pub priority: BillPriority,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEventRecord {
    pub id: Uuid,
    pub source_key: String,
    pub owner_id: String,
    pub title: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub all_day: bool,
    pub location: Option<String>,
    pub is_virtual: bool,
    pub meeting_link: Option<String>,
    /// Set once the calendar provider has accepted the event.
    pub provider_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_roundtrip() {
        for kind in [
            EntityKind::Task,
            EntityKind::Note,
            EntityKind::Reminder,
            EntityKind::Bill,
            EntityKind::CalendarEvent,
        ] {
            assert_eq!(kind.to_string().parse::<EntityKind>().unwrap(), kind);
        }
        assert_eq!("event".parse::<EntityKind>().unwrap(), EntityKind::CalendarEvent);
    }

    #[test]
    fn source_key_is_stable() {
        let rule = Uuid::nil();
        assert_eq!(source_key("evt-1", rule, 2, 0), source_key("evt-1", rule, 2, 0));
        assert_ne!(source_key("evt-1", rule, 2, 0), source_key("evt-1", rule, 2, 1));
    }

    #[test]
    fn updatable_columns_exclude_identity() {
        for kind in [EntityKind::Task, EntityKind::Bill, EntityKind::CalendarEvent] {
            let cols = kind.updatable_columns();
            assert!(!cols.contains(&"id"));
            assert!(!cols.contains(&"source_key"));
            assert!(!cols.contains(&"owner_id"));
        }
    }
}
