//! Typed queue payloads.
//!
//! Every queue item carries one [`QueueEvent`] serialized as JSON. The
//! processor decodes it, derives the trigger type/value and the match
//! context, and hands it to the rule engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::entities::EntityKind;
use crate::rules::{MatchContext, TriggerType};

/// Reference to provider-hosted media attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub reference: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// A chat message as delivered by the messaging provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Provider event id.
    pub event_id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub media: Option<MediaRef>,
    pub sent_at: DateTime<Utc>,
}

/// The message a reaction was applied to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotedMessage {
    pub message_id: String,
    pub sender_id: String,
    pub content: String,
}

/// An emoji reaction applied to an earlier message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionEvent {
    pub event_id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub emoji: String,
    pub quoted: QuotedMessage,
    pub sent_at: DateTime<Utc>,
}

/// Whether a domain record was created or changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
        }
    }
}

/// Payload of one queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueEvent {
    Message(MessageEvent),
    Reaction(ReactionEvent),
    /// A schedule rule came due.
    Schedule {
        rule_id: Uuid,
        fired_at: DateTime<Utc>,
    },
    /// An explicit request to run one rule.
    Manual {
        request_id: Uuid,
        rule_id: Uuid,
        actor: String,
    },
    /// Arbitrary JSON posted to `/webhook/rules/{path}`.
    Webhook {
        event_id: String,
        path: String,
        body: serde_json::Value,
    },
    /// A rule action created or updated a domain record.
    EntityChange {
        change_id: Uuid,
        entity: EntityKind,
        entity_id: Uuid,
        change: ChangeKind,
        actor: String,
        /// Rule whose action produced the change.
        rule_id: Uuid,
    },
}

impl QueueEvent {
    /// Stable id used for idempotency keys of records produced from this event.
    pub fn event_id(&self) -> String {
        match self {
            QueueEvent::Message(m) => m.event_id.clone(),
            QueueEvent::Reaction(r) => r.event_id.clone(),
            QueueEvent::Schedule { rule_id, fired_at } => {
                format!("schedule:{rule_id}:{}", fired_at.timestamp())
            }
            QueueEvent::Manual { request_id, .. } => format!("manual:{request_id}"),
            QueueEvent::Webhook { event_id, .. } => event_id.clone(),
            QueueEvent::EntityChange { change_id, .. } => format!("change:{change_id}"),
        }
    }

    /// Queue `event_type` column value.
    pub fn event_type(&self) -> &'static str {
        match self {
            QueueEvent::Message(_) => "message.created",
            QueueEvent::Reaction(_) => "reaction.added",
            QueueEvent::Schedule { .. } => "schedule.fired",
            QueueEvent::Manual { .. } => "rule.manual",
            QueueEvent::Webhook { .. } => "webhook.received",
            QueueEvent::EntityChange { .. } => "entity.changed",
        }
    }

    pub fn trigger_type(&self) -> TriggerType {
        match self {
            QueueEvent::Message(_) => TriggerType::IncomingMessage,
            QueueEvent::Reaction(_) => TriggerType::Reaction,
            QueueEvent::Schedule { .. } => TriggerType::Schedule,
            QueueEvent::Manual { .. } => TriggerType::Manual,
            QueueEvent::Webhook { .. } => TriggerType::Webhook,
            QueueEvent::EntityChange { .. } => TriggerType::EntityChange,
        }
    }

    /// Value compared against a rule's allowed-value list.
    pub fn trigger_value(&self) -> String {
        match self {
            QueueEvent::Message(m) => m.chat_id.clone(),
            QueueEvent::Reaction(r) => r.emoji.clone(),
            QueueEvent::Schedule { rule_id, .. } | QueueEvent::Manual { rule_id, .. } => {
                rule_id.to_string()
            }
            QueueEvent::Webhook { path, .. } => path.clone(),
            QueueEvent::EntityChange { entity, .. } => entity.as_str().to_string(),
        }
    }

    /// Rule addressed directly, bypassing trigger-type lookup.
    pub fn target_rule(&self) -> Option<Uuid> {
        match self {
            QueueEvent::Schedule { rule_id, .. } | QueueEvent::Manual { rule_id, .. } => {
                Some(*rule_id)
            }
            _ => None,
        }
    }

    /// Identity that caused the event. `None` for schedule firings, which act
    /// on behalf of the rule owner.
    pub fn actor(&self) -> Option<&str> {
        match self {
            QueueEvent::Message(m) => Some(&m.sender_id),
            QueueEvent::Reaction(r) => Some(&r.sender_id),
            QueueEvent::Manual { actor, .. } | QueueEvent::EntityChange { actor, .. } => {
                Some(actor)
            }
            QueueEvent::Webhook { .. } => Some("webhook"),
            QueueEvent::Schedule { .. } => None,
        }
    }

    /// Free text that extraction runs over.
    pub fn source_text(&self) -> Option<&str> {
        match self {
            QueueEvent::Message(m) => Some(&m.content),
            QueueEvent::Reaction(r) => Some(&r.quoted.content),
            QueueEvent::Webhook { body, .. } => body.get("text").and_then(|v| v.as_str()),
            _ => None,
        }
    }

    /// Chat that replies and clarifications go to.
    pub fn reply_target(&self) -> Option<&str> {
        match self {
            QueueEvent::Message(m) => Some(&m.chat_id),
            QueueEvent::Reaction(r) => Some(&r.chat_id),
            _ => None,
        }
    }

    /// Reference instant for relative date expressions.
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        match self {
            QueueEvent::Message(m) => Some(m.sent_at),
            QueueEvent::Reaction(r) => Some(r.sent_at),
            QueueEvent::Schedule { fired_at, .. } => Some(*fired_at),
            _ => None,
        }
    }

    pub fn is_entity_change(&self) -> bool {
        matches!(self, QueueEvent::EntityChange { .. })
    }

    /// Flattened fields that conditions and templates address.
    pub fn fields(&self) -> serde_json::Value {
        let mut fields = match self {
            QueueEvent::Message(m) => json!({
                "chat_id": m.chat_id,
                "sender_id": m.sender_id,
                "sender_name": m.sender_name.as_deref().unwrap_or(&m.sender_id),
                "content": m.content,
                "is_group": m.is_group,
                "has_media": m.media.is_some(),
                "sent_at": m.sent_at.to_rfc3339(),
            }),
            QueueEvent::Reaction(r) => json!({
                "chat_id": r.chat_id,
                "sender_id": r.sender_id,
                "sender_name": r.sender_name.as_deref().unwrap_or(&r.sender_id),
                "emoji": r.emoji,
                "content": r.quoted.content,
                "quoted": {
                    "message_id": r.quoted.message_id,
                    "sender_id": r.quoted.sender_id,
                    "content": r.quoted.content,
                },
                "sent_at": r.sent_at.to_rfc3339(),
            }),
            QueueEvent::Schedule { rule_id, fired_at } => json!({
                "rule_id": rule_id,
                "fired_at": fired_at.to_rfc3339(),
            }),
            QueueEvent::Manual { rule_id, actor, .. } => json!({
                "rule_id": rule_id,
                "actor": actor,
            }),
            QueueEvent::Webhook { path, body, .. } => json!({
                "path": path,
                "body": body,
                "content": body.get("text").cloned().unwrap_or(serde_json::Value::Null),
            }),
            QueueEvent::EntityChange {
                entity,
                entity_id,
                change,
                actor,
                rule_id,
                ..
            } => json!({
                "entity": entity.as_str(),
                "entity_id": entity_id,
                "change": change.as_str(),
                "actor": actor,
                "source_rule_id": rule_id,
            }),
        };
        if let serde_json::Value::Object(map) = &mut fields {
            map.insert("event_type".into(), json!(self.event_type()));
            map.insert("event_id".into(), json!(self.event_id()));
        }
        fields
    }

    /// Match context for rule selection. `fallback_actor` stands in when the
    /// event carries no actor of its own.
    pub fn match_context(&self, fallback_actor: &str) -> MatchContext {
        MatchContext::new(self.actor().unwrap_or(fallback_actor), self.fields())
    }
}
