//! Event ingestion front door.
//!
//! `POST /webhook/events` accepts provider events (message, reaction);
//! `POST /webhook/rules/{path}` accepts arbitrary JSON for webhook rules.
//! Each accepted event is validated, persisted (idempotent on the provider
//! event id), enqueued, and acknowledged. Nothing downstream of the queue
//! runs on the request path.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::MessagingTransport;
use crate::error::IngestError;
use crate::pipeline::types::{MessageEvent, QueueEvent, ReactionEvent};
use crate::queue::ActionQueue;
use crate::store::{Contact, Database, StoredEvent};

/// Upper bound for producing an acknowledgment.
const ACK_BUDGET: Duration = Duration::from_millis(4500);

/// Provider event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Message(MessageEvent),
    Reaction(ReactionEvent),
}

impl InboundEvent {
    /// Shape checks serde cannot express.
    pub fn validate(&self) -> Result<(), IngestError> {
        let require = |value: &str, field: &str| {
            if value.trim().is_empty() {
                Err(IngestError::Invalid(format!("{field} is empty")))
            } else {
                Ok(())
            }
        };
        match self {
            InboundEvent::Message(m) => {
                require(&m.event_id, "event_id")?;
                require(&m.chat_id, "chat_id")?;
                require(&m.sender_id, "sender_id")?;
                if m.content.trim().is_empty() && m.media.is_none() {
                    return Err(IngestError::Invalid("message has neither content nor media".into()));
                }
            }
            InboundEvent::Reaction(r) => {
                require(&r.event_id, "event_id")?;
                require(&r.chat_id, "chat_id")?;
                require(&r.sender_id, "sender_id")?;
                require(&r.emoji, "emoji")?;
                require(&r.quoted.message_id, "quoted.message_id")?;
            }
        }
        Ok(())
    }

    pub fn into_queue_event(self) -> QueueEvent {
        match self {
            InboundEvent::Message(m) => QueueEvent::Message(m),
            InboundEvent::Reaction(r) => QueueEvent::Reaction(r),
        }
    }
}

/// Result of one ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted { queue_item_id: Uuid },
    /// Already stored; nothing enqueued.
    Duplicate,
}

/// Persists and enqueues inbound events.
#[derive(Clone)]
pub struct EventIngestor {
    store: Arc<dyn Database>,
    queue: ActionQueue,
    messaging: Option<Arc<dyn MessagingTransport>>,
}

impl EventIngestor {
    pub fn new(
        store: Arc<dyn Database>,
        queue: ActionQueue,
        messaging: Option<Arc<dyn MessagingTransport>>,
    ) -> Self {
        Self {
            store,
            queue,
            messaging,
        }
    }

    /// Store `event` unless already seen, then enqueue it.
    pub async fn ingest(
        &self,
        event: QueueEvent,
        raw: serde_json::Value,
    ) -> Result<IngestOutcome, IngestError> {
        self.upsert_contacts(&event).await?;

        let stored = StoredEvent {
            id: Uuid::new_v4(),
            provider_event_id: event.event_id(),
            event_type: event.event_type().to_string(),
            payload: raw,
            received_at: Utc::now(),
        };
        let Some(queue_item_id) = self.queue.enqueue_received(&stored, &event).await? else {
            debug!(event_id = %stored.provider_event_id, "Duplicate event ignored");
            return Ok(IngestOutcome::Duplicate);
        };
        info!(
            event_id = %stored.provider_event_id,
            event_type = %stored.event_type,
            item_id = %queue_item_id,
            "Event ingested"
        );

        if let QueueEvent::Message(MessageEvent {
            media: Some(media), ..
        }) = &event
        {
            self.fetch_media(media.reference.clone(), media.mime_type.clone());
        }

        Ok(IngestOutcome::Accepted { queue_item_id })
    }

    async fn upsert_contacts(&self, event: &QueueEvent) -> Result<(), IngestError> {
        let (sender_id, sender_name, chat_id, is_group) = match event {
            QueueEvent::Message(m) => (&m.sender_id, &m.sender_name, &m.chat_id, m.is_group),
            QueueEvent::Reaction(r) => (&r.sender_id, &r.sender_name, &r.chat_id, false),
            _ => return Ok(()),
        };
        let now = Utc::now();
        self.store
            .upsert_contact(&Contact {
                provider_id: sender_id.clone(),
                display_name: sender_name.clone(),
                is_group: false,
                updated_at: now,
            })
            .await?;
        if is_group {
            self.store
                .upsert_contact(&Contact {
                    provider_id: chat_id.clone(),
                    display_name: None,
                    is_group: true,
                    updated_at: now,
                })
                .await?;
        }
        Ok(())
    }

    /// Download provider media in the background so the ack is not delayed.
    fn fetch_media(&self, reference: String, mime_type: Option<String>) {
        let Some(messaging) = self.messaging.clone() else {
            return;
        };
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            match messaging.download_media(&reference).await {
                Ok(blob) => {
                    let content_type = blob.content_type.or(mime_type);
                    if let Err(e) = store
                        .save_media(&reference, content_type.as_deref(), &blob.bytes)
                        .await
                    {
                        warn!(reference = %reference, error = %e, "Failed to store media");
                    } else {
                        debug!(reference = %reference, bytes = blob.bytes.len(), "Media stored");
                    }
                }
                Err(e) => warn!(reference = %reference, error = %e, "Media download failed"),
            }
        });
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = match &self {
            IngestError::Invalid(_) => StatusCode::BAD_REQUEST,
            IngestError::Database(_) | IngestError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn ack(outcome: IngestOutcome, event_id: &str) -> Response {
    match outcome {
        IngestOutcome::Accepted { queue_item_id } => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "accepted",
                "event_id": event_id,
                "queue_item_id": queue_item_id,
            })),
        )
            .into_response(),
        IngestOutcome::Duplicate => (
            StatusCode::OK,
            Json(json!({ "status": "duplicate", "event_id": event_id })),
        )
            .into_response(),
    }
}

async fn within_budget(
    ingestor: &EventIngestor,
    event: QueueEvent,
    raw: serde_json::Value,
) -> Response {
    let event_id = event.event_id();
    match tokio::time::timeout(ACK_BUDGET, ingestor.ingest(event, raw)).await {
        Ok(Ok(outcome)) => ack(outcome, &event_id),
        Ok(Err(e)) => {
            warn!(event_id = %event_id, error = %e, "Ingestion failed");
            e.into_response()
        }
        Err(_) => {
            warn!(event_id = %event_id, "Ingestion exceeded ack budget");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "ingestion timed out, retry delivery" })),
            )
                .into_response()
        }
    }
}

/// POST /webhook/events
async fn post_event(
    State(ingestor): State<EventIngestor>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let inbound: InboundEvent = match serde_json::from_value(body.clone()) {
        Ok(inbound) => inbound,
        Err(e) => return IngestError::Invalid(e.to_string()).into_response(),
    };
    if let Err(e) = inbound.validate() {
        return e.into_response();
    }
    within_budget(&ingestor, inbound.into_queue_event(), body).await
}

/// POST /webhook/rules/{path}
///
/// The idempotency key comes from the `X-Event-Id` header or an `event_id`
/// body field; without either every delivery is a new event.
async fn post_rule_webhook(
    State(ingestor): State<EventIngestor>,
    Path(path): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let delivery_id = headers
        .get("x-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| body.get("event_id").and_then(|v| v.as_str()).map(str::to_string))
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let event = QueueEvent::Webhook {
        event_id: format!("webhook:{path}:{delivery_id}"),
        path,
        body: body.clone(),
    };
    within_budget(&ingestor, event, body).await
}

/// Build the ingestion routes.
pub fn ingest_routes(ingestor: EventIngestor) -> Router {
    Router::new()
        .route("/webhook/events", post(post_event))
        .route("/webhook/rules/{path}", post(post_rule_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(ingestor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{MediaRef, QuotedMessage};
    use crate::store::LibSqlBackend;

    async fn ingestor() -> (Arc<LibSqlBackend>, EventIngestor) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = ActionQueue::new(store.clone(), 3);
        (store.clone(), EventIngestor::new(store, queue, None))
    }

    fn message(event_id: &str) -> MessageEvent {
        MessageEvent {
            event_id: event_id.into(),
            chat_id: "group-1".into(),
            sender_id: "u-1".into(),
            sender_name: Some("Ana".into()),
            content: "Luz 25.000".into(),
            is_group: true,
            media: None,
            sent_at: Utc::now(),
        }
    }

    #[test]
    fn validation_rejects_empty_fields() {
        let mut m = message("e-1");
        m.content = " ".into();
        assert!(InboundEvent::Message(m.clone()).validate().is_err());
        m.media = Some(MediaRef {
            reference: "media-1".into(),
            mime_type: None,
        });
        assert!(InboundEvent::Message(m).validate().is_ok());

        let r = ReactionEvent {
            event_id: "e-2".into(),
            chat_id: "c".into(),
            sender_id: "u".into(),
            sender_name: None,
            emoji: "".into(),
            quoted: QuotedMessage {
                message_id: "m".into(),
                sender_id: "u2".into(),
                content: "x".into(),
            },
            sent_at: Utc::now(),
        };
        assert!(InboundEvent::Reaction(r).validate().is_err());
    }

    #[tokio::test]
    async fn duplicate_delivery_enqueues_once() {
        let (store, ingestor) = ingestor().await;
        let event = QueueEvent::Message(message("e-1"));

        let first = ingestor.ingest(event.clone(), json!({})).await.unwrap();
        assert!(matches!(first, IngestOutcome::Accepted { .. }));
        let second = ingestor.ingest(event, json!({})).await.unwrap();
        assert_eq!(second, IngestOutcome::Duplicate);

        assert_eq!(store.queue_stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn contacts_are_upserted_for_sender_and_group() {
        let (store, ingestor) = ingestor().await;
        ingestor
            .ingest(QueueEvent::Message(message("e-1")), json!({}))
            .await
            .unwrap();

        let sender = store.get_contact("u-1").await.unwrap().unwrap();
        assert_eq!(sender.display_name.as_deref(), Some("Ana"));
        assert!(store.get_contact("group-1").await.unwrap().unwrap().is_group);
    }
}
