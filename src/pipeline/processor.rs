//! Event processor: the queue item handler.
//!
//! Flow per claimed item:
//! 1. Decode the payload (malformed → logged, item completed)
//! 2. Select rules (targeted rule, or matcher by trigger type/value)
//! 3. Per rule: run extraction for the hints its actions need
//! 4. Rejected extraction → one clarification to the actor, `skipped` record
//! 5. Otherwise execute actions and append the run to the ledger
//!
//! Any `partial`/`failed` run sends the item back under the queue's
//! attempt policy. Rules that already finished for this item on an
//! earlier attempt are not run again.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::MessagingTransport;
use crate::error::PipelineError;
use crate::executor::{ActionExecutor, RunInput};
use crate::ledger::{ExecutionLedger, ExecutionRecord, ExecutionStatus};
use crate::nlp::{ExtractedEntity, ExtractionHint, Extractor, Language, language};
use crate::pipeline::types::QueueEvent;
use crate::queue::{ItemHandler, QueueItem};
use crate::rules::{MatchContext, Rule, RuleMatcher, TriggerType, evaluate_conditions};
use crate::store::Database;

/// Outcome of extraction for one rule.
enum Extraction {
    Ready(HashMap<ExtractionHint, Vec<ExtractedEntity>>),
    Rejected {
        language: Language,
        hints: Vec<ExtractionHint>,
        issues: Vec<String>,
    },
}

/// Per-item result, mostly for tests and logs.
#[derive(Debug, Clone, Default)]
pub struct ProcessSummary {
    pub runs: Vec<(Uuid, ExecutionStatus)>,
    /// Rules skipped because an earlier attempt already finished them.
    pub already_done: usize,
}

impl ProcessSummary {
    pub fn incomplete(&self) -> usize {
        self.runs.iter().filter(|(_, s)| s.is_incomplete()).count()
    }
}

pub struct EventProcessor {
    store: Arc<dyn Database>,
    matcher: RuleMatcher,
    extractor: Extractor,
    executor: ActionExecutor,
    ledger: ExecutionLedger,
    messaging: Option<Arc<dyn MessagingTransport>>,
}

impl EventProcessor {
    pub fn new(
        store: Arc<dyn Database>,
        extractor: Extractor,
        executor: ActionExecutor,
        messaging: Option<Arc<dyn MessagingTransport>>,
    ) -> Self {
        Self {
            matcher: RuleMatcher::new(Arc::clone(&store)),
            ledger: ExecutionLedger::new(Arc::clone(&store)),
            store,
            extractor,
            executor,
            messaging,
        }
    }

    /// Process one claimed item.
    pub async fn process(&self, item: &QueueItem) -> Result<ProcessSummary, PipelineError> {
        let mut summary = ProcessSummary::default();

        let event: QueueEvent = match serde_json::from_value(item.payload.clone()) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    item_id = %item.id,
                    event_type = %item.event_type,
                    error = %e,
                    "Malformed queue payload, skipping matching"
                );
                return Ok(summary);
            }
        };

        let selected = self.select_rules(&event).await?;
        if selected.is_empty() {
            debug!(item_id = %item.id, event_type = event.event_type(), "No rules matched");
            return Ok(summary);
        }
        info!(item_id = %item.id, event_type = event.event_type(), rules = selected.len(), "Processing event");

        for (rule, ctx) in selected {
            if item.attempts > 1 && self.finished_earlier(&rule, item.id).await? {
                summary.already_done += 1;
                continue;
            }
            let status = self.run_rule(item, &event, &rule, &ctx).await?;
            summary.runs.push((rule.id, status));
        }
        Ok(summary)
    }

    async fn select_rules(
        &self,
        event: &QueueEvent,
    ) -> Result<Vec<(Rule, MatchContext)>, PipelineError> {
        if let Some(rule_id) = event.target_rule() {
            let Some(rule) = self.store.get_rule(rule_id).await? else {
                warn!(rule_id = %rule_id, "Targeted rule no longer exists");
                return Ok(Vec::new());
            };
            if matches!(event, QueueEvent::Schedule { .. }) && rule.trigger_type != TriggerType::Schedule {
                return Ok(Vec::new());
            }
            let ctx = event.match_context(&rule.owner_id);
            let runnable = rule.active
                && evaluate_conditions(&rule.conditions, &ctx)
                && rule.performer.permits(&ctx.actor, &rule.owner_id);
            return Ok(if runnable { vec![(rule, ctx)] } else { Vec::new() });
        }

        let ctx = event.match_context("unknown");
        let rules = self
            .matcher
            .match_rules(event.trigger_type(), &event.trigger_value(), &ctx)
            .await?;
        Ok(rules.into_iter().map(|rule| (rule, ctx.clone())).collect())
    }

    async fn finished_earlier(&self, rule: &Rule, item_id: Uuid) -> Result<bool, PipelineError> {
        let history = self.ledger.executions_for_item(rule.id, item_id).await?;
        Ok(history.iter().any(|r| !r.status.is_incomplete()))
    }

    async fn run_rule(
        &self,
        item: &QueueItem,
        event: &QueueEvent,
        rule: &Rule,
        ctx: &MatchContext,
    ) -> Result<ExecutionStatus, PipelineError> {
        let mut input = RunInput::from_event(event, &ctx.actor, Some(item.id));

        let hints = rule.extraction_hints();
        if !hints.is_empty() {
            match self.extract(event, &hints) {
                Extraction::Ready(extracted) => input.extracted = extracted,
                Extraction::Rejected {
                    language,
                    hints,
                    issues,
                } => {
                    info!(rule = %rule.name, item_id = %item.id, ?issues, "Extraction rejected");
                    let sent = self.clarify(event, language, &hints).await;
                    let mut record = ExecutionRecord::new(
                        rule.id,
                        Some(item.id),
                        input.fields.clone(),
                        ExecutionStatus::Skipped,
                    );
                    record.metadata = json!({
                        "event_id": input.event_id,
                        "reason": "extraction_rejected",
                        "hints": hints.iter().map(|h| h.as_str()).collect::<Vec<_>>(),
                        "issues": issues,
                        "clarification_sent": sent,
                    });
                    self.record(&record).await?;
                    return Ok(ExecutionStatus::Skipped);
                }
            }
        }

        let record = self.executor.execute(rule, &input).await;
        self.record(&record).await?;
        Ok(record.status)
    }

    fn extract(&self, event: &QueueEvent, hints: &[ExtractionHint]) -> Extraction {
        let Some(text) = event.source_text().filter(|t| !t.trim().is_empty()) else {
            return Extraction::Rejected {
                language: Language::default(),
                hints: hints.to_vec(),
                issues: vec!["event carries no text".into()],
            };
        };
        let reference = event.occurred_at().unwrap_or_else(Utc::now);

        let mut ready = HashMap::new();
        let mut rejected = Vec::new();
        let mut issues = Vec::new();
        for hint in hints {
            let entities = self.extractor.extract_at(text, *hint, reference);
            let (actionable, weak): (Vec<_>, Vec<_>) = entities
                .into_iter()
                .partition(|e| self.extractor.is_confident(e));
            for entity in &weak {
                for issue in &entity.issues {
                    if !issues.contains(issue) {
                        issues.push(issue.clone());
                    }
                }
            }
            if actionable.is_empty() {
                rejected.push(*hint);
            } else {
                if !weak.is_empty() {
                    debug!(hint = hint.as_str(), dropped = weak.len(), "Some candidates rejected");
                }
                ready.insert(*hint, actionable);
            }
        }

        if rejected.is_empty() {
            Extraction::Ready(ready)
        } else {
            Extraction::Rejected {
                language: language::detect(text),
                hints: rejected,
                issues,
            }
        }
    }

    /// Ask the actor for missing details. Returns whether the message went out.
    async fn clarify(&self, event: &QueueEvent, lang: Language, hints: &[ExtractionHint]) -> bool {
        let (Some(messaging), Some(_), Some(actor)) =
            (&self.messaging, event.reply_target(), event.actor())
        else {
            return false;
        };
        let text = clarification_text(lang, hints);
        match messaging.send_message(actor, &text).await {
            Ok(_) => true,
            Err(e) => {
                warn!(actor, error = %e, "Clarification message failed");
                false
            }
        }
    }

    async fn record(&self, record: &ExecutionRecord) -> Result<(), PipelineError> {
        self.ledger
            .record(record)
            .await
            .map_err(|e| PipelineError::Ledger {
                rule_id: record.rule_id,
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl ItemHandler for EventProcessor {
    async fn handle(&self, item: &QueueItem) -> Result<(), PipelineError> {
        let summary = self.process(item).await?;
        match summary.incomplete() {
            0 => Ok(()),
            failed => Err(PipelineError::RunsIncomplete {
                failed,
                total: summary.runs.len(),
            }),
        }
    }
}

fn describe_hint(hint: ExtractionHint, lang: Language) -> &'static str {
    match (hint, lang) {
        (ExtractionHint::Calendar, Language::Es) => "la fecha y hora del evento",
        (ExtractionHint::Task, Language::Es) => "la tarea",
        (ExtractionHint::BillBatch, Language::Es) => "las cuentas y sus montos",
        (ExtractionHint::Calendar, Language::En) => "the event date and time",
        (ExtractionHint::Task, Language::En) => "the task",
        (ExtractionHint::BillBatch, Language::En) => "the bills and their amounts",
    }
}

/// Clarification phrased in the message's language.
pub fn clarification_text(lang: Language, hints: &[ExtractionHint]) -> String {
    let what = hints
        .iter()
        .map(|h| describe_hint(*h, lang))
        .collect::<Vec<_>>();
    match lang {
        Language::Es => format!(
            "No pude entender {} en tu mensaje. ¿Me lo puedes escribir con más detalle?",
            what.join(" ni ")
        ),
        Language::En => format!(
            "I couldn't work out {} from your message. Could you write it with more detail?",
            what.join(" or ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{DeliveryAck, MediaBlob};
    use crate::config::{ExecutorConfig, ExtractionConfig};
    use crate::entities::EntityKind;
    use crate::error::ChannelError;
    use crate::executor::Collaborators;
    use crate::pipeline::types::{MessageEvent, QuotedMessage, ReactionEvent};
    use crate::queue::ActionQueue;
    use crate::rules::{Action, ActionParams};
    use crate::store::LibSqlBackend;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessagingTransport for RecordingTransport {
        async fn send_message(
            &self,
            target_id: &str,
            content: &str,
        ) -> Result<DeliveryAck, ChannelError> {
            self.sent
                .lock()
                .unwrap()
                .push((target_id.to_string(), content.to_string()));
            Ok(DeliveryAck::default())
        }

        async fn download_media(&self, reference: &str) -> Result<MediaBlob, ChannelError> {
            Err(ChannelError::MediaFailed {
                reference: reference.into(),
                reason: "unused".into(),
            })
        }
    }

    struct Harness {
        store: Arc<LibSqlBackend>,
        transport: Arc<RecordingTransport>,
        processor: EventProcessor,
    }

    async fn harness(with_transport: bool) -> Harness {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let transport = Arc::new(RecordingTransport::default());
        let queue = ActionQueue::new(store.clone(), 3);
        let mut services = Collaborators::new(store.clone());
        let messaging: Option<Arc<dyn MessagingTransport>> = if with_transport {
            services = services.with_messaging(transport.clone());
            Some(transport.clone())
        } else {
            None
        };
        let executor = ActionExecutor::new(services, queue, ExecutorConfig::default());
        let processor = EventProcessor::new(
            store.clone(),
            Extractor::new(ExtractionConfig::default()),
            executor,
            messaging,
        );
        Harness {
            store,
            transport,
            processor,
        }
    }

    fn item_for(event: &QueueEvent) -> QueueItem {
        let mut item = QueueItem::new(event.event_type(), serde_json::to_value(event).unwrap(), 3);
        item.attempts = 1;
        item
    }

    fn reaction(content: &str) -> QueueEvent {
        QueueEvent::Reaction(ReactionEvent {
            event_id: "evt-r".into(),
            chat_id: "chat-1".into(),
            sender_id: "owner".into(),
            sender_name: None,
            emoji: "📅".into(),
            quoted: QuotedMessage {
                message_id: "m-1".into(),
                sender_id: "friend".into(),
                content: content.into(),
            },
            sent_at: Utc.with_ymd_and_hms(2026, 6, 3, 12, 0, 0).unwrap(),
        })
    }

    fn message(content: &str) -> QueueEvent {
        QueueEvent::Message(MessageEvent {
            event_id: "evt-m".into(),
            chat_id: "chat-1".into(),
            sender_id: "owner".into(),
            sender_name: Some("Ana".into()),
            content: content.into(),
            is_group: false,
            media: None,
            sent_at: Utc.with_ymd_and_hms(2026, 6, 3, 12, 0, 0).unwrap(),
        })
    }

    fn calendar_rule() -> Rule {
        Rule::new("calendar", "owner", TriggerType::Reaction)
            .with_allowed_values(["📅"])
            .with_action(Action::new(
                1,
                ActionParams::CreateEvent {
                    title: None,
                    sync: false,
                },
            ))
    }

    #[tokio::test]
    async fn malformed_payload_completes_without_runs() {
        let h = harness(false).await;
        let mut item = QueueItem::new("message.created", json!({ "kind": "message" }), 3);
        item.attempts = 1;
        let summary = h.processor.process(&item).await.unwrap();
        assert!(summary.runs.is_empty());
        assert!(h.processor.handle(&item).await.is_ok());
    }

    #[tokio::test]
    async fn reaction_creates_local_event() {
        let h = harness(false).await;
        h.store.save_rule(&calendar_rule()).await.unwrap();

        let summary = h
            .processor
            .process(&item_for(&reaction("Nos vemos hoy a las 3 pm")))
            .await
            .unwrap();
        assert_eq!(summary.runs.len(), 1);
        assert_eq!(summary.runs[0].1, ExecutionStatus::Success);
        assert_eq!(h.store.count_entities(EntityKind::CalendarEvent).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unresolvable_time_sends_one_clarification() {
        let h = harness(true).await;
        let rule = calendar_rule();
        h.store.save_rule(&rule).await.unwrap();

        let item = item_for(&reaction("Reunión con el equipo mañana"));
        assert!(h.processor.handle(&item).await.is_ok());

        let sent = h.transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "owner");
        assert!(sent[0].1.starts_with("No pude entender"));

        let history = h.processor.ledger.executions_for_rule(rule.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ExecutionStatus::Skipped);
        assert_eq!(history[0].metadata["clarification_sent"], true);
        assert_eq!(h.store.count_entities(EntityKind::CalendarEvent).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_run_sends_item_back() {
        let h = harness(false).await;
        let rule = Rule::new("reply", "owner", TriggerType::IncomingMessage).with_action(
            Action::new(
                1,
                ActionParams::SendMessage {
                    target: None,
                    text: "ok".into(),
                },
            ),
        );
        h.store.save_rule(&rule).await.unwrap();

        let err = h.processor.handle(&item_for(&message("hola"))).await.unwrap_err();
        assert!(matches!(err, PipelineError::RunsIncomplete { failed: 1, total: 1 }));
    }

    #[tokio::test]
    async fn retry_skips_rules_finished_on_earlier_attempt() {
        let h = harness(false).await;
        let rule = Rule::new("note", "owner", TriggerType::IncomingMessage).with_action(Action::new(
            1,
            ActionParams::CreateNote {
                title: None,
                body: "{{content}}".into(),
            },
        ));
        h.store.save_rule(&rule).await.unwrap();

        let mut item = item_for(&message("hola"));
        item.attempts = 2;
        h.processor
            .ledger
            .record(&ExecutionRecord::new(
                rule.id,
                Some(item.id),
                json!({}),
                ExecutionStatus::Success,
            ))
            .await
            .unwrap();

        let summary = h.processor.process(&item).await.unwrap();
        assert_eq!(summary.already_done, 1);
        assert!(summary.runs.is_empty());
        assert_eq!(h.store.count_entities(EntityKind::Note).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn busy_rule_history_does_not_hide_an_earlier_success() {
        let h = harness(false).await;
        let rule = Rule::new("note", "owner", TriggerType::IncomingMessage).with_action(Action::new(
            1,
            ActionParams::CreateNote {
                title: None,
                body: "{{content}}".into(),
            },
        ));
        h.store.save_rule(&rule).await.unwrap();

        let mut item = item_for(&message("hola"));
        item.attempts = 2;
        h.processor
            .ledger
            .record(&ExecutionRecord::new(
                rule.id,
                Some(item.id),
                json!({}),
                ExecutionStatus::Success,
            ))
            .await
            .unwrap();
        // Other items keep the rule busy while this one waits for its retry.
        for _ in 0..60 {
            h.processor
                .ledger
                .record(&ExecutionRecord::new(
                    rule.id,
                    Some(Uuid::new_v4()),
                    json!({}),
                    ExecutionStatus::Success,
                ))
                .await
                .unwrap();
        }

        let summary = h.processor.process(&item).await.unwrap();
        assert_eq!(summary.already_done, 1);
        assert_eq!(h.store.count_entities(EntityKind::Note).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn manual_trigger_respects_performer_filter() {
        let h = harness(false).await;
        let rule = Rule::new("manual", "owner", TriggerType::Manual)
            .with_performer(crate::rules::PerformerFilter::Owner)
            .with_action(Action::new(
                1,
                ActionParams::CreateNote {
                    title: None,
                    body: "fired by {{actor}}".into(),
                },
            ));
        h.store.save_rule(&rule).await.unwrap();

        for actor in ["stranger", "owner"] {
            let event = QueueEvent::Manual {
                request_id: Uuid::new_v4(),
                rule_id: rule.id,
                actor: actor.into(),
            };
            h.processor.process(&item_for(&event)).await.unwrap();
        }
        assert_eq!(h.store.count_entities(EntityKind::Note).await.unwrap(), 1);
    }

    #[test]
    fn clarification_follows_language() {
        assert!(clarification_text(Language::En, &[ExtractionHint::Task]).starts_with("I couldn't"));
        let es = clarification_text(
            Language::Es,
            &[ExtractionHint::Calendar, ExtractionHint::BillBatch],
        );
        assert!(es.contains("la fecha y hora del evento ni las cuentas"));
    }
}
