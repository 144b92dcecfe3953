//! Action executor: runs a rule's actions in order and builds the run record.
//!
//! Per action: skip (condition false or run aborted), run, or fail. Each
//! attempt is bounded by the call timeout and retried with capped,
//! jittered backoff within the action's attempt budget. The whole run is
//! bounded by the run timeout; hitting it fails the run.

pub mod actions;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::calendar::CalendarProvider;
use crate::channels::MessagingTransport;
use crate::config::ExecutorConfig;
use crate::email::EmailSender;
use crate::error::{ActionError, CalendarError, ChannelError, DatabaseError};
use crate::ledger::{ExecutionRecord, ExecutionStatus};
use crate::nlp::{ExtractedEntity, ExtractionHint};
use crate::pipeline::types::QueueEvent;
use crate::queue::ActionQueue;
use crate::rules::{Action, ActionType, FailurePolicy, Rule};
use crate::store::Database;

pub use actions::{ActionOutput, EntityChange, render};

/// External systems actions talk to. Optional collaborators that are not
/// configured make their actions fail with a parameter error.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Database>,
    pub messaging: Option<Arc<dyn MessagingTransport>>,
    pub calendar: Option<Arc<dyn CalendarProvider>>,
    pub email: Option<Arc<dyn EmailSender>>,
    pub http: reqwest::Client,
}

impl Collaborators {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self {
            store,
            messaging: None,
            calendar: None,
            email: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_messaging(mut self, messaging: Arc<dyn MessagingTransport>) -> Self {
        self.messaging = Some(messaging);
        self
    }

    pub fn with_calendar(mut self, calendar: Arc<dyn CalendarProvider>) -> Self {
        self.calendar = Some(calendar);
        self
    }

    pub fn with_email(mut self, email: Arc<dyn EmailSender>) -> Self {
        self.email = Some(email);
        self
    }
}

/// Everything one rule run sees.
#[derive(Debug, Clone, Default)]
pub struct RunInput {
    /// Id of the originating event; feeds record source keys.
    pub event_id: String,
    pub queue_item_id: Option<Uuid>,
    pub actor: String,
    /// Chat that replies default to.
    pub reply_target: Option<String>,
    /// Match-context fields of the event.
    pub fields: Value,
    /// Actionable entities per hint.
    pub extracted: HashMap<ExtractionHint, Vec<ExtractedEntity>>,
    /// Emit `entity.changed` events for records this run touches.
    pub emit_changes: bool,
}

impl RunInput {
    pub fn from_event(event: &QueueEvent, actor: &str, queue_item_id: Option<Uuid>) -> Self {
        Self {
            event_id: event.event_id(),
            queue_item_id,
            actor: actor.to_string(),
            reply_target: event.reply_target().map(str::to_string),
            fields: event.fields(),
            extracted: HashMap::new(),
            emit_changes: !event.is_entity_change(),
        }
    }

    pub fn entities(&self, hint: ExtractionHint) -> &[ExtractedEntity] {
        self.extracted.get(&hint).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First extracted payload, for `{{extracted.*}}` and conditions.
    fn first_extracted(&self) -> Value {
        [ExtractionHint::Calendar, ExtractionHint::Task, ExtractionHint::BillBatch]
            .iter()
            .find_map(|hint| self.entities(*hint).first())
            .and_then(|e| serde_json::to_value(&e.payload).ok())
            .unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Per-action line of the run result.
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub order: i32,
    pub action_type: ActionType,
    pub status: ActionStatus,
    pub attempts: u32,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
struct RunState {
    outcomes: Vec<ActionOutcome>,
    by_order: Map<String, Value>,
    last: Value,
    entity: Value,
    executed: u32,
    failed: u32,
    aborted: bool,
    in_flight: Option<(i32, ActionType)>,
    changes: Vec<EntityChange>,
}

impl RunState {
    fn scope(&self, input: &RunInput) -> Value {
        let mut scope = match &input.fields {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        scope.insert("event".into(), input.fields.clone());
        scope.insert("actions".into(), Value::Object(self.by_order.clone()));
        scope.insert("last".into(), self.last.clone());
        scope.insert("executed".into(), json!(self.executed));
        scope.insert("failed".into(), json!(self.failed));
        scope.insert("extracted".into(), input.first_extracted());
        scope.insert("entity".into(), self.entity.clone());
        Value::Object(scope)
    }

    fn push(&mut self, outcome: ActionOutcome) {
        let summary = json!({
            "status": outcome.status,
            "output": outcome.output,
        });
        self.by_order.insert(outcome.order.to_string(), summary.clone());
        if outcome.status != ActionStatus::Skipped {
            self.last = summary;
        }
        self.outcomes.push(outcome);
    }

    fn skip(&mut self, action: &Action, reason: &str) {
        self.push(ActionOutcome {
            order: action.order,
            action_type: action.action_type(),
            status: ActionStatus::Skipped,
            attempts: 0,
            output: json!({ "reason": reason }),
            error: None,
        });
    }

    fn succeed(&mut self, action: &Action, attempts: u32, out: ActionOutput) {
        self.executed += 1;
        if let Some(id) = out.ids.first() {
            let kind = out.output.get("entity").cloned().unwrap_or(Value::Null);
            self.entity = json!({ "kind": kind, "id": id });
        }
        self.changes.extend(out.changes);
        self.push(ActionOutcome {
            order: action.order,
            action_type: action.action_type(),
            status: ActionStatus::Succeeded,
            attempts,
            output: out.output,
            error: None,
        });
    }

    fn fail(&mut self, order: i32, action_type: ActionType, attempts: u32, error: String) {
        self.executed += 1;
        self.failed += 1;
        self.push(ActionOutcome {
            order,
            action_type,
            status: ActionStatus::Failed,
            attempts,
            output: Value::Null,
            error: Some(error),
        });
    }

    fn status(&self, timed_out: bool) -> ExecutionStatus {
        // Actions skipped by their condition count as a clean run; `skipped`
        // belongs to runs rejected before execution.
        if timed_out {
            ExecutionStatus::Failed
        } else if self.failed == 0 {
            ExecutionStatus::Success
        } else if self.failed == self.executed {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Partial
        }
    }
}

/// Errors that another attempt cannot fix.
fn is_retryable(err: &ActionError) -> bool {
    match err {
        ActionError::InvalidParameters { .. } | ActionError::MissingExtraction { .. } => false,
        ActionError::Database(DatabaseError::Constraint(_) | DatabaseError::NotFound { .. }) => {
            false
        }
        ActionError::Calendar(CalendarError::Rejected { status, .. }) => {
            *status == 429 || *status >= 500
        }
        ActionError::Channel(ChannelError::InvalidMessage(_)) => false,
        _ => true,
    }
}

/// Runs rules' action lists.
pub struct ActionExecutor {
    services: Collaborators,
    queue: ActionQueue,
    config: ExecutorConfig,
}

impl ActionExecutor {
    pub fn new(services: Collaborators, queue: ActionQueue, config: ExecutorConfig) -> Self {
        Self {
            services,
            queue,
            config,
        }
    }

    /// Run `rule` once and return the record for the ledger. Never fails:
    /// every fault ends up in the record.
    pub async fn execute(&self, rule: &Rule, input: &RunInput) -> ExecutionRecord {
        let started = Instant::now();
        let mut state = RunState::default();

        let run = tokio::time::timeout(
            self.config.run_timeout,
            self.run_actions(rule, input, &mut state),
        )
        .await;

        let timed_out = run.is_err();
        if timed_out {
            warn!(rule = %rule.name, timeout = ?self.config.run_timeout, "Rule run timed out");
            if let Some((order, action_type)) = state.in_flight.take() {
                state.fail(
                    order,
                    action_type,
                    0,
                    format!("run timed out after {:?}", self.config.run_timeout),
                );
            }
        }

        let status = state.status(timed_out);
        let mut record =
            ExecutionRecord::new(rule.id, input.queue_item_id, input.fields.clone(), status);
        record.actions_executed = state.executed;
        record.actions_failed = state.failed;
        record.duration_ms = started.elapsed().as_millis() as u64;
        record.result = serde_json::to_value(&state.outcomes).unwrap_or(Value::Null);
        record.metadata = json!({
            "event_id": input.event_id,
            "aborted": state.aborted,
            "timed_out": timed_out,
            "extracted": input.extracted.iter()
                .map(|(hint, entities)| (hint.as_str().to_string(), json!(entities.len())))
                .collect::<Map<String, Value>>(),
        });

        info!(
            rule = %rule.name,
            status = %status,
            executed = state.executed,
            failed = state.failed,
            duration_ms = record.duration_ms,
            "Rule run finished"
        );

        if input.emit_changes {
            self.emit_changes(rule, input, &state.changes).await;
        }
        record
    }

    async fn run_actions(&self, rule: &Rule, input: &RunInput, state: &mut RunState) {
        let mut ordered: Vec<&Action> = rule.actions.iter().collect();
        ordered.sort_by_key(|a| a.order);

        for action in ordered {
            if state.aborted {
                state.skip(action, "run aborted");
                continue;
            }

            let scope = state.scope(input);
            if let Some(condition) = &action.condition {
                if !condition.eval(&scope) {
                    debug!(rule = %rule.name, order = action.order, condition = %condition, "Condition false, skipping");
                    state.skip(action, "condition false");
                    continue;
                }
            }

            state.in_flight = Some((action.order, action.action_type()));
            let (result, attempts) = self.run_with_retry(rule, action, input, &scope).await;
            state.in_flight = None;

            match result {
                Ok(out) => state.succeed(action, attempts, out),
                Err(err) => {
                    warn!(
                        rule = %rule.name,
                        action = %action.action_type(),
                        order = action.order,
                        attempts,
                        error = %err,
                        "Action failed"
                    );
                    state.fail(action.order, action.action_type(), attempts, err.to_string());
                    if action.failure_policy() == FailurePolicy::Abort {
                        state.aborted = true;
                    }
                }
            }
        }
    }

    async fn run_with_retry(
        &self,
        rule: &Rule,
        action: &Action,
        input: &RunInput,
        scope: &Value,
    ) -> (Result<ActionOutput, ActionError>, u32) {
        let max_attempts = action.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                self.config.call_timeout,
                actions::run_action(&self.services, rule, action, input, scope),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ActionError::Timeout {
                    action: action.action_type().to_string(),
                    timeout: self.config.call_timeout,
                }),
            };

            match result {
                Ok(out) => return (Ok(out), attempt),
                Err(err) if attempt < max_attempts && is_retryable(&err) => {
                    let delay = self.backoff(attempt);
                    debug!(
                        action = %action.action_type(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying action"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return (Err(err), attempt),
            }
        }
    }

    /// `base * 2^(attempt-1)`, capped, plus up to half of `base` of jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base;
        let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.config.backoff_max);
        let jitter_ms = (base.as_millis() / 2) as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        capped + Duration::from_millis(jitter)
    }

    async fn emit_changes(&self, rule: &Rule, input: &RunInput, changes: &[EntityChange]) {
        for change in changes {
            let event = QueueEvent::EntityChange {
                change_id: Uuid::new_v4(),
                entity: change.entity,
                entity_id: change.id,
                change: change.change,
                actor: input.actor.clone(),
                rule_id: rule.id,
            };
            if let Err(e) = self.queue.enqueue_event(&event).await {
                warn!(rule = %rule.name, entity = %change.entity, error = %e, "Failed to enqueue entity change");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{DeliveryAck, MediaBlob};
    use crate::entities::EntityKind;
    use crate::nlp::{EntityPayload, EventCandidate, EventTiming, TaskCandidate};
    use crate::nlp::language::Language;
    use crate::rules::{ActionParams, Expr, TriggerType};
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, String)>>,
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl MessagingTransport for RecordingTransport {
        async fn send_message(
            &self,
            target_id: &str,
            content: &str,
        ) -> Result<DeliveryAck, ChannelError> {
            {
                let mut left = self.failures_left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(ChannelError::SendFailed {
                        name: "test".into(),
                        reason: "flaky".into(),
                    });
                }
            }
            self.sent
                .lock()
                .unwrap()
                .push((target_id.to_string(), content.to_string()));
            Ok(DeliveryAck {
                message_ids: vec!["m-1".into()],
            })
        }

        async fn download_media(&self, reference: &str) -> Result<MediaBlob, ChannelError> {
            Err(ChannelError::MediaFailed {
                reference: reference.into(),
                reason: "unused".into(),
            })
        }
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            run_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(1),
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
        }
    }

    async fn setup(
        transport: Option<Arc<RecordingTransport>>,
    ) -> (Arc<LibSqlBackend>, ActionExecutor, ActionQueue) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = ActionQueue::new(store.clone(), 3);
        let mut services = Collaborators::new(store.clone());
        if let Some(t) = transport {
            services = services.with_messaging(t);
        }
        let executor = ActionExecutor::new(services, queue.clone(), config());
        (store, executor, queue)
    }

    fn input() -> RunInput {
        RunInput {
            event_id: "evt-1".into(),
            actor: "owner".into(),
            reply_target: Some("chat-1".into()),
            fields: json!({ "sender_name": "Ana", "content": "hola" }),
            emit_changes: true,
            ..RunInput::default()
        }
    }

    fn note(order: i32) -> Action {
        Action::new(
            order,
            ActionParams::CreateNote {
                title: None,
                body: "De {{sender_name}}: {{content}}".into(),
            },
        )
    }

    fn message(order: i32) -> Action {
        Action::new(
            order,
            ActionParams::SendMessage {
                target: None,
                text: "Listo {{sender_name}}".into(),
            },
        )
    }

    #[tokio::test]
    async fn runs_actions_in_order_and_renders_templates() {
        let transport = Arc::new(RecordingTransport::default());
        let (store, executor, _) = setup(Some(transport.clone())).await;
        let rule = Rule::new("notes", "owner", TriggerType::IncomingMessage)
            .with_action(message(2))
            .with_action(note(1));

        let record = executor.execute(&rule, &input()).await;
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.actions_executed, 2);
        assert_eq!(record.result[0]["order"], 1);
        assert_eq!(record.result[1]["order"], 2);
        assert_eq!(
            transport.sent.lock().unwrap().as_slice(),
            &[("chat-1".to_string(), "Listo Ana".to_string())]
        );
        assert_eq!(store.count_entities(EntityKind::Note).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn false_condition_skips_without_failing() {
        let (_, executor, _) = setup(Some(Arc::new(RecordingTransport::default()))).await;
        let rule = Rule::new("cond", "owner", TriggerType::IncomingMessage)
            .with_action(note(1))
            .with_action(message(2).when(Expr::parse("actions.1.status == 'failed'").unwrap()));

        let record = executor.execute(&rule, &input()).await;
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.actions_executed, 1);
        assert_eq!(record.result[1]["status"], "skipped");
    }

    #[tokio::test]
    async fn abort_on_first_external_action_fails_run() {
        // No transport configured: send_message fails and aborts.
        let (store, executor, _) = setup(None).await;
        let rule = Rule::new("abort", "owner", TriggerType::IncomingMessage)
            .with_action(message(1))
            .with_action(note(2));

        let record = executor.execute(&rule, &input()).await;
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.actions_failed, 1);
        assert_eq!(record.result[1]["status"], "skipped");
        assert_eq!(store.count_entities(EntityKind::Note).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn continue_policy_yields_partial() {
        let (_, executor, _) = setup(None).await;
        let rule = Rule::new("partial", "owner", TriggerType::IncomingMessage)
            .with_action(note(1))
            .with_action(message(2).with_failure_policy(FailurePolicy::Continue))
            .with_action(note(3));

        let record = executor.execute(&rule, &input()).await;
        assert_eq!(record.status, ExecutionStatus::Partial);
        assert_eq!(record.actions_executed, 3);
        assert_eq!(record.actions_failed, 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_within_budget() {
        let transport = Arc::new(RecordingTransport {
            failures_left: Mutex::new(2),
            ..RecordingTransport::default()
        });
        let (_, executor, _) = setup(Some(transport.clone())).await;
        let rule = Rule::new("retry", "owner", TriggerType::IncomingMessage)
            .with_action(message(1).with_max_attempts(3));

        let record = executor.execute(&rule, &input()).await;
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.result[0]["attempts"], 3);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn all_actions_skipped_by_condition_is_success() {
        let (_, executor, _) = setup(None).await;
        let rule = Rule::new("guarded", "owner", TriggerType::IncomingMessage)
            .with_action(note(1).when(Expr::parse("failed > 0").unwrap()));
        let record = executor.execute(&rule, &input()).await;
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.actions_executed, 0);
        assert_eq!(record.result[0]["status"], "skipped");

        let empty = Rule::new("empty", "owner", TriggerType::IncomingMessage);
        assert_eq!(
            executor.execute(&empty, &input()).await.status,
            ExecutionStatus::Success
        );
    }

    #[tokio::test]
    async fn out_of_range_reminder_lead_fails_the_action() {
        let (store, executor, _) = setup(None).await;
        let rule = Rule::new("remind", "owner", TriggerType::IncomingMessage).with_action(
            Action::new(
                1,
                ActionParams::CreateReminder {
                    text: None,
                    minutes_before: i64::MAX / 2,
                },
            ),
        );
        let start = chrono::Utc::now();
        let mut run = input();
        run.extracted.insert(
            ExtractionHint::Calendar,
            vec![ExtractedEntity {
                span: "mañana a las 10".into(),
                language: Language::Es,
                payload: EntityPayload::Event(EventCandidate {
                    title: "reunión".into(),
                    timing: Some(EventTiming {
                        start,
                        end: start + chrono::Duration::hours(1),
                    }),
                    location: None,
                    is_virtual: false,
                    meeting_link: None,
                }),
                confidence: 1.0,
                valid: true,
                issues: Vec::new(),
            }],
        );

        let record = executor.execute(&rule, &run).await;
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.result[0]["attempts"], 1);
        assert_eq!(store.count_entities(EntityKind::Reminder).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn created_records_emit_entity_changes_once() {
        let (_, executor, queue) = setup(None).await;
        let rule = Rule::new("task", "owner", TriggerType::IncomingMessage).with_action(Action::new(
            1,
            ActionParams::CreateTask {
                title: None,
                description: None,
                from_text: true,
            },
        ));
        let mut run = input();
        run.extracted.insert(
            ExtractionHint::Task,
            vec![ExtractedEntity {
                span: "pagar la luz".into(),
                language: Language::Es,
                payload: EntityPayload::Task(TaskCandidate {
                    title: "pagar la luz".into(),
                    due: None,
                }),
                confidence: 1.0,
                valid: true,
                issues: Vec::new(),
            }],
        );

        let first = executor.execute(&rule, &run).await;
        assert_eq!(first.status, ExecutionStatus::Success);
        let second = executor.execute(&rule, &run).await;
        assert_eq!(second.status, ExecutionStatus::Success);
        assert_eq!(second.result[0]["output"]["created"], 0);

        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn missing_extraction_fails_task_action() {
        let (_, executor, _) = setup(None).await;
        let rule = Rule::new("task", "owner", TriggerType::IncomingMessage).with_action(Action::new(
            1,
            ActionParams::CreateTask {
                title: None,
                description: None,
                from_text: true,
            },
        ));
        let record = executor.execute(&rule, &input()).await;
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.result[0]["attempts"], 1);
    }

    #[tokio::test]
    async fn backoff_is_capped() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let executor = ActionExecutor::new(
            Collaborators::new(store.clone()),
            ActionQueue::new(store, 1),
            ExecutorConfig {
                backoff_base: Duration::from_millis(100),
                backoff_max: Duration::from_millis(300),
                ..config()
            },
        );
        assert!(executor.backoff(1) >= Duration::from_millis(100));
        assert!(executor.backoff(1) <= Duration::from_millis(150));
        assert!(executor.backoff(10) <= Duration::from_millis(350));
        assert!(executor.backoff(10) >= Duration::from_millis(300));
    }
}
