//! Action handlers and `{{path}}` text templates.

use std::sync::LazyLock;

use chrono::{Duration, Utc};
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entities::{
    BillRecord, CalendarEventRecord, EntityKind, NoteRecord, ReminderRecord, TaskRecord,
    source_key,
};
use crate::error::{ActionError, DatabaseError};
use crate::executor::{Collaborators, RunInput};
use crate::nlp::{EntityPayload, ExtractionHint};
use crate::pipeline::types::ChangeKind;
use crate::rules::expr::resolve_path;
use crate::rules::{Action, ActionParams, Rule, WebhookMethod};
use crate::store::Upsert;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([\w.\-]+)\s*\}\}").expect("static regex"));

/// Replace every `{{path}}` with the scope value at that path. Missing
/// values render as an empty string.
pub fn render(template: &str, scope: &Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match resolve_path(scope, &caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            }
        })
        .into_owned()
}

/// Render every string inside a JSON value.
pub fn render_value(value: &Value, scope: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(render(s, scope)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// A record an action created or updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityChange {
    pub entity: EntityKind,
    pub id: Uuid,
    pub change: ChangeKind,
}

/// What a successful action hands back to the run.
#[derive(Debug, Clone, Default)]
pub struct ActionOutput {
    pub output: Value,
    pub changes: Vec<EntityChange>,
    /// Ids of every record the action touched, new or existing.
    pub ids: Vec<Uuid>,
}

impl ActionOutput {
    fn with_output(output: Value) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }

    fn track(&mut self, entity: EntityKind, upsert: Upsert) {
        self.ids.push(upsert.id);
        if upsert.created {
            self.changes.push(EntityChange {
                entity,
                id: upsert.id,
                change: ChangeKind::Created,
            });
        }
    }

    fn finish_records(mut self, entity: EntityKind) -> Self {
        let created = self.changes.len();
        let ids: Vec<String> = self.ids.iter().map(Uuid::to_string).collect();
        let extra = std::mem::take(&mut self.output);
        let mut output = json!({
            "entity": entity.as_str(),
            "ids": ids,
            "created": created,
        });
        if let (Value::Object(out), Value::Object(extra)) = (&mut output, extra) {
            out.extend(extra);
        }
        self.output = output;
        self
    }
}

fn rendered(template: &Option<String>, scope: &Value) -> Option<String> {
    template
        .as_deref()
        .map(|t| render(t, scope))
        .filter(|t| !t.trim().is_empty())
}

fn missing_extraction(action: &Action) -> ActionError {
    ActionError::MissingExtraction {
        action: action.action_type().to_string(),
    }
}

fn not_configured(action: &Action, what: &str) -> ActionError {
    ActionError::InvalidParameters {
        action: action.action_type().to_string(),
        reason: format!("{what} is not configured"),
    }
}

/// Run one attempt of `action`.
pub(crate) async fn run_action(
    services: &Collaborators,
    rule: &Rule,
    action: &Action,
    input: &RunInput,
    scope: &Value,
) -> Result<ActionOutput, ActionError> {
    debug!(rule = %rule.name, action = %action.action_type(), order = action.order, "Running action");
    match &action.params {
        ActionParams::CreateTask {
            title,
            description,
            from_text,
        } => create_task(services, rule, action, input, scope, title, description, *from_text).await,
        ActionParams::CreateNote { title, body } => {
            let key = source_key(&input.event_id, rule.id, action.order, 0);
            let mut note = NoteRecord::new(key, &rule.owner_id, render(body, scope));
            note.title = rendered(title, scope);
            let mut out = ActionOutput::default();
            out.track(EntityKind::Note, services.store.upsert_note(&note).await?);
            Ok(out.finish_records(EntityKind::Note))
        }
        ActionParams::SendMessage { target, text } => {
            let transport = services
                .messaging
                .as_ref()
                .ok_or_else(|| not_configured(action, "messaging transport"))?;
            let target = rendered(target, scope)
                .or_else(|| input.reply_target.clone())
                .ok_or_else(|| ActionError::InvalidParameters {
                    action: action.action_type().to_string(),
                    reason: "no target and the event has no chat".into(),
                })?;
            let ack = transport.send_message(&target, &render(text, scope)).await?;
            Ok(ActionOutput::with_output(json!({
                "target": target,
                "message_ids": ack.message_ids,
            })))
        }
        ActionParams::CreateReminder {
            text,
            minutes_before,
        } => create_reminder(services, rule, action, input, scope, text, *minutes_before).await,
        ActionParams::UpdateEntity {
            entity,
            id,
            changes,
        } => update_entity(services, action, scope, *entity, id, changes).await,
        ActionParams::SendEmail { to, subject, body } => {
            let sender = services
                .email
                .as_ref()
                .ok_or_else(|| not_configured(action, "email sender"))?;
            let to = render(to, scope);
            sender
                .send(&to, &render(subject, scope), &render(body, scope))
                .await?;
            Ok(ActionOutput::with_output(json!({ "to": to })))
        }
        ActionParams::CallWebhook { url, method, body } => {
            call_webhook(services, scope, &render(url, scope), *method, body.as_ref()).await
        }
        ActionParams::CreateEvent { title, sync } => {
            create_event(services, rule, action, input, scope, title, *sync).await
        }
        ActionParams::CreateBill { status } => {
            create_bills(services, rule, action, input, status.as_deref()).await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn create_task(
    services: &Collaborators,
    rule: &Rule,
    action: &Action,
    input: &RunInput,
    scope: &Value,
    title: &Option<String>,
    description: &Option<String>,
    from_text: bool,
) -> Result<ActionOutput, ActionError> {
    let mut out = ActionOutput::default();
    let description = rendered(description, scope);

    if !from_text {
        let title = rendered(title, scope).ok_or_else(|| ActionError::InvalidParameters {
            action: action.action_type().to_string(),
            reason: "title rendered empty".into(),
        })?;
        let mut task = TaskRecord::new(
            source_key(&input.event_id, rule.id, action.order, 0),
            &rule.owner_id,
            title,
        );
        task.description = description;
        out.track(EntityKind::Task, services.store.upsert_task(&task).await?);
        return Ok(out.finish_records(EntityKind::Task));
    }

    let entities = input.entities(ExtractionHint::Task);
    if entities.is_empty() {
        return Err(missing_extraction(action));
    }
    for (idx, entity) in entities.iter().enumerate() {
        let EntityPayload::Task(candidate) = &entity.payload else {
            continue;
        };
        let mut task = TaskRecord::new(
            source_key(&input.event_id, rule.id, action.order, idx),
            &rule.owner_id,
            rendered(title, scope).unwrap_or_else(|| candidate.title.clone()),
        );
        task.description = description.clone();
        task.due_at = candidate.due;
        out.track(EntityKind::Task, services.store.upsert_task(&task).await?);
    }
    Ok(out.finish_records(EntityKind::Task))
}

async fn create_reminder(
    services: &Collaborators,
    rule: &Rule,
    action: &Action,
    input: &RunInput,
    scope: &Value,
    text: &Option<String>,
    minutes_before: i64,
) -> Result<ActionOutput, ActionError> {
    let mut out = ActionOutput::default();
    let chat_id = input
        .reply_target
        .clone()
        .unwrap_or_else(|| input.actor.clone());

    for (idx, entity) in input.entities(ExtractionHint::Calendar).iter().enumerate() {
        let EntityPayload::Event(candidate) = &entity.payload else {
            continue;
        };
        let Some(timing) = candidate.timing else {
            continue;
        };
        let remind_at = Duration::try_minutes(minutes_before)
            .and_then(|lead| timing.start.checked_sub_signed(lead))
            .ok_or_else(|| ActionError::InvalidParameters {
                action: action.action_type().to_string(),
                reason: format!("minutes_before {minutes_before} is out of range"),
            })?;
        let now = Utc::now();
        let reminder = ReminderRecord {
            id: Uuid::new_v4(),
            source_key: source_key(&input.event_id, rule.id, action.order, idx),
            owner_id: rule.owner_id.clone(),
            chat_id: chat_id.clone(),
            text: rendered(text, scope).unwrap_or_else(|| candidate.title.clone()),
            remind_at,
            status: "pending".into(),
            created_at: now,
            updated_at: now,
        };
        out.track(EntityKind::Reminder, services.store.upsert_reminder(&reminder).await?);
    }

    if out.ids.is_empty() {
        return Err(missing_extraction(action));
    }
    Ok(out.finish_records(EntityKind::Reminder))
}

async fn update_entity(
    services: &Collaborators,
    action: &Action,
    scope: &Value,
    entity: EntityKind,
    id: &str,
    changes: &serde_json::Map<String, Value>,
) -> Result<ActionOutput, ActionError> {
    let raw_id = render(id, scope);
    let record_id = Uuid::parse_str(raw_id.trim()).map_err(|e| ActionError::InvalidParameters {
        action: action.action_type().to_string(),
        reason: format!("'{raw_id}' is not a record id: {e}"),
    })?;

    let changes: serde_json::Map<String, Value> = changes
        .iter()
        .map(|(k, v)| (k.clone(), render_value(v, scope)))
        .collect();

    if !services.store.update_entity(entity, record_id, &changes).await? {
        return Err(DatabaseError::NotFound {
            entity: entity.as_str().into(),
            id: record_id.to_string(),
        }
        .into());
    }

    let mut propagated = false;
    if entity == EntityKind::CalendarEvent {
        if let Some(calendar) = &services.calendar {
            let record = services.store.get_calendar_event(record_id).await?;
            if let Some((record, provider_id)) =
                record.and_then(|r| r.provider_event_id.clone().map(|p| (r, p)))
            {
                calendar.update_event(&provider_id, &record).await?;
                propagated = true;
            }
        }
    }

    Ok(ActionOutput {
        output: json!({
            "entity": entity.as_str(),
            "id": record_id,
            "changed": changes.keys().collect::<Vec<_>>(),
            "propagated": propagated,
        }),
        changes: vec![EntityChange {
            entity,
            id: record_id,
            change: ChangeKind::Updated,
        }],
        ids: vec![record_id],
    })
}

async fn call_webhook(
    services: &Collaborators,
    scope: &Value,
    url: &str,
    method: WebhookMethod,
    body: Option<&Value>,
) -> Result<ActionOutput, ActionError> {
    let payload = match body {
        Some(template) => render_value(template, scope),
        None => scope.get("event").cloned().unwrap_or(Value::Null),
    };
    let request = match method {
        WebhookMethod::Post => services.http.post(url),
        WebhookMethod::Put => services.http.put(url),
    };

    let resp = request
        .json(&payload)
        .send()
        .await
        .map_err(|e| ActionError::Webhook(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ActionError::Webhook(format!("{status}: {body}")));
    }
    Ok(ActionOutput::with_output(json!({ "status": status.as_u16() })))
}

async fn create_event(
    services: &Collaborators,
    rule: &Rule,
    action: &Action,
    input: &RunInput,
    scope: &Value,
    title: &Option<String>,
    sync: bool,
) -> Result<ActionOutput, ActionError> {
    let mut out = ActionOutput::default();
    let mut provider_ids = Vec::new();

    for (idx, entity) in input.entities(ExtractionHint::Calendar).iter().enumerate() {
        let EntityPayload::Event(candidate) = &entity.payload else {
            continue;
        };
        let Some(timing) = candidate.timing else {
            continue;
        };
        let now = Utc::now();
        let mut record = CalendarEventRecord {
            id: Uuid::new_v4(),
            source_key: source_key(&input.event_id, rule.id, action.order, idx),
            owner_id: rule.owner_id.clone(),
            title: rendered(title, scope).unwrap_or_else(|| candidate.title.clone()),
            start_at: timing.start,
            end_at: timing.end,
            all_day: false,
            location: candidate.location.clone(),
            is_virtual: candidate.is_virtual,
            meeting_link: candidate.meeting_link.clone(),
            provider_event_id: None,
            created_at: now,
            updated_at: now,
        };
        let upsert = services.store.upsert_calendar_event(&record).await?;
        out.track(EntityKind::CalendarEvent, upsert);

        if !sync {
            continue;
        }
        let Some(calendar) = &services.calendar else {
            warn!(rule = %rule.name, "Calendar provider not configured, event kept local");
            continue;
        };

        // A retried run finds the row from the earlier attempt; only push it
        // if the provider never acknowledged it.
        let existing = if upsert.created {
            None
        } else {
            services.store.get_calendar_event(upsert.id).await?
        };
        if let Some(provider_id) = existing.as_ref().and_then(|r| r.provider_event_id.clone()) {
            provider_ids.push(provider_id);
            continue;
        }
        record = existing.unwrap_or(CalendarEventRecord {
            id: upsert.id,
            ..record
        });
        let provider_id = calendar.create_event(&record).await?;
        services
            .store
            .set_calendar_provider_id(upsert.id, &provider_id)
            .await?;
        provider_ids.push(provider_id);
    }

    if out.ids.is_empty() {
        return Err(missing_extraction(action));
    }
    out.output = json!({ "provider_ids": provider_ids });
    Ok(out.finish_records(EntityKind::CalendarEvent))
}

async fn create_bills(
    services: &Collaborators,
    rule: &Rule,
    action: &Action,
    input: &RunInput,
    status: Option<&str>,
) -> Result<ActionOutput, ActionError> {
    let mut out = ActionOutput::default();

    for (idx, entity) in input.entities(ExtractionHint::BillBatch).iter().enumerate() {
        let EntityPayload::Bill(candidate) = &entity.payload else {
            continue;
        };
        let Some(amount) = candidate.amount else {
            continue;
        };
        let now = Utc::now();
        let bill = BillRecord {
            id: Uuid::new_v4(),
            source_key: source_key(&input.event_id, rule.id, action.order, idx),
            owner_id: rule.owner_id.clone(),
            vendor: candidate.vendor.clone(),
            description: candidate.description.clone(),
            amount,
            currency: candidate.currency.clone(),
            due_date: candidate.due_date,
            note: candidate.note.clone(),
            priority: candidate.priority,
            status: status.unwrap_or("pending").to_string(),
            created_at: now,
            updated_at: now,
        };
        out.track(EntityKind::Bill, services.store.upsert_bill(&bill).await?);
    }

    if out.ids.is_empty() {
        return Err(missing_extraction(action));
    }
    Ok(out.finish_records(EntityKind::Bill))
}
