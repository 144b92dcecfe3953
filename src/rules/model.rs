//! Core types for automation rules.
//!
//! A rule is a named, user-owned automation with a trigger type, a condition
//! tree, and an ordered list of actions. Rows are converted into these types
//! at the storage boundary; loosely-typed JSON never travels further in.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::EntityKind;
use crate::nlp::ExtractionHint;
use crate::rules::expr::Expr;

/// Longest reminder lead accepted: one year.
pub const MAX_REMINDER_LEAD_MINUTES: i64 = 366 * 24 * 60;

/// A user-defined automation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub name: String,
    /// Owning scope; also the identity `PerformerFilter::Owner` compares against.
    pub owner_id: String,
    pub active: bool,
    pub trigger_type: TriggerType,
    pub trigger_config: TriggerConfig,
    pub performer: PerformerFilter,
    /// Lower sorts first.
    pub priority: i32,
    pub conditions: Vec<Condition>,
    /// Sorted by `order`.
    pub actions: Vec<Action>,

    // Runtime state (ledger-managed)
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub next_fire_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// Create an active rule with no conditions and no actions.
    pub fn new(
        name: impl Into<String>,
        owner_id: impl Into<String>,
        trigger_type: TriggerType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            owner_id: owner_id.into(),
            active: true,
            trigger_type,
            trigger_config: TriggerConfig::default(),
            performer: PerformerFilter::Anyone,
            priority: 100,
            conditions: Vec::new(),
            actions: Vec::new(),
            execution_count: 0,
            success_count: 0,
            failure_count: 0,
            last_executed_at: None,
            next_fire_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: restrict the trigger to a fixed set of values.
    pub fn with_allowed_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trigger_config.allowed_values = values.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set a cron schedule (schedule rules only).
    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.trigger_config.schedule = Some(schedule.into());
        self
    }

    /// Builder: set the performer filter.
    pub fn with_performer(mut self, performer: PerformerFilter) -> Self {
        self.performer = performer;
        self
    }

    /// Builder: add a condition.
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Builder: add an action, keeping actions sorted by order.
    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self.actions.sort_by_key(|a| a.order);
        self
    }

    /// Builder: deactivate.
    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Check structural invariants before persisting.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("rule name is empty".into());
        }
        let mut orders: Vec<i32> = self.actions.iter().map(|a| a.order).collect();
        orders.sort_unstable();
        if orders.windows(2).any(|w| w[0] == w[1]) {
            return Err(format!("rule '{}' has duplicate action order values", self.name));
        }
        for action in &self.actions {
            action
                .params
                .validate()
                .map_err(|e| format!("rule '{}' action {}: {e}", self.name, action.order))?;
        }
        if self.trigger_type == TriggerType::Schedule {
            let schedule = self
                .trigger_config
                .schedule
                .as_deref()
                .ok_or_else(|| format!("schedule rule '{}' has no cron expression", self.name))?;
            crate::rules::schedule::next_fire(schedule, Utc::now())?;
        }
        Ok(())
    }

    /// Extraction hints required by this rule's actions, deduplicated, in action order.
    pub fn extraction_hints(&self) -> Vec<ExtractionHint> {
        let mut hints = Vec::new();
        for action in &self.actions {
            if let Some(hint) = action.params.extraction_hint() {
                if !hints.contains(&hint) {
                    hints.push(hint);
                }
            }
        }
        hints
    }
}

/// Event category that activates matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    IncomingMessage,
    Reaction,
    Schedule,
    EntityChange,
    Manual,
    Webhook,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::IncomingMessage => "incoming_message",
            TriggerType::Reaction => "reaction",
            TriggerType::Schedule => "schedule",
            TriggerType::EntityChange => "entity_change",
            TriggerType::Manual => "manual",
            TriggerType::Webhook => "webhook",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming_message" => Ok(TriggerType::IncomingMessage),
            "reaction" => Ok(TriggerType::Reaction),
            "schedule" => Ok(TriggerType::Schedule),
            "entity_change" => Ok(TriggerType::EntityChange),
            "manual" => Ok(TriggerType::Manual),
            "webhook" => Ok(TriggerType::Webhook),
            other => Err(format!("unknown trigger type: {other}")),
        }
    }
}

/// Trigger-specific configuration, stored as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// If non-empty, the trigger value must be one of these (e.g. reaction emoji).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<String>,
    /// Cron expression for schedule rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

impl TriggerConfig {
    pub fn accepts(&self, value: &str) -> bool {
        self.allowed_values.is_empty() || self.allowed_values.iter().any(|v| v == value)
    }
}

/// Which acting identity may cause a rule to fire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PerformerFilter {
    #[default]
    Anyone,
    /// Only the rule owner.
    Owner,
    /// Only the listed identities.
    Actors { ids: Vec<String> },
}

impl PerformerFilter {
    pub fn permits(&self, actor: &str, owner_id: &str) -> bool {
        match self {
            PerformerFilter::Anyone => true,
            PerformerFilter::Owner => actor == owner_id,
            PerformerFilter::Actors { ids } => ids.iter().any(|id| id == actor),
        }
    }
}

/// A single comparison in a rule's condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub id: Uuid,
    /// Conditions sharing a group are ANDed; groups are ORed.
    pub group: i32,
    /// Persisted for compatibility; combination is fixed by `group`.
    pub group_operator: GroupOperator,
    pub operator: ConditionOperator,
    /// Dotted path into the match context.
    pub field: String,
    pub value: serde_json::Value,
    pub negate: bool,
}

impl Condition {
    pub fn new(
        group: i32,
        field: impl Into<String>,
        operator: ConditionOperator,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group,
            group_operator: GroupOperator::And,
            operator,
            field: field.into(),
            value: value.into(),
            negate: false,
        }
    }

    /// Builder: invert this condition's result.
    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupOperator {
    And,
    Or,
}

impl GroupOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupOperator::And => "and",
            GroupOperator::Or => "or",
        }
    }
}

impl FromStr for GroupOperator {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "and" => Ok(GroupOperator::And),
            "or" => Ok(GroupOperator::Or),
            other => Err(format!("unknown group operator: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    RegexMatch,
    GreaterThan,
    LessThan,
    InList,
}

impl ConditionOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionOperator::Equals => "equals",
            ConditionOperator::NotEquals => "not_equals",
            ConditionOperator::Contains => "contains",
            ConditionOperator::NotContains => "not_contains",
            ConditionOperator::StartsWith => "starts_with",
            ConditionOperator::EndsWith => "ends_with",
            ConditionOperator::RegexMatch => "regex_match",
            ConditionOperator::GreaterThan => "greater_than",
            ConditionOperator::LessThan => "less_than",
            ConditionOperator::InList => "in_list",
        }
    }
}

impl FromStr for ConditionOperator {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "equals" => Ok(ConditionOperator::Equals),
            "not_equals" => Ok(ConditionOperator::NotEquals),
            "contains" => Ok(ConditionOperator::Contains),
            "not_contains" => Ok(ConditionOperator::NotContains),
            "starts_with" => Ok(ConditionOperator::StartsWith),
            "ends_with" => Ok(ConditionOperator::EndsWith),
            "regex_match" | "regex" => Ok(ConditionOperator::RegexMatch),
            "greater_than" => Ok(ConditionOperator::GreaterThan),
            "less_than" => Ok(ConditionOperator::LessThan),
            "in_list" | "in" => Ok(ConditionOperator::InList),
            other => Err(format!("unknown condition operator: {other}")),
        }
    }
}

/// One step of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    /// Unique within the rule; execution runs in ascending order.
    pub order: i32,
    pub params: ActionParams,
    /// Present only for conditional actions.
    pub condition: Option<Expr>,
    /// Attempts per run before the action counts as failed.
    pub max_attempts: u32,
    /// Overrides the action type's default failure policy.
    pub on_failure: Option<FailurePolicy>,
}

impl Action {
    pub fn new(order: i32, params: ActionParams) -> Self {
        let max_attempts = if params.action_type().is_external() { 3 } else { 1 };
        Self {
            id: Uuid::new_v4(),
            order,
            params,
            condition: None,
            max_attempts,
            on_failure: None,
        }
    }

    /// Builder: make this action conditional on prior results.
    pub fn when(mut self, condition: Expr) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Builder: set the per-run attempt budget (at least one).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Builder: override the failure policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = Some(policy);
        self
    }

    pub fn action_type(&self) -> ActionType {
        self.params.action_type()
    }

    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.on_failure
            .unwrap_or_else(|| self.action_type().default_failure_policy())
    }
}

/// What happens to the rest of a run when an action fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    Abort,
    Continue,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Abort => "abort",
            FailurePolicy::Continue => "continue",
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort" => Ok(FailurePolicy::Abort),
            "continue" => Ok(FailurePolicy::Continue),
            other => Err(format!("unknown failure policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CreateTask,
    CreateNote,
    SendMessage,
    CreateReminder,
    UpdateEntity,
    SendEmail,
    CallWebhook,
    CreateEvent,
    CreateBill,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::CreateTask => "create_task",
            ActionType::CreateNote => "create_note",
            ActionType::SendMessage => "send_message",
            ActionType::CreateReminder => "create_reminder",
            ActionType::UpdateEntity => "update_entity",
            ActionType::SendEmail => "send_email",
            ActionType::CallWebhook => "call_webhook",
            ActionType::CreateEvent => "create_event",
            ActionType::CreateBill => "create_bill",
        }
    }

    /// Actions whose effect leaves this process and cannot be taken back.
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            ActionType::SendMessage
                | ActionType::SendEmail
                | ActionType::CallWebhook
                | ActionType::CreateEvent
        )
    }

    pub fn default_failure_policy(&self) -> FailurePolicy {
        if self.is_external() {
            FailurePolicy::Abort
        } else {
            FailurePolicy::Continue
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_task" => Ok(ActionType::CreateTask),
            "create_note" => Ok(ActionType::CreateNote),
            "send_message" => Ok(ActionType::SendMessage),
            "create_reminder" => Ok(ActionType::CreateReminder),
            "update_entity" => Ok(ActionType::UpdateEntity),
            "send_email" => Ok(ActionType::SendEmail),
            "call_webhook" => Ok(ActionType::CallWebhook),
            "create_event" => Ok(ActionType::CreateEvent),
            "create_bill" => Ok(ActionType::CreateBill),
            other => Err(format!("unknown action type: {other}")),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_reminder_lead() -> i64 {
    30
}

/// Typed parameters per action type. Text fields accept `{{path}}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionParams {
    /// Create a task. With `from_text`, the title and due date come from extraction.
    CreateTask {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default = "default_true")]
        from_text: bool,
    },
    CreateNote {
        #[serde(default)]
        title: Option<String>,
        body: String,
    },
    /// Send a message; `target` defaults to the originating chat.
    SendMessage {
        #[serde(default)]
        target: Option<String>,
        text: String,
    },
    /// Remind `minutes_before` the time found in the text.
    CreateReminder {
        #[serde(default)]
        text: Option<String>,
        #[serde(default = "default_reminder_lead")]
        minutes_before: i64,
    },
    UpdateEntity {
        entity: EntityKind,
        /// Record id, usually a placeholder like `{{entity.id}}`.
        id: String,
        changes: serde_json::Map<String, serde_json::Value>,
    },
    SendEmail {
        to: String,
        subject: String,
        body: String,
    },
    CallWebhook {
        url: String,
        #[serde(default)]
        method: WebhookMethod,
        /// Defaults to the full match context.
        #[serde(default)]
        body: Option<serde_json::Value>,
    },
    CreateEvent {
        #[serde(default)]
        title: Option<String>,
        /// Push to the calendar provider after the local insert.
        #[serde(default = "default_true")]
        sync: bool,
    },
    CreateBill {
        #[serde(default)]
        status: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WebhookMethod {
    #[default]
    Post,
    Put,
}

impl ActionParams {
    pub fn action_type(&self) -> ActionType {
        match self {
            ActionParams::CreateTask { .. } => ActionType::CreateTask,
            ActionParams::CreateNote { .. } => ActionType::CreateNote,
            ActionParams::SendMessage { .. } => ActionType::SendMessage,
            ActionParams::CreateReminder { .. } => ActionType::CreateReminder,
            ActionParams::UpdateEntity { .. } => ActionType::UpdateEntity,
            ActionParams::SendEmail { .. } => ActionType::SendEmail,
            ActionParams::CallWebhook { .. } => ActionType::CallWebhook,
            ActionParams::CreateEvent { .. } => ActionType::CreateEvent,
            ActionParams::CreateBill { .. } => ActionType::CreateBill,
        }
    }

    /// The extraction this action consumes, if any.
    pub fn extraction_hint(&self) -> Option<ExtractionHint> {
        match self {
            ActionParams::CreateTask { from_text: true, .. } => Some(ExtractionHint::Task),
            ActionParams::CreateEvent { .. } | ActionParams::CreateReminder { .. } => {
                Some(ExtractionHint::Calendar)
            }
            ActionParams::CreateBill { .. } => Some(ExtractionHint::BillBatch),
            _ => None,
        }
    }

    /// Parse the `action_type` column plus its JSON params into a validated variant.
    pub fn from_db(action_type: &str, config: serde_json::Value) -> Result<Self, String> {
        let ty: ActionType = action_type.parse()?;
        let mut map = match config {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => return Err(format!("{ty} params must be an object, got {other}")),
        };
        map.insert("type".into(), serde_json::Value::String(ty.as_str().into()));
        let params: ActionParams = serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| format!("invalid {ty} params: {e}"))?;
        params.validate()?;
        Ok(params)
    }

    /// Serialize params to JSON for DB storage (the type lives in its own column).
    pub fn to_config_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let serde_json::Value::Object(ref mut map) = value {
            map.remove("type");
        }
        value
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            ActionParams::CreateTask {
                title, from_text, ..
            } => {
                if !from_text && title.as_deref().is_none_or(|t| t.trim().is_empty()) {
                    return Err("create_task needs a title when from_text is false".into());
                }
            }
            ActionParams::SendMessage { text, .. } if text.trim().is_empty() => {
                return Err("send_message text is empty".into());
            }
            ActionParams::SendEmail { to, .. } if !to.contains('@') && !to.contains("{{") => {
                return Err(format!("send_email recipient '{to}' is not an address"));
            }
            ActionParams::CallWebhook { url, .. }
                if !(url.starts_with("http://") || url.starts_with("https://")) =>
            {
                return Err(format!("call_webhook url '{url}' must be http(s)"));
            }
            ActionParams::UpdateEntity { changes, .. } if changes.is_empty() => {
                return Err("update_entity has no changes".into());
            }
            ActionParams::CreateReminder { minutes_before, .. }
                if !(0..=MAX_REMINDER_LEAD_MINUTES).contains(minutes_before) =>
            {
                return Err(format!(
                    "create_reminder minutes_before must be within 0..={MAX_REMINDER_LEAD_MINUTES}"
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Data available to condition evaluation for one trigger.
#[derive(Debug, Clone)]
pub struct MatchContext {
    /// Identity that caused the trigger.
    pub actor: String,
    /// Flattened event fields addressed by dotted paths.
    pub fields: serde_json::Value,
}

impl MatchContext {
    pub fn new(actor: impl Into<String>, fields: serde_json::Value) -> Self {
        Self {
            actor: actor.into(),
            fields,
        }
    }

    pub fn field(&self, path: &str) -> Option<&serde_json::Value> {
        crate::rules::expr::resolve_path(&self.fields, path)
    }
}
