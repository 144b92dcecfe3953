//! Rule definitions, condition evaluation and matching.

pub mod condition;
pub mod expr;
pub mod matcher;
pub mod model;
pub mod schedule;

pub use condition::evaluate_conditions;
pub use expr::Expr;
pub use matcher::RuleMatcher;
pub use model::{
    Action, ActionParams, ActionType, Condition, ConditionOperator, FailurePolicy, GroupOperator,
    MatchContext, PerformerFilter, Rule, TriggerConfig, TriggerType, WebhookMethod,
};
