//! Rule matching: active rules → allowed values → conditions → performer.

use std::sync::Arc;

use tracing::debug;

use crate::error::DatabaseError;
use crate::rules::condition::evaluate_conditions;
use crate::rules::model::{MatchContext, Rule, TriggerType};
use crate::store::Database;

/// Selects the rules that should run for a trigger.
pub struct RuleMatcher {
    store: Arc<dyn Database>,
}

impl RuleMatcher {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    /// Return matching rules ordered by priority ascending, then creation order.
    pub async fn match_rules(
        &self,
        trigger_type: TriggerType,
        trigger_value: &str,
        ctx: &MatchContext,
    ) -> Result<Vec<Rule>, DatabaseError> {
        let candidates = self.store.list_active_rules(trigger_type).await?;
        let total = candidates.len();
        let matched = select(candidates, trigger_value, ctx);
        debug!(
            trigger = %trigger_type,
            value = %trigger_value,
            candidates = total,
            matched = matched.len(),
            "Rules matched"
        );
        Ok(matched)
    }
}

/// Filter and order already-loaded rules.
pub fn select(rules: Vec<Rule>, trigger_value: &str, ctx: &MatchContext) -> Vec<Rule> {
    let mut matched: Vec<Rule> = rules
        .into_iter()
        .filter(|rule| rule.active)
        .filter(|rule| rule.trigger_config.accepts(trigger_value))
        .filter(|rule| evaluate_conditions(&rule.conditions, ctx))
        .filter(|rule| rule.performer.permits(&ctx.actor, &rule.owner_id))
        .collect();
    // Stable: rules loaded in creation order keep it within a priority.
    matched.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    matched
}
