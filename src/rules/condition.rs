//! Condition evaluation.
//!
//! Conditions sharing a group number are ANDed; groups are ORed. A rule
//! with no conditions always matches. `Condition::group_operator` is
//! stored with the rule but never consulted here. Any fault inside a single condition
//! (bad regex, missing field, non-numeric comparison) makes that condition
//! false, and negation does not flip a fault into a match.

use std::collections::BTreeMap;

use regex::RegexBuilder;
use serde_json::Value;
use tracing::{debug, warn};

use crate::rules::model::{Condition, ConditionOperator, MatchContext};

/// Compiled-regex ceiling, keeps user patterns from blowing up memory.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Why a condition could not be evaluated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionFault {
    #[error("field '{0}' not present")]
    MissingField(String),
    #[error("invalid regex '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },
    #[error("values are not comparable as numbers or dates")]
    NotComparable,
}

/// Evaluate a rule's full condition set.
pub fn evaluate_conditions(conditions: &[Condition], ctx: &MatchContext) -> bool {
    if conditions.is_empty() {
        return true;
    }

    let mut groups: BTreeMap<i32, Vec<&Condition>> = BTreeMap::new();
    for cond in conditions {
        groups.entry(cond.group).or_default().push(cond);
    }

    groups
        .values()
        .any(|group| group.iter().all(|cond| evaluate_condition(cond, ctx)))
}

/// Evaluate one condition, applying negation. Faults are logged and yield `false`.
pub fn evaluate_condition(cond: &Condition, ctx: &MatchContext) -> bool {
    match check(cond, ctx) {
        Ok(matched) => matched != cond.negate,
        Err(ConditionFault::MissingField(field)) => {
            debug!(field = %field, "Condition field missing, treating as no match");
            false
        }
        Err(fault) => {
            warn!(condition = %cond.id, field = %cond.field, error = %fault, "Condition failed closed");
            false
        }
    }
}

/// Raw operator result before negation.
pub fn check(cond: &Condition, ctx: &MatchContext) -> Result<bool, ConditionFault> {
    let actual = ctx
        .field(&cond.field)
        .filter(|v| !v.is_null())
        .ok_or_else(|| ConditionFault::MissingField(cond.field.clone()))?;
    let expected = &cond.value;

    let actual_text = as_text(actual).to_lowercase();
    let expected_text = as_text(expected).to_lowercase();

    Ok(match cond.operator {
        ConditionOperator::Equals => values_equal(actual, expected),
        ConditionOperator::NotEquals => !values_equal(actual, expected),
        ConditionOperator::Contains => actual_text.contains(&expected_text),
        ConditionOperator::NotContains => !actual_text.contains(&expected_text),
        ConditionOperator::StartsWith => actual_text.starts_with(&expected_text),
        ConditionOperator::EndsWith => actual_text.ends_with(&expected_text),
        ConditionOperator::RegexMatch => {
            let pattern = as_text(expected);
            let regex = RegexBuilder::new(&pattern)
                .size_limit(REGEX_SIZE_LIMIT)
                .build()
                .map_err(|e| ConditionFault::InvalidRegex {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
            regex.is_match(&as_text(actual))
        }
        ConditionOperator::GreaterThan => ordered(actual, expected)? == std::cmp::Ordering::Greater,
        ConditionOperator::LessThan => ordered(actual, expected)? == std::cmp::Ordering::Less,
        ConditionOperator::InList => list_items(expected)
            .iter()
            .any(|item| item.to_lowercase() == actual_text),
    })
}

/// Stringify a JSON value without quotes around strings.
fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        return a == b;
    }
    match (actual, expected) {
        (Value::Bool(a), Value::Bool(b)) => a == b,
        _ => as_text(actual).to_lowercase() == as_text(expected).to_lowercase(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Compare as numbers, falling back to RFC 3339 timestamps.
fn ordered(actual: &Value, expected: &Value) -> Result<std::cmp::Ordering, ConditionFault> {
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        return a.partial_cmp(&b).ok_or(ConditionFault::NotComparable);
    }
    let parse = |v: &Value| chrono::DateTime::parse_from_rfc3339(&as_text(v)).ok();
    match (parse(actual), parse(expected)) {
        (Some(a), Some(b)) => Ok(a.cmp(&b)),
        _ => Err(ConditionFault::NotComparable),
    }
}

/// Accepts a JSON array or a comma-separated string.
fn list_items(expected: &Value) -> Vec<String> {
    match expected {
        Value::Array(items) => items.iter().map(as_text).collect(),
        other => as_text(other)
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::ConditionOperator as Op;
    use serde_json::json;

    fn ctx() -> MatchContext {
        MatchContext::new(
            "owner-1",
            json!({
                "content": "Pagar tarjeta antes del viernes",
                "sender": { "id": "5691234", "name": "Lisi" },
                "emoji": "📅",
                "amount": 80120,
                "sent_at": "2026-06-01T10:00:00Z",
                "is_group": false
            }),
        )
    }

    #[test]
    fn empty_conditions_match() {
        assert!(evaluate_conditions(&[], &ctx()));
    }

    #[test]
    fn string_operators_ignore_case() {
        let c = ctx();
        assert!(evaluate_condition(&Condition::new(0, "content", Op::Contains, "TARJETA"), &c));
        assert!(evaluate_condition(&Condition::new(0, "content", Op::StartsWith, "pagar"), &c));
        assert!(evaluate_condition(&Condition::new(0, "content", Op::EndsWith, "Viernes"), &c));
        assert!(evaluate_condition(&Condition::new(0, "sender.name", Op::Equals, "lisi"), &c));
        assert!(evaluate_condition(&Condition::new(0, "content", Op::NotContains, "luz"), &c));
    }

    #[test]
    fn numeric_and_date_comparisons() {
        let c = ctx();
        assert!(evaluate_condition(&Condition::new(0, "amount", Op::GreaterThan, 80000), &c));
        assert!(evaluate_condition(&Condition::new(0, "amount", Op::LessThan, "90000"), &c));
        assert!(evaluate_condition(
            &Condition::new(0, "sent_at", Op::LessThan, "2026-06-02T00:00:00Z"),
            &c
        ));
        // Not comparable: fails closed even when negated.
        let cond = Condition::new(0, "content", Op::GreaterThan, 3).negated();
        assert!(!evaluate_condition(&cond, &c));
    }

    #[test]
    fn in_list_accepts_array_or_csv() {
        let c = ctx();
        assert!(evaluate_condition(
            &Condition::new(0, "emoji", Op::InList, json!(["👍", "📅"])),
            &c
        ));
        assert!(evaluate_condition(
            &Condition::new(0, "sender.id", Op::InList, "111, 5691234"),
            &c
        ));
        assert!(!evaluate_condition(
            &Condition::new(0, "sender.id", Op::InList, "111,222"),
            &c
        ));
    }

    #[test]
    fn negation_inverts_single_condition() {
        let c = ctx();
        let cond = Condition::new(0, "content", Op::Contains, "tarjeta").negated();
        assert!(!evaluate_condition(&cond, &c));
        let cond = Condition::new(0, "content", Op::Contains, "luz").negated();
        assert!(evaluate_condition(&cond, &c));
    }

    #[test]
    fn missing_field_is_false_even_negated() {
        let c = ctx();
        let cond = Condition::new(0, "subject", Op::Equals, "x");
        assert_eq!(check(&cond, &c), Err(ConditionFault::MissingField("subject".into())));
        assert!(!evaluate_condition(&cond.clone().negated(), &c));
    }

    #[test]
    fn invalid_regex_fails_closed() {
        let c = ctx();
        let bad = Condition::new(0, "content", Op::RegexMatch, "(unclosed");
        assert!(matches!(check(&bad, &c), Err(ConditionFault::InvalidRegex { .. })));
        assert!(!evaluate_condition(&bad, &c));
        assert!(!evaluate_condition(&bad.negated(), &c));

        let good = Condition::new(0, "content", Op::RegexMatch, r"(?i)tarjeta\s+antes");
        assert!(evaluate_condition(&good, &c));
    }

    #[test]
    fn and_within_group_or_across_groups() {
        let c = ctx();
        // Group 1: true AND false -> false
        // Group 2: true -> true
        let conditions = vec![
            Condition::new(1, "emoji", Op::Equals, "📅"),
            Condition::new(1, "is_group", Op::Equals, true),
            Condition::new(2, "sender.name", Op::Equals, "Lisi"),
        ];
        assert!(evaluate_conditions(&conditions, &c));

        // Drop group 2: only the failing AND group remains.
        assert!(!evaluate_conditions(&conditions[..2], &c));

        // Both conditions of a group true.
        let conditions = vec![
            Condition::new(1, "emoji", Op::Equals, "📅"),
            Condition::new(1, "is_group", Op::Equals, false),
        ];
        assert!(evaluate_conditions(&conditions, &c));
    }

    #[test]
    fn bad_regex_only_sinks_its_own_group() {
        let c = ctx();
        let conditions = vec![
            Condition::new(1, "content", Op::RegexMatch, "[z-a]"),
            Condition::new(2, "emoji", Op::Equals, "📅"),
        ];
        assert!(evaluate_conditions(&conditions, &c));
    }

    #[test]
    fn stored_group_operator_does_not_change_grouping() {
        let c = ctx();
        let mut loose = Condition::new(1, "emoji", Op::Equals, "📅");
        loose.group_operator = crate::rules::model::GroupOperator::Or;
        let conditions = vec![loose, Condition::new(1, "is_group", Op::Equals, true)];
        // Still one AND group, and its second member is false.
        assert!(!evaluate_conditions(&conditions, &c));
    }
}
