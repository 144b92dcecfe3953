//! Rule-based extraction of typed entities from chat text.
//!
//! `Extractor::extract` is pure and total: any input yields a (possibly
//! empty) list of candidates, each carrying a confidence and a validity
//! flag. Callers decide what to do with weak or invalid candidates.

pub mod bills;
pub mod calendar;
pub mod language;
pub mod money;
pub mod time;

pub use language::Language;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::ExtractionConfig;

/// Which extraction an action needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionHint {
    /// One calendar event.
    Calendar,
    /// One task.
    Task,
    /// Any number of bills.
    BillBatch,
}

impl ExtractionHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionHint::Calendar => "calendar",
            ExtractionHint::Task => "task",
            ExtractionHint::BillBatch => "bill_batch",
        }
    }
}

/// Urgency tier assigned to an extracted bill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl BillPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillPriority::Low => "low",
            BillPriority::Normal => "normal",
            BillPriority::High => "high",
            BillPriority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for BillPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(BillPriority::Low),
            "normal" => Ok(BillPriority::Normal),
            "high" => Ok(BillPriority::High),
            "urgent" => Ok(BillPriority::Urgent),
            other => Err(format!("unknown bill priority: {other}")),
        }
    }
}

/// Start and end of an event, both derived from a validated start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTiming {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCandidate {
    pub title: String,
    /// `None` when no valid time could be resolved.
    pub timing: Option<EventTiming>,
    pub location: Option<String>,
    pub is_virtual: bool,
    pub meeting_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCandidate {
    pub title: String,
    pub due: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillCandidate {
    pub vendor: String,
    pub description: String,
    pub amount: Option<Decimal>,
    pub currency: String,
    pub due_date: Option<NaiveDate>,
    pub note: Option<String>,
    pub priority: BillPriority,
}

/// Typed payload of an extracted entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityPayload {
    Event(EventCandidate),
    Task(TaskCandidate),
    Bill(BillCandidate),
}

/// One candidate produced by extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    /// Text the candidate was extracted from.
    pub span: String,
    pub language: Language,
    pub payload: EntityPayload,
    /// In `[0, 1]`.
    pub confidence: f32,
    pub valid: bool,
    /// Human-readable reasons for missing or rejected fields.
    pub issues: Vec<String>,
}

impl ExtractedEntity {
    /// Valid and at least `min_confidence`.
    pub fn is_actionable(&self, min_confidence: f32) -> bool {
        self.valid && self.confidence >= min_confidence
    }
}

/// Entry point for extraction.
#[derive(Debug, Clone)]
pub struct Extractor {
    config: ExtractionConfig,
}

impl Extractor {
    pub fn new(config: ExtractionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Extract against the current time.
    pub fn extract(&self, text: &str, hint: ExtractionHint) -> Vec<ExtractedEntity> {
        self.extract_at(text, hint, Utc::now())
    }

    /// Extract with relative expressions resolved against `reference`.
    pub fn extract_at(
        &self,
        text: &str,
        hint: ExtractionHint,
        reference: DateTime<Utc>,
    ) -> Vec<ExtractedEntity> {
        let lang = language::detect(text);
        match hint {
            ExtractionHint::Calendar => {
                vec![calendar::extract_event(text, lang, reference, &self.config)]
            }
            ExtractionHint::Task => {
                vec![calendar::extract_task(text, lang, reference, &self.config)]
            }
            ExtractionHint::BillBatch => bills::extract_bills(text, lang, reference, &self.config),
        }
    }

    /// Whether a candidate clears the configured confidence bar.
    pub fn is_confident(&self, entity: &ExtractedEntity) -> bool {
        entity.is_actionable(self.config.min_confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bill_priority_roundtrip() {
        for p in [
            BillPriority::Low,
            BillPriority::Normal,
            BillPriority::High,
            BillPriority::Urgent,
        ] {
            assert_eq!(p.as_str().parse::<BillPriority>().unwrap(), p);
        }
        assert!("meh".parse::<BillPriority>().is_err());
        assert!(BillPriority::Urgent > BillPriority::High);
    }

    #[test]
    fn extract_dispatches_by_hint() {
        let extractor = Extractor::new(ExtractionConfig::default());
        let reference = Utc.with_ymd_and_hms(2026, 6, 3, 12, 0, 0).unwrap();

        let events = extractor.extract_at("Nos vemos hoy a las 3 pm", ExtractionHint::Calendar, reference);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].payload, EntityPayload::Event(_)));
        assert!(extractor.is_confident(&events[0]));

        let tasks = extractor.extract_at("comprar pan", ExtractionHint::Task, reference);
        assert!(matches!(tasks[0].payload, EntityPayload::Task(_)));
    }

    #[test]
    fn never_faults_on_odd_input() {
        let extractor = Extractor::new(ExtractionConfig::default());
        for text in ["", "   ", "🙂🙂🙂", "$$$,,,...", "a las 99:99 pm el 32/13"] {
            for hint in [
                ExtractionHint::Calendar,
                ExtractionHint::Task,
                ExtractionHint::BillBatch,
            ] {
                for entity in extractor.extract(text, hint) {
                    assert!((0.0..=1.0).contains(&entity.confidence));
                }
            }
        }
    }

    #[test]
    fn oversized_bill_amount_keeps_other_segments() {
        let extractor = Extractor::new(ExtractionConfig::default());
        let bills = extractor.extract(
            "Braulio 9999999999999999999999999999 mil\nluz 600",
            ExtractionHint::BillBatch,
        );
        let amounts: Vec<_> = bills
            .iter()
            .filter_map(|e| match &e.payload {
                EntityPayload::Bill(b) => b.amount,
                _ => None,
            })
            .collect();
        assert!(amounts.contains(&rust_decimal::Decimal::from(600)));
    }
}

