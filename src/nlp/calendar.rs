//! Single-entity extraction: calendar events and tasks.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use crate::config::ExtractionConfig;
use crate::nlp::language::Language;
use crate::nlp::time::{self, to_utc};
use crate::nlp::{EntityPayload, EventCandidate, EventTiming, ExtractedEntity, TaskCandidate};

const TITLE_MAX_CHARS: usize = 80;

/// Words that carry no meaning once the date/time around them is removed.
const CONNECTORS: &[&str] = &[
    "a", "al", "las", "la", "el", "los", "de", "del", "en", "para", "por", "y", "at", "on", "in",
    "for", "the", "to", "by", "and", "desde", "hasta", "from", "until", ",", "-",
];

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+").expect("static regex"));

static VIRTUAL_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)meet\.google\.com|zoom\.us|teams\.microsoft\.com|teams\.live\.com|whereby\.com|webex\.com")
        .expect("static regex")
});

static VIRTUAL_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(zoom|google\s+meet|meet|teams|videollamada|video\s*call|virtual|online|en\s+l[íi]nea)\b")
        .expect("static regex")
});

static LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:en|En|at|At)\s+(?:(?:el|la|the)\s+)?(\p{Lu}[\p{L}0-9'\-]*(?:\s+\p{Lu}[\p{L}0-9'\-]*)*)")
        .expect("static regex")
});

static TASK_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:recordar(?:me)?|recu[ée]rdame|remind\s+me\s+to|todo:|tarea:|pendiente:|task:)\s*")
        .expect("static regex")
});

/// Extract one calendar event. The start time is required: without it the
/// candidate is invalid and carries no timing at all.
pub fn extract_event(
    text: &str,
    lang: Language,
    reference: DateTime<Utc>,
    config: &ExtractionConfig,
) -> ExtractedEntity {
    let today = time::local_today(reference, config.utc_offset);
    let mut issues = Vec::new();
    let mut spans: Vec<(usize, usize)> = Vec::new();

    let date = time::find_date(text, today, lang);
    if let Some(d) = &date {
        spans.push((d.start, d.end));
    }
    let clock = time::find_time(text);
    if let Some(t) = &clock {
        spans.push((t.start, t.end));
    }
    let duration = time::find_duration(text);
    if let Some(d) = &duration {
        spans.push((d.start, d.end));
    }

    let meeting_link = URL
        .find_iter(text)
        .find(|m| VIRTUAL_HOST.is_match(m.as_str()))
        .map(|m| m.as_str().trim_end_matches(['.', ',', ')']).to_string());
    for m in URL.find_iter(text) {
        spans.push((m.start(), m.end()));
    }
    let is_virtual = meeting_link.is_some() || VIRTUAL_WORD.is_match(text);

    let location = if is_virtual {
        None
    } else {
        LOCATION.captures(text).and_then(|caps| {
            let whole = caps.get(0)?;
            spans.push((whole.start(), whole.end()));
            caps.get(1).map(|m| m.as_str().to_string())
        })
    };

    let mut title = clean_title(text, &spans);
    let title_found = !title.is_empty();
    if !title_found {
        issues.push("no title found".to_string());
        title = match lang {
            Language::Es => "Evento".to_string(),
            Language::En => "Event".to_string(),
        };
    }

    if date.is_none() {
        issues.push("no date found, assuming today".to_string());
    }

    let start = match clock {
        Some(t) => {
            let day = date.map(|d| d.date).unwrap_or(today);
            let start = to_utc(day, t.hour, t.minute, config.utc_offset);
            if start.is_none() {
                issues.push("start time does not exist at the configured offset".to_string());
            }
            start
        }
        None => {
            issues.push("no valid start time found".to_string());
            None
        }
    };

    // The end is derived only from a validated start.
    let timing = start.map(|start| {
        let length = duration
            .map(|d| d.duration)
            .unwrap_or_else(|| Duration::minutes(config.default_event_minutes.max(1)));
        EventTiming {
            start,
            end: start + length,
        }
    });

    let resolved = [title_found, date.is_some(), timing.is_some()]
        .iter()
        .filter(|f| **f)
        .count();
    let confidence = resolved as f32 / 3.0;

    ExtractedEntity {
        span: text.trim().to_string(),
        language: lang,
        valid: timing.is_some(),
        payload: EntityPayload::Event(EventCandidate {
            title,
            timing,
            location,
            is_virtual,
            meeting_link,
        }),
        confidence,
        issues,
    }
}

/// Extract one task. Only the title is required; a date without a time
/// falls due at 09:00 local.
pub fn extract_task(
    text: &str,
    lang: Language,
    reference: DateTime<Utc>,
    config: &ExtractionConfig,
) -> ExtractedEntity {
    let today = time::local_today(reference, config.utc_offset);
    let mut issues = Vec::new();

    let prefix_end = TASK_PREFIX.find(text).map_or(0, |m| m.end());
    let mut spans = vec![(0, prefix_end)];

    let date = time::find_date(text, today, lang);
    if let Some(d) = &date {
        spans.push((d.start, d.end));
    }
    let clock = time::find_time(text);
    if let Some(t) = &clock {
        spans.push((t.start, t.end));
    }

    let due = match (date, clock) {
        (Some(d), Some(t)) => to_utc(d.date, t.hour, t.minute, config.utc_offset),
        (Some(d), None) => to_utc(d.date, 9, 0, config.utc_offset),
        (None, Some(t)) => to_utc(today, t.hour, t.minute, config.utc_offset),
        (None, None) => None,
    };

    let title = clean_title(text, &spans);
    let valid = !title.is_empty();
    if !valid {
        issues.push("no task title found".to_string());
    }

    ExtractedEntity {
        span: text.trim().to_string(),
        language: lang,
        payload: EntityPayload::Task(TaskCandidate { title, due }),
        confidence: if valid { 1.0 } else { 0.0 },
        valid,
        issues,
    }
}

/// Remove `spans` from `text`, then trim connector words and punctuation
/// left dangling at either end.
fn clean_title(text: &str, spans: &[(usize, usize)]) -> String {
    let mut kept = String::with_capacity(text.len());
    for (idx, ch) in text.char_indices() {
        if spans.iter().any(|(s, e)| idx >= *s && idx < *e) {
            kept.push(' ');
        } else {
            kept.push(ch);
        }
    }

    let mut words: Vec<&str> = kept
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| matches!(c, ',' | ';' | ':' | '.' | '!' | '?' | '¿' | '¡')))
        .filter(|w| !w.is_empty())
        .collect();

    let is_connector = |w: &str| CONNECTORS.contains(&w.to_lowercase().as_str());
    while words.last().is_some_and(|w| is_connector(w)) {
        words.pop();
    }
    while words.first().is_some_and(|w| is_connector(w)) {
        words.remove(0);
    }

    let title = words.join(" ");
    match title.char_indices().nth(TITLE_MAX_CHARS) {
        Some((cut, _)) => title[..cut].trim_end().to_string(),
        None => title,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 3, 12, 0, 0).unwrap()
    }

    fn event(entity: &ExtractedEntity) -> &EventCandidate {
        match &entity.payload {
            EntityPayload::Event(e) => e,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn resolves_today_afternoon() {
        let config = ExtractionConfig::default();
        let entity = extract_event("Nos vemos hoy a las 3 pm", Language::Es, reference(), &config);
        assert!(entity.valid);
        assert_eq!(entity.confidence, 1.0);
        let e = event(&entity);
        assert_eq!(e.title, "Nos vemos");
        let timing = e.timing.unwrap();
        assert_eq!(timing.start, Utc.with_ymd_and_hms(2026, 6, 3, 15, 0, 0).unwrap());
        assert_eq!(timing.end, timing.start + Duration::minutes(60));
    }

    #[test]
    fn applies_utc_offset() {
        let config = ExtractionConfig {
            utc_offset: FixedOffset::west_opt(4 * 3600).unwrap(),
            ..ExtractionConfig::default()
        };
        let entity = extract_event("reunión mañana 10:00 por 2 horas", Language::Es, reference(), &config);
        let timing = event(&entity).timing.unwrap();
        assert_eq!(timing.start, Utc.with_ymd_and_hms(2026, 6, 4, 14, 0, 0).unwrap());
        assert_eq!(timing.end - timing.start, Duration::hours(2));
    }

    #[test]
    fn missing_time_is_invalid_without_end() {
        let config = ExtractionConfig::default();
        let entity = extract_event("Reunión mañana", Language::Es, reference(), &config);
        assert!(!entity.valid);
        assert!(event(&entity).timing.is_none());
        assert!(entity.issues.iter().any(|i| i.contains("start time")));
    }

    #[test]
    fn out_of_range_time_is_invalid() {
        let config = ExtractionConfig::default();
        let entity = extract_event("Nos vemos a las 27", Language::Es, reference(), &config);
        assert!(!entity.valid);
        assert!(event(&entity).timing.is_none());
        assert!(entity.confidence < 0.5);
    }

    #[test]
    fn detects_virtual_meeting() {
        let config = ExtractionConfig::default();
        let entity = extract_event(
            "Standup tomorrow 9am https://meet.google.com/abc-defg-hij",
            Language::En,
            reference(),
            &config,
        );
        let e = event(&entity);
        assert!(e.is_virtual);
        assert_eq!(e.meeting_link.as_deref(), Some("https://meet.google.com/abc-defg-hij"));
        assert_eq!(e.title, "Standup");
    }

    #[test]
    fn detects_location() {
        let config = ExtractionConfig::default();
        let entity = extract_event(
            "Café con Ana en Plaza Italia mañana a las 11",
            Language::Es,
            reference(),
            &config,
        );
        let e = event(&entity);
        assert_eq!(e.location.as_deref(), Some("Plaza Italia"));
        assert!(!e.is_virtual);
        assert_eq!(e.title, "Café con Ana");
    }

    #[test]
    fn task_with_due_date() {
        let config = ExtractionConfig::default();
        let entity = extract_task("recordar pagar la luz el viernes", Language::Es, reference(), &config);
        assert!(entity.valid);
        match entity.payload {
            EntityPayload::Task(t) => {
                assert_eq!(t.title, "pagar la luz");
                assert_eq!(t.due, Some(Utc.with_ymd_and_hms(2026, 6, 5, 9, 0, 0).unwrap()));
            }
            other => panic!("expected task, got {other:?}"),
        }
    }

    #[test]
    fn empty_task_is_invalid() {
        let config = ExtractionConfig::default();
        let entity = extract_task("  ", Language::Es, reference(), &config);
        assert!(!entity.valid);
        assert_eq!(entity.confidence, 0.0);
    }
}
