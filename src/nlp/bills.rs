//! Multi-entity extraction: a batch of bills from one message.
//!
//! The text is split on line breaks and bullets, and a line holding more
//! than one plausible amount is split after each amount. Every segment is
//! extracted on its own; a bad segment never discards the others.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use rust_decimal::Decimal;

use crate::config::ExtractionConfig;
use crate::nlp::language::Language;
use crate::nlp::money::{self, MoneyMatch};
use crate::nlp::time;
use crate::nlp::{BillCandidate, BillPriority, EntityPayload, ExtractedEntity};

/// Bare numbers below this are treated as quantities, not amounts.
const MIN_BARE_AMOUNT: i64 = 100;

const VENDOR_MAX_WORDS: usize = 5;

static BULLET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-•*·–]|[0-9]{1,2}[.)])\s+").expect("static regex")
});

static DUE_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:fecha\s+l[íi]mite|vencimiento|vence|vto\.?|due(?:\s+date)?|pagar\s+antes\s+del?|hasta\s+el)\b:?")
        .expect("static regex")
});

static OVERDUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(vencid[oa]s?|atrasad[oa]s?|overdue|late|moros[oa]s?|urgente|urgent|impag[oa]s?)\b")
        .expect("static regex")
});

static PERIODS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([0-9]{1,2}|dos|tres|cuatro|cinco|two|three|four|five)\s+(meses|months|cuotas|boletas|periodos|períodos)\b")
        .expect("static regex")
});

static NOTE_PARENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^)]*)\)").expect("static regex"));

static NOTE_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:nota|note|obs)\s*:\s*(.+)$").expect("static regex")
});

/// Extract every bill found in `text`.
pub fn extract_bills(
    text: &str,
    lang: Language,
    reference: DateTime<Utc>,
    config: &ExtractionConfig,
) -> Vec<ExtractedEntity> {
    let today = time::local_today(reference, config.utc_offset);
    segments(text, today, lang, &config.default_currency)
        .into_iter()
        .map(|segment| extract_one(&segment, lang, today, &config.default_currency))
        .collect()
}

/// Split into one string per bill.
fn segments(text: &str, today: NaiveDate, lang: Language, currency: &str) -> Vec<String> {
    let mut out = Vec::new();
    for raw_line in text.lines() {
        let line = match BULLET.find(raw_line) {
            Some(m) => &raw_line[m.end()..],
            None => raw_line,
        };
        let line = line.trim();
        // Headers and chatter without any number are not bills.
        if !line.chars().any(|c| c.is_ascii_digit()) {
            continue;
        }

        let masked = mask_non_amounts(line, today, lang);
        let amounts: Vec<MoneyMatch> = money::find_amounts(&masked, currency)
            .into_iter()
            .filter(plausible)
            .collect();

        if amounts.len() <= 1 {
            out.push(line.to_string());
            continue;
        }

        let mut from = 0;
        for (i, amount) in amounts.iter().enumerate() {
            let to = if i + 1 == amounts.len() {
                line.len()
            } else {
                amount.end
            };
            let piece = line[from..to].trim();
            if !piece.is_empty() {
                out.push(piece.to_string());
            }
            from = to;
        }
    }
    out
}

fn plausible(m: &MoneyMatch) -> bool {
    m.explicit || m.amount >= Decimal::from(MIN_BARE_AMOUNT)
}

/// Blank out dates and period counts so their digits are not read as amounts.
/// Byte offsets are preserved.
fn mask_non_amounts(line: &str, today: NaiveDate, lang: Language) -> String {
    let mut spans: Vec<(usize, usize)> = time::find_dates(line, today, lang)
        .iter()
        .map(|d| (d.start, d.end))
        .collect();
    spans.extend(PERIODS.find_iter(line).map(|m| (m.start(), m.end())));
    if let Some(t) = time::find_time(line) {
        spans.push((t.start, t.end));
    }

    let mut masked = String::with_capacity(line.len());
    for (idx, ch) in line.char_indices() {
        if spans.iter().any(|(s, e)| idx >= *s && idx < *e) {
            for _ in 0..ch.len_utf8() {
                masked.push(' ');
            }
        } else {
            masked.push(ch);
        }
    }
    masked
}

fn extract_one(segment: &str, lang: Language, today: NaiveDate, currency: &str) -> ExtractedEntity {
    let mut issues = Vec::new();
    let masked = mask_non_amounts(segment, today, lang);

    let amounts: Vec<MoneyMatch> = money::find_amounts(&masked, currency)
        .into_iter()
        .filter(plausible)
        .collect();
    let amount = amounts
        .iter()
        .find(|m| m.explicit)
        .or_else(|| amounts.last())
        .cloned();
    if amount.is_none() {
        issues.push("no amount found".to_string());
    }

    let date = time::find_date(segment, today, lang);
    let keyword = DUE_KEYWORD.find(segment);

    // The vendor is whatever precedes the first structured field.
    let cut = [
        keyword.map(|k| k.start()),
        date.map(|d| d.start),
        amount.as_ref().map(|a| a.start),
        NOTE_PARENS.find(segment).map(|m| m.start()),
    ]
    .into_iter()
    .flatten()
    .min()
    .unwrap_or(segment.len());
    let mut vendor = clean_words(&segment[..cut], VENDOR_MAX_WORDS);
    if vendor.is_empty() {
        if let Some(a) = &amount {
            vendor = clean_words(&masked[a.end..], VENDOR_MAX_WORDS);
        }
    }
    if vendor.is_empty() {
        issues.push("no vendor found".to_string());
    }

    let mut removed: Vec<(usize, usize)> = Vec::new();
    if let Some(k) = keyword {
        removed.push((k.start(), k.end()));
    }
    if let Some(d) = &date {
        removed.push((d.start, d.end));
    }
    if let Some(a) = &amount {
        removed.push((a.start, a.end));
    }
    let description = {
        let kept: String = segment
            .char_indices()
            .map(|(i, c)| {
                if removed.iter().any(|(s, e)| i >= *s && i < *e) {
                    ' '
                } else {
                    c
                }
            })
            .collect();
        let d = clean_words(&kept, usize::MAX);
        if d.is_empty() { vendor.clone() } else { d }
    };

    let note = NOTE_PARENS
        .captures(segment)
        .or_else(|| NOTE_LABEL.captures(segment))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|n| !n.is_empty());

    let due_date = date.map(|d| d.date);
    let priority = priority_for(segment, due_date, today);

    let confidence = if amount.is_some() { 0.5 } else { 0.0 }
        + if vendor.is_empty() { 0.0 } else { 0.3 }
        + if due_date.is_some() { 0.2 } else { 0.0 };

    let (amount_value, amount_currency) = match amount {
        Some(a) => (Some(a.amount), a.currency.unwrap_or_else(|| currency.to_string())),
        None => (None, currency.to_string()),
    };

    ExtractedEntity {
        span: segment.to_string(),
        language: lang,
        valid: amount_value.is_some(),
        payload: EntityPayload::Bill(BillCandidate {
            vendor,
            description,
            amount: amount_value,
            currency: amount_currency,
            due_date,
            note,
            priority,
        }),
        confidence,
        issues,
    }
}

/// Overdue language or a past due date is urgent; several unpaid periods
/// or a due date within three days is high; more than two weeks out is low.
fn priority_for(segment: &str, due: Option<NaiveDate>, today: NaiveDate) -> BillPriority {
    let days_left = due.map(|d| (d - today).num_days());
    if OVERDUE.is_match(segment) || days_left.is_some_and(|d| d < 0) {
        return BillPriority::Urgent;
    }
    if PERIODS.is_match(segment) || days_left.is_some_and(|d| d <= 3) {
        return BillPriority::High;
    }
    if days_left.is_some_and(|d| d > 14) {
        return BillPriority::Low;
    }
    BillPriority::Normal
}

fn clean_words(s: &str, max_words: usize) -> String {
    s.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 3, 12, 0, 0).unwrap()
    }

    fn bills(text: &str) -> Vec<(ExtractedEntity, BillCandidate)> {
        extract_bills(text, Language::Es, reference(), &ExtractionConfig::default())
            .into_iter()
            .map(|e| {
                let bill = match &e.payload {
                    EntityPayload::Bill(b) => b.clone(),
                    other => panic!("expected bill, got {other:?}"),
                };
                (e, bill)
            })
            .collect()
    }

    #[test]
    fn two_bills_on_separate_lines() {
        let found = bills("tarjeta lisi fecha límite 7 junio ... $80,120\nBraulio 600");
        assert_eq!(found.len(), 2);

        let (first, card) = &found[0];
        assert!(first.valid);
        assert_eq!(card.vendor, "tarjeta lisi");
        assert_eq!(card.amount, Some(dec!(80120)));
        assert_eq!(card.currency, "CLP");
        assert_eq!(card.due_date, NaiveDate::from_ymd_opt(2026, 6, 7));
        assert!((first.confidence - 1.0).abs() < 1e-6);

        let (second, braulio) = &found[1];
        assert!(second.valid);
        assert_eq!(braulio.vendor, "Braulio");
        assert_eq!(braulio.amount, Some(dec!(600)));
        assert_eq!(braulio.due_date, None);
        assert!((second.confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn two_bills_on_one_line() {
        let found = bills("tarjeta lisi fecha límite 7 junio $80,120 Braulio 600");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].1.amount, Some(dec!(80120)));
        assert_eq!(found[1].1.vendor, "Braulio");
        assert_eq!(found[1].1.amount, Some(dec!(600)));
    }

    #[test]
    fn bullets_and_headers() {
        let text = "Cuentas del mes:\n- luz $20.000 vence 20 junio\n• agua 15 mil (2 meses)\n* gas";
        let found = bills(text);
        // The header and "gas" carry no digits.
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].1.vendor, "luz");
        assert_eq!(found[0].1.amount, Some(dec!(20000)));
        assert_eq!(found[0].1.priority, BillPriority::Low);
        assert_eq!(found[1].1.amount, Some(dec!(15000)));
        assert_eq!(found[1].1.note.as_deref(), Some("2 meses"));
        assert_eq!(found[1].1.priority, BillPriority::High);
    }

    #[test]
    fn invalid_segment_keeps_the_others() {
        let found = bills("internet 25.990\ncontribuciones 2 cuotas");
        assert_eq!(found.len(), 2);
        assert!(found[0].0.valid);
        assert!(!found[1].0.valid);
        assert!(found[1].0.issues.iter().any(|i| i.contains("amount")));
    }

    #[test]
    fn overdue_is_urgent() {
        let found = bills("dentista $45.000 atrasado");
        assert_eq!(found[0].1.priority, BillPriority::Urgent);
        let found = bills("patente $30.000 vence 1 junio");
        assert_eq!(found[0].1.priority, BillPriority::Urgent);
    }

    #[test]
    fn near_due_is_high() {
        let found = bills("celular $12.990 vence 5 junio");
        assert_eq!(found[0].1.priority, BillPriority::High);
        let found = bills("gimnasio $25.000 vence 10 junio");
        assert_eq!(found[0].1.priority, BillPriority::Normal);
    }
}
