//! Relative date and time resolution for Spanish and English chat text.
//!
//! Everything here is pure: the caller supplies "today" and the UTC offset.
//! A phrase that looks like a time but is out of range (`a las 27`) is not
//! a match.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Utc, Weekday};
use regex::{Captures, Regex};

use crate::nlp::language::Language;

/// A resolved calendar date and where it was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateMatch {
    pub date: NaiveDate,
    pub start: usize,
    pub end: usize,
}

/// A resolved wall-clock time and where it was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeMatch {
    pub hour: u32,
    pub minute: u32,
    pub start: usize,
    pub end: usize,
}

/// A duration phrase ("por 2 horas", "for 30 minutes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationMatch {
    pub duration: Duration,
    pub start: usize,
    pub end: usize,
}

const MONTHS: &str = "enero|febrero|marzo|abril|mayo|junio|julio|agosto|septiembre|setiembre|octubre|noviembre|diciembre|january|february|march|april|june|july|august|september|october|november|december|jan|feb|mar|apr|may|jun|jul|aug|sept|sep|oct|nov|dec";

static TIME_MERIDIEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([0-9]{1,2})(?:[:.]([0-9]{2}))?\s*([ap])\.?\s?m\b\.?").expect("static regex")
});

static TIME_CLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([0-9]{1,2}):([0-9]{2})\b(?:\s*(?:hrs|hs|h)\b)?").expect("static regex")
});

static TIME_AT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:a\s+las?|at)\s+([0-9]{1,2})\b(?:\s*(?:hrs|hs|h)\b)?").expect("static regex")
});

static TIME_NAMED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(mediod[ií]a|noon|medianoche|midnight)\b").expect("static regex")
});

static PERIOD_AFTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s+(?:de\s+la\s+(tarde|noche|mañana)|in\s+the\s+(afternoon|evening|morning))")
        .expect("static regex")
});

static DATE_RELATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(pasado\s+mañana|day\s+after\s+tomorrow|hoy|today|tonight|esta\s+noche|mañana|tomorrow)\b")
        .expect("static regex")
});

static DATE_IN_DAYS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:en|in)\s+([0-9]{1,3})\s+(?:d[ií]as|days?)\b").expect("static regex")
});

static DATE_WEEKDAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:el\s+|este\s+|next\s+|on\s+)?(lunes|martes|mi[ée]rcoles|jueves|viernes|s[áa]bado|domingo|monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b")
        .expect("static regex")
});

static DATE_DAY_MONTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b([0-9]{{1,2}})\s*(?:de\s+)?({MONTHS})\b(?:\s*(?:de\s+|,\s*)?([0-9]{{4}}))?"
    ))
    .expect("static regex")
});

static DATE_MONTH_DAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b({MONTHS})\s+([0-9]{{1,2}})(?:st|nd|rd|th)?\b(?:,?\s*([0-9]{{4}}))?"
    ))
    .expect("static regex")
});

static DATE_NUMERIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([0-9]{1,2})/([0-9]{1,2})(?:/([0-9]{2,4}))?\b").expect("static regex")
});

static DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:por|durante|for)\s+([0-9]{1,3})\s*(horas?|hrs?|hours?|minutos?|mins?|minutes?)\b|\b(media\s+hora|half\s+an\s+hour)\b")
        .expect("static regex")
});

/// First valid time expression in `text`.
pub fn find_time(text: &str) -> Option<TimeMatch> {
    let mut found: Vec<TimeMatch> = Vec::new();

    for caps in TIME_MERIDIEM.captures_iter(text) {
        let Ok(hour) = caps[1].parse::<u32>() else {
            continue;
        };
        let minute = minute_of(&caps, 2);
        let pm = caps[3].eq_ignore_ascii_case("p");
        if !(1..=12).contains(&hour) || minute > 59 {
            continue;
        }
        let hour = match (pm, hour) {
            (true, 12) => 12,
            (true, h) => h + 12,
            (false, 12) => 0,
            (false, h) => h,
        };
        found.push(time_match(&caps, hour, minute));
    }

    // Spans already read with an am/pm marker take precedence.
    let meridiem = found.clone();
    let overlaps = |m: &TimeMatch| meridiem.iter().any(|p| m.start < p.end && p.start < m.end);

    for caps in TIME_CLOCK.captures_iter(text) {
        let Ok(hour) = caps[1].parse::<u32>() else {
            continue;
        };
        let minute = minute_of(&caps, 2);
        if let Some(m) = clock_time(text, &caps, hour, minute, false) {
            if !overlaps(&m) {
                found.push(m);
            }
        }
    }

    for caps in TIME_AT.captures_iter(text) {
        let Ok(hour) = caps[1].parse::<u32>() else {
            continue;
        };
        if let Some(m) = clock_time(text, &caps, hour, 0, true) {
            if !overlaps(&m) {
                found.push(m);
            }
        }
    }

    for caps in TIME_NAMED.captures_iter(text) {
        let word = caps[1].to_lowercase();
        let hour = if word.starts_with("media") || word == "midnight" { 0 } else { 12 };
        found.push(time_match(&caps, hour, 0));
    }

    // A phrase matched by several patterns counts once, at its earliest start.
    found.sort_by_key(|m| (m.start, std::cmp::Reverse(m.end)));
    found.into_iter().next()
}

fn minute_of(caps: &Captures<'_>, idx: usize) -> u32 {
    caps.get(idx)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn time_match(caps: &Captures<'_>, hour: u32, minute: u32) -> TimeMatch {
    let whole = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
    TimeMatch {
        hour,
        minute,
        start: whole.0,
        end: whole.1,
    }
}

/// A 24h-style time, adjusted by a trailing "de la tarde" style phrase.
/// Bare small hours after "a las"/"at" are read as afternoon.
fn clock_time(
    text: &str,
    caps: &Captures<'_>,
    hour: u32,
    minute: u32,
    bare: bool,
) -> Option<TimeMatch> {
    if hour > 23 || minute > 59 {
        return None;
    }
    let mut m = time_match(caps, hour, minute);
    if let Some(period) = PERIOD_AFTER.captures(&text[m.end..]) {
        let word = period
            .get(1)
            .or_else(|| period.get(2))
            .map(|p| p.as_str().to_lowercase())
            .unwrap_or_default();
        let afternoon = matches!(word.as_str(), "tarde" | "noche" | "afternoon" | "evening");
        if afternoon && m.hour < 12 {
            m.hour += 12;
        }
        if let Some(p) = period.get(0) {
            m.end += p.end();
        }
        return Some(m);
    }

    if bare && (1..=7).contains(&m.hour) {
        m.hour += 12;
    }
    Some(m)
}

/// All date expressions in `text`, sorted by position, overlaps removed.
pub fn find_dates(text: &str, today: NaiveDate, lang: Language) -> Vec<DateMatch> {
    let mut found: Vec<DateMatch> = Vec::new();

    for caps in DATE_DAY_MONTH.captures_iter(text) {
        let day: u32 = caps[1].parse().unwrap_or(0);
        let month = month_number(&caps[2]);
        let year = caps
            .get(3)
            .and_then(|y| y.as_str().parse().ok())
            .unwrap_or(today.year());
        if let Some(date) = month.and_then(|m| NaiveDate::from_ymd_opt(year, m, day)) {
            found.push(date_match(&caps, date));
        }
    }

    for caps in DATE_MONTH_DAY.captures_iter(text) {
        let month = month_number(&caps[1]);
        let day: u32 = caps[2].parse().unwrap_or(0);
        let year = caps
            .get(3)
            .and_then(|y| y.as_str().parse().ok())
            .unwrap_or(today.year());
        if let Some(date) = month.and_then(|m| NaiveDate::from_ymd_opt(year, m, day)) {
            found.push(date_match(&caps, date));
        }
    }

    for caps in DATE_NUMERIC.captures_iter(text) {
        let a: u32 = caps[1].parse().unwrap_or(0);
        let b: u32 = caps[2].parse().unwrap_or(0);
        let (day, month) = match lang {
            Language::Es => (a, b),
            Language::En => (b, a),
        };
        let year = match caps.get(3).and_then(|y| y.as_str().parse::<i32>().ok()) {
            Some(y) if y < 100 => 2000 + y,
            Some(y) => y,
            None => today.year(),
        };
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            found.push(date_match(&caps, date));
        }
    }

    for caps in DATE_RELATIVE.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        let word = caps[1].to_lowercase();
        // "de la mañana" is a period of day, not tomorrow.
        if word == "mañana" && preceded_by_article(text, whole.start()) {
            continue;
        }
        let offset = if word.starts_with("pasado") || word.starts_with("day after") {
            2
        } else if word == "mañana" || word == "tomorrow" {
            1
        } else {
            0
        };
        found.push(DateMatch {
            date: today + Duration::days(offset),
            start: whole.start(),
            end: whole.end(),
        });
    }

    for caps in DATE_IN_DAYS.captures_iter(text) {
        let days: i64 = caps[1].parse().unwrap_or(0);
        found.push(date_match(&caps, today + Duration::days(days)));
    }

    for caps in DATE_WEEKDAY.captures_iter(text) {
        if let Some(target) = weekday_of(&caps[1]) {
            found.push(date_match(&caps, next_weekday(today, target)));
        }
    }

    found.sort_by_key(|m| (m.start, std::cmp::Reverse(m.end)));
    let mut kept: Vec<DateMatch> = Vec::with_capacity(found.len());
    for m in found {
        if kept.last().is_none_or(|prev| m.start >= prev.end) {
            kept.push(m);
        }
    }
    kept
}

/// First date expression in `text`.
pub fn find_date(text: &str, today: NaiveDate, lang: Language) -> Option<DateMatch> {
    find_dates(text, today, lang).into_iter().next()
}

/// First duration phrase in `text`.
pub fn find_duration(text: &str) -> Option<DurationMatch> {
    let caps = DURATION.captures(text)?;
    let whole = caps.get(0)?;
    let duration = if caps.get(3).is_some() {
        Duration::minutes(30)
    } else {
        let n: i64 = caps[1].parse().ok()?;
        let unit = caps[2].to_lowercase();
        if unit.starts_with('h') {
            Duration::hours(n)
        } else {
            Duration::minutes(n)
        }
    };
    if duration <= Duration::zero() {
        return None;
    }
    Some(DurationMatch {
        duration,
        start: whole.start(),
        end: whole.end(),
    })
}

/// Convert a local wall-clock time at `offset` to UTC.
pub fn to_utc(
    date: NaiveDate,
    hour: u32,
    minute: u32,
    offset: FixedOffset,
) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(hour, minute, 0)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Local calendar date of `reference` at `offset`.
pub fn local_today(reference: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    reference.with_timezone(&offset).date_naive()
}

fn date_match(caps: &Captures<'_>, date: NaiveDate) -> DateMatch {
    let whole = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
    DateMatch {
        date,
        start: whole.0,
        end: whole.1,
    }
}

fn preceded_by_article(text: &str, start: usize) -> bool {
    let before = text[..start].trim_end().to_lowercase();
    before.ends_with(" la") || before == "la"
}

fn month_number(name: &str) -> Option<u32> {
    let name = name.to_lowercase();
    let prefix: String = name.chars().take(3).collect();
    let month = match prefix.as_str() {
        "ene" | "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "abr" | "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "ago" | "aug" => 8,
        "sep" | "set" => 9,
        "oct" => 10,
        "nov" => 11,
        "dic" | "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn weekday_of(name: &str) -> Option<Weekday> {
    let name = name.to_lowercase();
    let day = match name.as_str() {
        "lunes" | "monday" => Weekday::Mon,
        "martes" | "tuesday" => Weekday::Tue,
        "miércoles" | "miercoles" | "wednesday" => Weekday::Wed,
        "jueves" | "thursday" => Weekday::Thu,
        "viernes" | "friday" => Weekday::Fri,
        "sábado" | "sabado" | "saturday" => Weekday::Sat,
        "domingo" | "sunday" => Weekday::Sun,
        _ => return None,
    };
    Some(day)
}

/// Next occurrence strictly after `today`.
fn next_weekday(today: NaiveDate, target: Weekday) -> NaiveDate {
    let current = today.weekday().num_days_from_monday() as i64;
    let wanted = target.num_days_from_monday() as i64;
    let mut ahead = (wanted - current).rem_euclid(7);
    if ahead == 0 {
        ahead = 7;
    }
    today + Duration::days(ahead)
}
