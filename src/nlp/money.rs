//! Monetary amount parsing.
//!
//! Separators followed by exactly three digits are thousands separators
//! (`80,120` and `80.120` are both eighty thousand one hundred twenty).
//! A final separator followed by one or two digits is the decimal point.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;

/// An amount found in text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoneyMatch {
    pub amount: Decimal,
    /// ISO code when the text names a currency; `$` alone resolves to the default.
    pub currency: Option<String>,
    /// True when a currency marker or multiplier accompanied the number.
    pub explicit: bool,
    pub start: usize,
    pub end: usize,
}

static AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(US\$|USD|CLP|EUR|€|\$)?\s?([0-9]{1,3}(?:[.,][0-9]{3})+(?:[.,][0-9]{1,2})?|[0-9]+(?:[.,][0-9]{1,2})?)(?:\s?(usd|clp|eur|€|pesos|d[óo]lares|dollars|lucas|mil|k)\b)?",
    )
    .expect("static regex")
});

/// Every amount in `text`, in order. `default_currency` applies to bare `$`.
pub fn find_amounts(text: &str, default_currency: &str) -> Vec<MoneyMatch> {
    let mut found = Vec::new();
    for caps in AMOUNT.captures_iter(text) {
        let (Some(whole), Some(number)) = (caps.get(0), caps.get(2)) else {
            continue;
        };
        // Part of a longer token ("A320", "v2").
        if caps.get(1).is_none()
            && text[..number.start()]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric())
        {
            continue;
        }
        let start = caps.get(1).map_or(number.start(), |m| m.start());
        let Some(mut amount) = parse_number(number.as_str()) else {
            continue;
        };

        let prefix = caps.get(1).map(|m| m.as_str().to_lowercase());
        let suffix = caps.get(3).map(|m| m.as_str().to_lowercase());

        let mut currency = None;
        for marker in prefix.iter().chain(suffix.iter()) {
            match marker.as_str() {
                "us$" | "usd" | "dólares" | "dolares" | "dollars" => currency = Some("USD".into()),
                "eur" | "€" => currency = Some("EUR".into()),
                "clp" | "pesos" | "lucas" => {
                    currency.get_or_insert_with(|| "CLP".to_string());
                }
                "$" => {
                    currency.get_or_insert_with(|| default_currency.to_string());
                }
                _ => {}
            }
        }
        if suffix.as_deref().is_some_and(|s| matches!(s, "mil" | "k" | "lucas")) {
            // Out of range for Decimal: not a usable amount.
            let Some(scaled) = amount.checked_mul(Decimal::from(1000)) else {
                continue;
            };
            amount = scaled;
        }

        found.push(MoneyMatch {
            amount,
            currency,
            explicit: prefix.is_some() || suffix.is_some(),
            start,
            end: whole.end(),
        });
    }
    found
}

/// Normalize a localized number. Returns `None` for non-positive values.
pub fn parse_number(raw: &str) -> Option<Decimal> {
    let seps: Vec<(usize, char)> = raw
        .char_indices()
        .filter(|(_, c)| *c == '.' || *c == ',')
        .collect();

    let normalized: String = match seps.last() {
        None => raw.to_string(),
        Some(&(idx, _)) => {
            let tail = raw.len() - idx - 1;
            if tail == 3 {
                raw.chars().filter(|c| c.is_ascii_digit()).collect()
            } else {
                let int_part: String = raw[..idx].chars().filter(|c| c.is_ascii_digit()).collect();
                format!("{int_part}.{}", &raw[idx + 1..])
            }
        }
    };

    let value = Decimal::from_str(&normalized).ok()?;
    if value <= Decimal::ZERO {
        return None;
    }
    Some(value.normalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn thousands_separators() {
        assert_eq!(parse_number("80,120"), Some(dec!(80120)));
        assert_eq!(parse_number("80.120"), Some(dec!(80120)));
        assert_eq!(parse_number("1.250.000"), Some(dec!(1250000)));
    }

    #[test]
    fn decimal_separators() {
        assert_eq!(parse_number("1.234,56"), Some(dec!(1234.56)));
        assert_eq!(parse_number("1,234.5"), Some(dec!(1234.5)));
        assert_eq!(parse_number("12,5"), Some(dec!(12.5)));
        assert_eq!(parse_number("600"), Some(dec!(600)));
        assert_eq!(parse_number("0"), None);
    }

    #[test]
    fn finds_amounts_with_currency() {
        let found = find_amounts("tarjeta $80,120 y luz 20 mil", "CLP");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].amount, dec!(80120));
        assert_eq!(found[0].currency.as_deref(), Some("CLP"));
        assert!(found[0].explicit);
        assert_eq!(found[1].amount, dec!(20000));
    }

    #[test]
    fn usd_markers() {
        let found = find_amounts("hosting US$12,99", "CLP");
        assert_eq!(found[0].amount, dec!(12.99));
        assert_eq!(found[0].currency.as_deref(), Some("USD"));
    }

    #[test]
    fn bare_number_is_not_explicit() {
        let found = find_amounts("Braulio 600", "CLP");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].amount, dec!(600));
        assert!(found[0].currency.is_none());
        assert!(!found[0].explicit);
    }

    #[test]
    fn ignores_digits_inside_words() {
        assert!(find_amounts("vuelo A320", "CLP").is_empty());
    }

    #[test]
    fn multiplier_overflow_drops_only_that_amount() {
        let found = find_amounts("Braulio 9999999999999999999999999999 mil y luz 600", "CLP");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].amount, dec!(600));
    }
}
