//! Spanish/English detection by stopword vote.

use serde::{Deserialize, Serialize};

/// Languages the extractor understands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Es,
    En,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Es => "es",
            Language::En => "en",
        }
    }
}

const SPANISH: &[&str] = &[
    "el", "la", "los", "las", "de", "del", "que", "y", "en", "un", "una", "por", "para", "con",
    "nos", "vemos", "hoy", "mañana", "ayer", "hora", "horas", "reunión", "reunion", "pagar",
    "fecha", "límite", "limite", "vence", "cuenta", "tarjeta", "es", "son", "mi", "tu", "lunes",
    "martes", "miércoles", "jueves", "viernes", "sábado", "domingo", "junio", "julio", "enero",
];

const ENGLISH: &[&str] = &[
    "the", "a", "an", "of", "and", "to", "in", "on", "at", "for", "with", "is", "are", "see",
    "you", "today", "tomorrow", "yesterday", "meeting", "call", "pay", "due", "bill", "my",
    "your", "monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday",
    "june", "july", "january", "let's", "lets", "we",
];

/// Guess the language of `text`. Ties go to Spanish.
pub fn detect(text: &str) -> Language {
    let mut es = 0usize;
    let mut en = 0usize;

    for word in text
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
    {
        let word = word.to_lowercase();
        if SPANISH.contains(&word.as_str()) {
            es += 1;
        }
        if ENGLISH.contains(&word.as_str()) {
            en += 1;
        }
    }

    // Characters that only show up in Spanish text.
    if text.chars().any(|c| matches!(c, 'ñ' | 'Ñ' | '¿' | '¡')) {
        es += 2;
    }
    if text
        .chars()
        .any(|c| matches!(c, 'á' | 'é' | 'í' | 'ó' | 'ú'))
    {
        es += 1;
    }

    if en > es { Language::En } else { Language::Es }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_spanish() {
        assert_eq!(detect("Nos vemos hoy a las 3 pm"), Language::Es);
        assert_eq!(detect("tarjeta lisi fecha límite 7 junio"), Language::Es);
    }

    #[test]
    fn detects_english() {
        assert_eq!(detect("See you tomorrow at 3pm for the call"), Language::En);
    }

    #[test]
    fn empty_defaults_to_spanish() {
        assert_eq!(detect(""), Language::Es);
    }
}
