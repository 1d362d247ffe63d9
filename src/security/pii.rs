//! In-memory PII scrubbing.
//!
//! Vent text passes through here before it reaches a provider or a log line.
//! Patterns are applied in a fixed order, each replacing its matches with a
//! bracketed placeholder, so earlier patterns win on overlapping input
//! (a `555-123-4567` is a phone number, never a partial SSN).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Category of personal data a pattern detects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PiiKind {
    Email,
    Phone,
    Url,
    Ssn,
    Card,
    Ip,
    Date,
}

impl PiiKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PiiKind::Email => "EMAIL",
            PiiKind::Phone => "PHONE",
            PiiKind::Url => "URL",
            PiiKind::Ssn => "SSN",
            PiiKind::Card => "CARD",
            PiiKind::Ip => "IP",
            PiiKind::Date => "DATE",
        }
    }

    /// Replacement text, e.g. `[EMAIL]`.
    pub fn placeholder(self) -> &'static str {
        match self {
            PiiKind::Email => "[EMAIL]",
            PiiKind::Phone => "[PHONE]",
            PiiKind::Url => "[URL]",
            PiiKind::Ssn => "[SSN]",
            PiiKind::Card => "[CARD]",
            PiiKind::Ip => "[IP]",
            PiiKind::Date => "[DATE]",
        }
    }
}

impl fmt::Display for PiiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct PiiPattern {
    kind: PiiKind,
    regex: Regex,
}

const PATTERN_SOURCES: &[(PiiKind, &str)] = &[
    (
        PiiKind::Email,
        r"(?i)\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Z|a-z]{2,}\b",
    ),
    (
        PiiKind::Phone,
        r"\b(?:\+?1[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b",
    ),
    // 7-digit local number
    (PiiKind::Phone, r"\b\d{3}[-.\s]\d{4}\b"),
    (PiiKind::Url, r#"(?i)https?://[^\s<>"{}|\\\^`\[\]]+"#),
    (PiiKind::Url, r#"(?i)www\.[^\s<>"{}|\\\^`\[\]]+"#),
    (PiiKind::Ssn, r"\b\d{3}[-.\s]?\d{2}[-.\s]?\d{4}\b"),
    (PiiKind::Card, r"\b(?:\d{4}[-.\s]?){3}\d{4}\b"),
    (PiiKind::Card, r"\b\d{15,16}\b"),
    (PiiKind::Ip, r"\b(?:\d{1,3}\.){3}\d{1,3}\b"),
    (
        PiiKind::Date,
        r"\b(?:0?[1-9]|1[0-2])[/\-](?:0?[1-9]|[12]\d|3[01])[/\-](?:19|20)\d{2}\b",
    ),
];

static PATTERNS: OnceLock<Vec<PiiPattern>> = OnceLock::new();

fn patterns() -> &'static [PiiPattern] {
    PATTERNS.get_or_init(|| {
        PATTERN_SOURCES
            .iter()
            .filter_map(|(kind, source)| match Regex::new(source) {
                Ok(regex) => Some(PiiPattern { kind: *kind, regex }),
                Err(e) => {
                    tracing::error!(kind = %kind, "PII pattern failed to compile: {e}");
                    None
                }
            })
            .collect()
    })
}

/// Replace every PII match with its placeholder.
pub fn scrub(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut result = text.to_string();
    for pattern in patterns() {
        if let std::borrow::Cow::Owned(replaced) =
            pattern.regex.replace_all(&result, pattern.kind.placeholder())
        {
            result = replaced;
        }
    }
    result
}

/// True if any pattern matches, without modifying the text.
pub fn contains_pii(text: &str) -> bool {
    !text.is_empty() && patterns().iter().any(|p| p.regex.is_match(text))
}

/// Kinds detected in `text`, deduplicated, in pattern order.
pub fn pii_types(text: &str) -> Vec<PiiKind> {
    let mut found = Vec::new();
    if text.is_empty() {
        return found;
    }
    for pattern in patterns() {
        if !found.contains(&pattern.kind) && pattern.regex.is_match(text) {
            found.push(pattern.kind);
        }
    }
    found
}
