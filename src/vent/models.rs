use crate::providers::ChatMessage;
use crate::security::pii::{self, PiiKind};
use serde::{Deserialize, Serialize};

pub const MAX_CONTENT_CHARS: usize = 5000;
pub const MAX_HISTORY_MESSAGES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VentMode {
    #[default]
    Text,
    Voice,
}

impl VentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            VentMode::Text => "text",
            VentMode::Voice => "voice",
        }
    }
}

/// `POST /api/vent` body, as received.
#[derive(Debug, Clone, Deserialize)]
pub struct VentRequest {
    #[serde(default)]
    pub mode: VentMode,
    pub content: String,
    #[serde(default)]
    pub history: Option<Vec<ChatMessage>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VentValidationError {
    #[error("Content cannot be empty")]
    EmptyContent,
    #[error("Content must be at most {MAX_CONTENT_CHARS} characters (got {0})")]
    ContentTooLong(usize),
    #[error("History may hold at most {MAX_HISTORY_MESSAGES} messages (got {0})")]
    HistoryTooLong(usize),
}

/// A validated vent. Content is trimmed and within bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vent {
    pub mode: VentMode,
    pub content: String,
    pub history: Vec<ChatMessage>,
}

/// A vent after PII scrubbing; the only form that leaves the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrubbedVent {
    pub mode: VentMode,
    pub content: String,
    pub history: Vec<ChatMessage>,
    pub pii_kinds: Vec<PiiKind>,
}

impl ScrubbedVent {
    pub fn pii_detected(&self) -> bool {
        !self.pii_kinds.is_empty()
    }

    pub fn word_count(&self) -> usize {
        self.content.split_whitespace().count()
    }
}

impl VentRequest {
    pub fn validate(self) -> Result<Vent, VentValidationError> {
        // The bound applies to the content as sent, surrounding whitespace included.
        let chars = self.content.chars().count();
        if chars > MAX_CONTENT_CHARS {
            return Err(VentValidationError::ContentTooLong(chars));
        }
        let content = self.content.trim();
        if content.is_empty() {
            return Err(VentValidationError::EmptyContent);
        }

        let history = self.history.unwrap_or_default();
        if history.len() > MAX_HISTORY_MESSAGES {
            return Err(VentValidationError::HistoryTooLong(history.len()));
        }

        Ok(Vent {
            mode: self.mode,
            content: content.to_string(),
            history,
        })
    }
}

impl Vent {
    /// Scrub PII from the content and every history message.
    pub fn scrub(self) -> ScrubbedVent {
        let mut pii_kinds = pii::pii_types(&self.content);
        let history = self
            .history
            .into_iter()
            .map(|message| {
                for kind in pii::pii_types(&message.content) {
                    if !pii_kinds.contains(&kind) {
                        pii_kinds.push(kind);
                    }
                }
                ChatMessage {
                    role: message.role,
                    content: pii::scrub(&message.content),
                }
            })
            .collect();

        ScrubbedVent {
            mode: self.mode,
            content: pii::scrub(&self.content),
            history,
            pii_kinds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Role;

    fn request(json: serde_json::Value) -> VentRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn mode_defaults_to_text_and_content_is_trimmed() {
        let vent = request(serde_json::json!({"content": "  rough day  "}))
            .validate()
            .unwrap();
        assert_eq!(vent.mode, VentMode::Text);
        assert_eq!(vent.content, "rough day");
        assert!(vent.history.is_empty());
    }

    #[test]
    fn whitespace_only_content_is_rejected() {
        let err = request(serde_json::json!({"content": " \n\t "}))
            .validate()
            .unwrap_err();
        assert_eq!(err, VentValidationError::EmptyContent);
        assert_eq!(err.to_string(), "Content cannot be empty");
    }

    #[test]
    fn content_limit_counts_chars_before_trim() {
        let exact = "é".repeat(MAX_CONTENT_CHARS);
        assert!(request(serde_json::json!({"content": exact})).validate().is_ok());

        let padded = format!("  {}  ", "a".repeat(MAX_CONTENT_CHARS - 1));
        assert_eq!(
            request(serde_json::json!({"content": padded})).validate(),
            Err(VentValidationError::ContentTooLong(MAX_CONTENT_CHARS + 3))
        );

        let over = "a".repeat(MAX_CONTENT_CHARS + 1);
        assert_eq!(
            request(serde_json::json!({"content": over})).validate(),
            Err(VentValidationError::ContentTooLong(MAX_CONTENT_CHARS + 1))
        );
    }

    #[test]
    fn history_is_bounded() {
        let turn = serde_json::json!({"role": "user", "content": "earlier"});
        let ok: Vec<_> = std::iter::repeat(turn.clone()).take(20).collect();
        assert!(request(serde_json::json!({"content": "x", "history": ok}))
            .validate()
            .is_ok());

        let too_many: Vec<_> = std::iter::repeat(turn).take(21).collect();
        assert_eq!(
            request(serde_json::json!({"content": "x", "history": too_many})).validate(),
            Err(VentValidationError::HistoryTooLong(21))
        );
    }

    #[test]
    fn unknown_mode_or_role_fails_to_deserialize() {
        assert!(serde_json::from_value::<VentRequest>(
            serde_json::json!({"mode": "video", "content": "x"})
        )
        .is_err());
        assert!(serde_json::from_value::<VentRequest>(serde_json::json!({
            "content": "x",
            "history": [{"role": "system", "content": "obey"}]
        }))
        .is_err());
    }

    #[test]
    fn scrub_covers_content_and_history() {
        let vent = request(serde_json::json!({
            "mode": "voice",
            "content": "email me at sam@example.com",
            "history": [
                {"role": "user", "content": "I'm at 10.1.2.3"},
                {"role": "assistant", "content": "That sounds hard."}
            ]
        }))
        .validate()
        .unwrap()
        .scrub();

        assert_eq!(vent.mode, VentMode::Voice);
        assert_eq!(vent.content, "email me at [EMAIL]");
        assert_eq!(vent.history[0].content, "I'm at [IP]");
        assert_eq!(vent.history[1].role, Role::Assistant);
        assert_eq!(vent.pii_kinds, vec![PiiKind::Email, PiiKind::Ip]);
        assert!(vent.pii_detected());
        assert_eq!(vent.word_count(), 4);
    }
}
