use super::models::{ScrubbedVent, VentMode};
use crate::config::LlmConfig;
use crate::providers::{ChatMessage, ChatRequest};

pub const SYSTEM_PROMPT: &str = "You are a compassionate listener for VentVault, a safe space for emotional expression.

Your role:
- Validate their feelings without judgment
- Respond with empathy and understanding
- Keep responses brief (2-3 sentences max)
- Never give medical advice
- Never ask questions
- Never suggest actions
- Never mention that you're an AI

Tone: Warm, supportive, human.

Important: If the message seems like a crisis or mentions self-harm, gently acknowledge their pain and remind them that support is available.";

/// `late night` 22-6, `morning` 6-12, `afternoon` 12-17, else `evening`.
pub fn time_of_day(hour: u32) -> &'static str {
    match hour {
        0..=5 | 22..=23 => "late night",
        6..=11 => "morning",
        12..=16 => "afternoon",
        _ => "evening",
    }
}

fn mode_context(mode: VentMode) -> &'static str {
    match mode {
        VentMode::Voice => "voice recording",
        VentMode::Text => "written message",
    }
}

pub fn build_context(mode: VentMode, hour: u32) -> String {
    format!(
        "Context: {}, {}. Respond naturally and briefly.",
        time_of_day(hour),
        mode_context(mode)
    )
}

/// Assemble the upstream request: system prompt plus context, prior turns,
/// then the vent itself. `hour` is the local hour (0-23).
pub fn build_chat_request(vent: &ScrubbedVent, llm: &LlmConfig, hour: u32) -> ChatRequest {
    let mut messages = Vec::with_capacity(vent.history.len() + 1);
    messages.extend(vent.history.iter().cloned());
    messages.push(ChatMessage::user(vent.content.clone()));

    ChatRequest {
        system: format!("{SYSTEM_PROMPT}\n\n{}", build_context(vent.mode, hour)),
        messages,
        model: llm.model().to_string(),
        temperature: llm.temperature,
        max_tokens: llm.max_output_tokens,
    }
}
