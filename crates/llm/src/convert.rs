//! Conversions between the Anthropic Messages protocol and the internal
//! OpenAI-shaped representation.
//!
//! The request and response conversions are pure functions. Streaming needs
//! state: [`SseAssembler`] turns internal chunks into the Anthropic event
//! sequence, [`ChunkAssembler`] does the inverse. Both are small explicit
//! state machines, one instance per stream.

mod chunks;
mod request;
mod response;
mod sse;

pub use chunks::ChunkAssembler;
pub use request::{chat_request_to_messages, messages_request_to_chat};
pub use response::{chat_response_to_messages, messages_response_to_chat};
pub use sse::SseAssembler;

use serde_json::Value;

use crate::messages::{anthropic, openai};

/// Translate an internal finish reason into an Anthropic stop reason.
pub(crate) fn finish_to_stop_reason(reason: openai::FinishReason) -> anthropic::StopReason {
    match reason {
        openai::FinishReason::Stop => anthropic::StopReason::EndTurn,
        openai::FinishReason::Length => anthropic::StopReason::MaxTokens,
        openai::FinishReason::ToolCalls => anthropic::StopReason::ToolUse,
        openai::FinishReason::ContentFilter => anthropic::StopReason::StopSequence,
    }
}

/// Translate an Anthropic stop reason into an internal finish reason.
pub(crate) fn stop_to_finish_reason(reason: anthropic::StopReason) -> openai::FinishReason {
    match reason {
        anthropic::StopReason::EndTurn => openai::FinishReason::Stop,
        anthropic::StopReason::MaxTokens => openai::FinishReason::Length,
        anthropic::StopReason::StopSequence => openai::FinishReason::Stop,
        anthropic::StopReason::ToolUse => openai::FinishReason::ToolCalls,
    }
}

/// Parse a tool-call arguments string into a JSON value.
///
/// An empty string becomes `{}`. Invalid JSON is kept as a raw string so
/// malformed provider output still reaches the client instead of failing
/// the conversion.
pub(crate) fn parse_argument_string(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Object(serde_json::Map::new());
    }

    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_argument_string_handles_invalid_json() {
        let raw = r#"{"command": "echo "hello""}"#;
        let value = parse_argument_string(raw);
        assert!(matches!(value, Value::String(s) if s == raw));
    }

    #[test]
    fn parse_argument_string_handles_empty_string() {
        assert_eq!(parse_argument_string(""), json!({}));
    }

    #[test]
    fn stop_reason_translation_is_total() {
        use anthropic::StopReason as S;
        use openai::FinishReason as F;

        assert_eq!(finish_to_stop_reason(F::Stop), S::EndTurn);
        assert_eq!(finish_to_stop_reason(F::Length), S::MaxTokens);
        assert_eq!(finish_to_stop_reason(F::ToolCalls), S::ToolUse);
        assert_eq!(finish_to_stop_reason(F::ContentFilter), S::StopSequence);

        assert_eq!(stop_to_finish_reason(S::EndTurn), F::Stop);
        assert_eq!(stop_to_finish_reason(S::StopSequence), F::Stop);
    }
}
