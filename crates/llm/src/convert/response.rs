//! Non-streaming response conversions between the two protocols.

use crate::messages::{anthropic, openai};

/// Convert an internal OpenAI-shaped response into an Anthropic response.
///
/// The primary choice's text becomes a text block when non-empty; each tool
/// call becomes a `tool_use` block with its arguments parsed (raw-string
/// fallback on parse failure). Stop reasons and usage are translated.
pub fn chat_response_to_messages(response: openai::ChatResponse) -> anthropic::MessagesResponse {
    let model = response.model;
    let id = response.id;

    let (content, stop_reason) = match response.choices.into_iter().next() {
        Some(choice) => {
            let mut blocks = Vec::new();

            if let Some(text) = choice.message.content.filter(|text| !text.is_empty()) {
                blocks.push(anthropic::ContentBlock::Text { text });
            }

            for call in choice.message.tool_calls.unwrap_or_default() {
                blocks.push(anthropic::ContentBlock::ToolUse {
                    id: call.id,
                    name: call.function.name,
                    input: super::parse_argument_string(&call.function.arguments),
                });
            }

            (blocks, choice.finish_reason.map(super::finish_to_stop_reason))
        }
        None => (Vec::new(), None),
    };

    let usage = response
        .usage
        .map(|usage| anthropic::Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
        .unwrap_or_default();

    anthropic::MessagesResponse {
        id,
        kind: "message".to_string(),
        role: anthropic::Role::Assistant,
        content,
        model,
        stop_reason,
        stop_sequence: None,
        usage,
    }
}

/// Convert an Anthropic response into the internal OpenAI shape.
///
/// Symmetry counterpart of [`chat_response_to_messages`].
pub fn messages_response_to_chat(response: anthropic::MessagesResponse) -> openai::ChatResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in response.content {
        match block {
            anthropic::ContentBlock::Text { text: part } => text.push_str(&part),
            anthropic::ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(openai::ToolCall {
                    id,
                    kind: openai::ToolCallKind::Function,
                    function: openai::FunctionCall {
                        name,
                        arguments: serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string()),
                    },
                });
            }
            anthropic::ContentBlock::ToolResult { .. } => {
                log::warn!("Dropping tool_result block found in a response");
            }
            anthropic::ContentBlock::Unknown(_) => {
                log::debug!("Dropping unmodelled content block in a response");
            }
        }
    }

    let message = openai::ChatMessage {
        role: openai::Role::Assistant,
        content: if text.is_empty() && !tool_calls.is_empty() {
            None
        } else {
            Some(text)
        },
        tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
        tool_call_id: None,
    };

    openai::ChatResponse {
        id: response.id,
        object: openai::ObjectType::ChatCompletion,
        created: 0,
        model: response.model,
        choices: vec![openai::Choice {
            index: 0,
            message,
            finish_reason: response.stop_reason.map(super::stop_to_finish_reason),
        }],
        usage: Some(openai::Usage {
            prompt_tokens: response.usage.input_tokens,
            completion_tokens: response.usage.output_tokens,
            total_tokens: response.usage.input_tokens + response.usage.output_tokens,
        }),
        extra: Default::default(),
    }
}
