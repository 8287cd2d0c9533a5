//! Request conversions between the two protocols.

use serde_json::Value;

use crate::messages::{anthropic, openai};

/// Convert an Anthropic Messages request into the internal OpenAI shape.
///
/// - The top-level system prompt becomes a prepended `system`-role message.
/// - A user turn containing `tool_result` blocks becomes tool-role messages
///   (one per result); remaining text parts become separate user messages
///   emitted after the tool messages, never merged with them.
/// - An assistant turn containing `tool_use` blocks becomes a single
///   assistant message whose `content` is the concatenation of its text
///   blocks and whose `tool_calls` carry the JSON-stringified inputs.
pub fn messages_request_to_chat(request: anthropic::MessagesRequest) -> openai::ChatRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = &request.system {
        messages.push(openai::ChatMessage::text(openai::Role::System, system.text()));
    }

    for message in request.messages {
        match message.role {
            anthropic::Role::User => convert_user_turn(message.content, &mut messages),
            anthropic::Role::Assistant => convert_assistant_turn(message.content, &mut messages),
        }
    }

    let tools = request.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| openai::Tool {
                kind: openai::ToolCallKind::Function,
                function: openai::FunctionDefinition {
                    name: tool.name,
                    description: tool.description,
                    parameters: tool.input_schema,
                },
            })
            .collect()
    });

    let user = request
        .metadata
        .as_ref()
        .and_then(|metadata| metadata.user_id.clone());

    // The OpenAI shape has its own extension bag, but blindly forwarding
    // Anthropic-only keys would confuse the upstream; they are dropped
    // deterministically instead.
    for key in request.extra.keys() {
        log::debug!("Dropping unmodelled request field '{key}' during protocol conversion");
    }

    openai::ChatRequest {
        model: request.model,
        messages,
        tools,
        tool_choice: request.tool_choice.map(convert_tool_choice),
        max_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences,
        stream: request.stream,
        user,
        extra: Default::default(),
    }
}

fn convert_user_turn(content: anthropic::MessageContent, out: &mut Vec<openai::ChatMessage>) {
    let blocks = content.blocks();

    let mut texts = Vec::new();

    for block in &blocks {
        match block {
            anthropic::ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                out.push(openai::ChatMessage {
                    role: openai::Role::Tool,
                    content: Some(content.as_ref().map(|c| c.text()).unwrap_or_default()),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                });
            }
            anthropic::ContentBlock::Text { text } => texts.push(text.clone()),
            anthropic::ContentBlock::ToolUse { .. } => {
                log::warn!("Dropping tool_use block found in a user turn");
            }
            anthropic::ContentBlock::Unknown(value) => {
                log::debug!(
                    "Dropping unmodelled content block in user turn: {}",
                    block_type_name(value)
                );
            }
        }
    }

    // Text parts always follow the tool results they accompany.
    for text in texts {
        out.push(openai::ChatMessage::text(openai::Role::User, text));
    }
}

fn convert_assistant_turn(content: anthropic::MessageContent, out: &mut Vec<openai::ChatMessage>) {
    let blocks = content.blocks();

    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
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
                log::warn!("Dropping tool_result block found in an assistant turn");
            }
            anthropic::ContentBlock::Unknown(value) => {
                log::debug!(
                    "Dropping unmodelled content block in assistant turn: {}",
                    block_type_name(&value)
                );
            }
        }
    }

    out.push(openai::ChatMessage {
        role: openai::Role::Assistant,
        content: if text.is_empty() && !tool_calls.is_empty() {
            None
        } else {
            Some(text)
        },
        tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
        tool_call_id: None,
    });
}

fn convert_tool_choice(choice: anthropic::ToolChoice) -> openai::ToolChoice {
    match choice {
        anthropic::ToolChoice::Auto => openai::ToolChoice::Mode(openai::ToolChoiceMode::Auto),
        anthropic::ToolChoice::Any => openai::ToolChoice::Mode(openai::ToolChoiceMode::Required),
        anthropic::ToolChoice::Tool { name } => openai::ToolChoice::Specific {
            kind: openai::ToolCallKind::Function,
            function: openai::FunctionChoice { name },
        },
    }
}

fn block_type_name(value: &Value) -> &str {
    value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("<untyped>")
}

/// Convert an internal OpenAI-shaped request into the Anthropic shape.
///
/// Provided for symmetry with [`messages_request_to_chat`]; the core path
/// does not need it, but the round-trip property tests do.
pub fn chat_request_to_messages(request: openai::ChatRequest) -> anthropic::MessagesRequest {
    let mut system = String::new();
    let mut messages: Vec<anthropic::InputMessage> = Vec::with_capacity(request.messages.len());

    for message in request.messages {
        match message.role {
            openai::Role::System => {
                system.push_str(message.content.as_deref().unwrap_or_default());
            }
            openai::Role::User => {
                messages.push(anthropic::InputMessage {
                    role: anthropic::Role::User,
                    content: anthropic::MessageContent::Text(message.content.unwrap_or_default()),
                });
            }
            openai::Role::Assistant => {
                let mut blocks = Vec::new();

                if let Some(text) = message.content.filter(|text| !text.is_empty()) {
                    blocks.push(anthropic::ContentBlock::Text { text });
                }

                for call in message.tool_calls.unwrap_or_default() {
                    blocks.push(anthropic::ContentBlock::ToolUse {
                        id: call.id,
                        name: call.function.name,
                        input: super::parse_argument_string(&call.function.arguments),
                    });
                }

                messages.push(anthropic::InputMessage {
                    role: anthropic::Role::Assistant,
                    content: anthropic::MessageContent::Blocks(blocks),
                });
            }
            openai::Role::Tool => {
                messages.push(anthropic::InputMessage {
                    role: anthropic::Role::User,
                    content: anthropic::MessageContent::Blocks(vec![anthropic::ContentBlock::ToolResult {
                        tool_use_id: message.tool_call_id.unwrap_or_default(),
                        content: message
                            .content
                            .map(anthropic::ToolResultContent::Text),
                        is_error: None,
                    }]),
                });
            }
        }
    }

    let tools = request.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| anthropic::Tool {
                name: tool.function.name,
                description: tool.function.description,
                input_schema: tool.function.parameters,
            })
            .collect()
    });

    let tool_choice = request.tool_choice.map(|choice| match choice {
        openai::ToolChoice::Mode(openai::ToolChoiceMode::Auto | openai::ToolChoiceMode::None) => {
            anthropic::ToolChoice::Auto
        }
        openai::ToolChoice::Mode(openai::ToolChoiceMode::Required) => anthropic::ToolChoice::Any,
        openai::ToolChoice::Specific { function, .. } => anthropic::ToolChoice::Tool {
            name: function.name,
        },
    });

    anthropic::MessagesRequest {
        model: request.model,
        messages,
        max_tokens: request.max_tokens.unwrap_or(4096),
        system: if system.is_empty() {
            None
        } else {
            Some(anthropic::SystemPrompt::Text(system))
        },
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences: request.stop,
        stream: request.stream,
        metadata: request.user.map(|user_id| anthropic::Metadata {
            user_id: Some(user_id),
        }),
        tools,
        tool_choice,
        extra: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_json_snapshot;
    use serde_json::json;

    use super::*;

    fn weather_request() -> anthropic::MessagesRequest {
        serde_json::from_value(json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 1024,
            "system": "You are a weather bot.",
            "messages": [
                {"role": "user", "content": "What's the weather in SF?"},
                {
                    "role": "assistant",
                    "content": [
                        {"type": "text", "text": "Let me check."},
                        {
                            "type": "tool_use",
                            "id": "toolu_1",
                            "name": "get_weather",
                            "input": {"location": "SF"}
                        }
                    ]
                },
                {
                    "role": "user",
                    "content": [
                        {
                            "type": "tool_result",
                            "tool_use_id": "toolu_1",
                            "content": "72F and sunny"
                        },
                        {"type": "text", "text": "And tomorrow?"}
                    ]
                }
            ],
            "tools": [{
                "name": "get_weather",
                "description": "Get the weather",
                "input_schema": {"type": "object", "properties": {"location": {"type": "string"}}}
            }]
        }))
        .unwrap()
    }

    #[test]
    fn converts_full_tool_conversation() {
        let chat = messages_request_to_chat(weather_request());

        assert_json_snapshot!(chat, @r#"
        {
          "model": "claude-sonnet-4-20250514",
          "messages": [
            {
              "role": "system",
              "content": "You are a weather bot."
            },
            {
              "role": "user",
              "content": "What's the weather in SF?"
            },
            {
              "role": "assistant",
              "content": "Let me check.",
              "tool_calls": [
                {
                  "id": "toolu_1",
                  "type": "function",
                  "function": {
                    "name": "get_weather",
                    "arguments": "{\"location\":\"SF\"}"
                  }
                }
              ]
            },
            {
              "role": "tool",
              "content": "72F and sunny",
              "tool_call_id": "toolu_1"
            },
            {
              "role": "user",
              "content": "And tomorrow?"
            }
          ],
          "tools": [
            {
              "type": "function",
              "function": {
                "name": "get_weather",
                "description": "Get the weather",
                "parameters": {
                  "properties": {
                    "location": {
                      "type": "string"
                    }
                  },
                  "type": "object"
                }
              }
            }
          ],
          "max_tokens": 1024
        }
        "#);
    }

    #[test]
    fn tool_result_text_never_merges_into_tool_message() {
        let chat = messages_request_to_chat(weather_request());

        let tool_position = chat
            .messages
            .iter()
            .position(|m| m.role == openai::Role::Tool)
            .unwrap();
        let trailing_user = &chat.messages[tool_position + 1];

        assert_eq!(trailing_user.role, openai::Role::User);
        assert_eq!(trailing_user.content.as_deref(), Some("And tomorrow?"));
    }

    #[test]
    fn assistant_tool_only_turn_has_null_content() {
        let request: anthropic::MessagesRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 100,
            "messages": [{
                "role": "assistant",
                "content": [{
                    "type": "tool_use",
                    "id": "toolu_2",
                    "name": "list_files",
                    "input": {}
                }]
            }]
        }))
        .unwrap();

        let chat = messages_request_to_chat(request);
        assert_eq!(chat.messages[0].content, None);
        assert_eq!(chat.messages[0].tool_calls.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn session_user_id_maps_to_user_field() {
        let request: anthropic::MessagesRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 100,
            "metadata": {"user_id": "user_abc_account__session_0f0f"},
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();

        let chat = messages_request_to_chat(request);
        assert_eq!(chat.user.as_deref(), Some("user_abc_account__session_0f0f"));
    }

    #[test]
    fn round_trip_on_schema_intersection() {
        let original = weather_request();
        let round_tripped = chat_request_to_messages(messages_request_to_chat(original.clone()));

        // Compare through JSON to ignore representation differences
        // (string content vs single text block).
        let original_chat = serde_json::to_value(messages_request_to_chat(original)).unwrap();
        let round_tripped_chat =
            serde_json::to_value(messages_request_to_chat(round_tripped)).unwrap();

        assert_eq!(original_chat, round_tripped_chat);
    }
}
