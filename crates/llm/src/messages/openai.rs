//! OpenAI chat-completions protocol types.
//!
//! These types double as Warden's internal representation: Anthropic
//! requests are normalized into [`ChatRequest`] at ingress, the upstream
//! client speaks [`ChatChunk`]/[`ChatResponse`], and policies operate on
//! these shapes regardless of the client's protocol.
//!
//! Unknown keys on requests and responses are preserved in flattened
//! extension maps so provider-specific fields survive the round trip.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body for the chat completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier, optionally provider-prefixed (`openai/gpt-4o-mini`).
    pub model: String,

    /// Conversation messages in order.
    pub messages: Vec<ChatMessage>,

    /// Tools the model may call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    /// Controls whether/which tool the model must use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    /// Maximum number of tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling cutoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Sequences that stop generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    /// Whether the response is streamed as SSE chunks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// End-user identifier forwarded to the provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Provider-opaque passthrough fields, preserved by key.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ChatRequest {
    /// Whether the client asked for a streaming response.
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// A single conversation message.
///
/// Invariants (enforced at the conversion boundary, not by serde):
/// assistant messages carrying `tool_calls` have `content` null or a string;
/// tool messages carry a `tool_call_id` referring to a prior assistant
/// tool call in the same sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who sent the message.
    pub role: Role,

    /// Text content. Null for assistant messages that only call tools.
    pub content: Option<String>,

    /// Tool calls made by the assistant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// For tool messages: the id of the tool call this answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// A plain text message with the given role.
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Message sender role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Tool execution result.
    Tool,
}

/// A completed tool call on an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier, used to correlate the tool result.
    pub id: String,

    /// Always `"function"`.
    #[serde(rename = "type")]
    pub kind: ToolCallKind,

    /// The function invocation.
    pub function: FunctionCall,
}

/// Tool call discriminator. Only functions exist today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallKind {
    /// A function invocation.
    #[default]
    Function,
}

/// Function name plus raw JSON arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Function name.
    pub name: String,
    /// Arguments as a JSON string. Never parsed by the streaming core.
    pub arguments: String,
}

/// A tool definition offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Always `"function"`.
    #[serde(rename = "type")]
    pub kind: ToolCallKind,

    /// The function specification.
    pub function: FunctionDefinition,
}

/// Function specification for a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    /// Unique function name.
    pub name: String,

    /// What the function does, shown to the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON Schema of the accepted arguments.
    pub parameters: Value,
}

/// Tool usage control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// `"none"`, `"auto"` or `"required"`.
    Mode(ToolChoiceMode),
    /// Force a specific function.
    Specific {
        /// Always `"function"`.
        #[serde(rename = "type")]
        kind: ToolCallKind,
        /// The function the model must call.
        function: FunctionChoice,
    },
}

/// Mode-based tool choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoiceMode {
    /// Tools are disabled for this request.
    None,
    /// The model decides.
    Auto,
    /// The model must call at least one tool.
    Required,
}

/// Names the function for a specific tool choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionChoice {
    /// Function name, case-sensitive.
    pub name: String,
}

/// Non-streaming chat completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Completion identifier (`chatcmpl-…`).
    pub id: String,

    /// Always `"chat.completion"`.
    pub object: ObjectType,

    /// Unix timestamp of creation.
    pub created: u64,

    /// Model that produced the response.
    pub model: String,

    /// Response candidates; index 0 is the primary one.
    pub choices: Vec<Choice>,

    /// Token accounting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Provider-opaque passthrough fields, preserved by key.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One response candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    /// Candidate index, starting at 0.
    pub index: u32,
    /// The generated message.
    pub message: ChatMessage,
    /// Why generation stopped.
    pub finish_reason: Option<FinishReason>,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    pub prompt_tokens: u32,
    /// Tokens in the completion.
    pub completion_tokens: u32,
    /// Sum of the two.
    pub total_tokens: u32,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of the response.
    Stop,
    /// Token limit reached; the response may be truncated.
    Length,
    /// The model made tool calls.
    ToolCalls,
    /// Content was filtered by the provider.
    ContentFilter,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishReason::Stop => write!(f, "stop"),
            FinishReason::Length => write!(f, "length"),
            FinishReason::ToolCalls => write!(f, "tool_calls"),
            FinishReason::ContentFilter => write!(f, "content_filter"),
        }
    }
}

/// Object type discriminator on responses and chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    /// A complete chat completion.
    #[serde(rename = "chat.completion")]
    ChatCompletion,
    /// One streaming increment.
    #[serde(rename = "chat.completion.chunk")]
    ChatCompletionChunk,
}

/// A single streaming increment.
///
/// Parsing a provider chunk into this type is the normalization step: the
/// delta becomes a structured value and `finish_reason` is preserved
/// verbatim, including a legitimate `null` on intermediate chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunk {
    /// Completion identifier, stable across the stream.
    pub id: String,

    /// Always `"chat.completion.chunk"`.
    pub object: ObjectType,

    /// Unix timestamp of creation.
    pub created: u64,

    /// Model generating the stream.
    pub model: String,

    /// Incremental choice updates; usually a single entry at index 0.
    pub choices: Vec<ChunkChoice>,

    /// Cumulative usage, present on the final chunk for some providers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatChunk {
    /// A chunk carrying a plain text delta.
    pub fn text(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: synthetic_chunk_id(),
            object: ObjectType::ChatCompletionChunk,
            created: 0,
            model: model.into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: None,
                    content: Some(content.into()),
                    tool_calls: None,
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    /// A chunk carrying a complete tool call in a single delta.
    pub fn tool_call(call: ToolCall, index: u32, model: impl Into<String>) -> Self {
        Self {
            id: synthetic_chunk_id(),
            object: ObjectType::ChatCompletionChunk,
            created: 0,
            model: model.into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: None,
                    content: None,
                    tool_calls: Some(vec![ToolCallDelta {
                        index,
                        id: Some(call.id),
                        kind: Some(ToolCallKind::Function),
                        function: Some(FunctionDelta {
                            name: Some(call.function.name),
                            arguments: Some(call.function.arguments),
                        }),
                    }]),
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    /// A chunk carrying only a finish reason.
    pub fn finish(reason: FinishReason, model: impl Into<String>) -> Self {
        Self {
            id: synthetic_chunk_id(),
            object: ObjectType::ChatCompletionChunk,
            created: 0,
            model: model.into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta::default(),
                finish_reason: Some(reason),
            }],
            usage: None,
        }
    }

    /// The delta of the primary choice, if any.
    pub fn primary_delta(&self) -> Option<&Delta> {
        self.choices.first().map(|choice| &choice.delta)
    }

    /// The finish reason of the primary choice, if any.
    pub fn primary_finish_reason(&self) -> Option<FinishReason> {
        self.choices.first().and_then(|choice| choice.finish_reason)
    }
}

fn synthetic_chunk_id() -> String {
    format!("chatcmpl-warden-{}", uuid::Uuid::new_v4().simple())
}

/// Incremental update for one choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Choice index, usually 0.
    pub index: u32,
    /// The content to append.
    pub delta: Delta,
    /// Set on the terminal chunk for this choice, otherwise null.
    pub finish_reason: Option<FinishReason>,
}

/// Incremental message content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    /// Role, present on the first chunk only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,

    /// New text to append.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Incremental tool call updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// One fragment of a streamed tool call.
///
/// The first fragment for an index names the call (`id`, `function.name`);
/// subsequent fragments only append to `function.arguments`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Tool call index, stable across the stream.
    pub index: u32,

    /// Tool call id, present on the first fragment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// `"function"`, present on the first fragment.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ToolCallKind>,

    /// Function name and/or arguments fragment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionDelta>,
}

/// Incremental function data inside a tool call fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDelta {
    /// Function name, present on the first fragment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// JSON fragment to append to the arguments string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Error payload in the OpenAI wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// The error details.
    pub error: ErrorDetail,
}

/// Error details in the OpenAI wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Human-readable message.
    pub message: String,
    /// Error type string, e.g. `invalid_request_error`.
    #[serde(rename = "type")]
    pub error_type: String,
    /// HTTP status code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

#[cfg(test)]
mod tests {
    use insta::assert_json_snapshot;
    use serde_json::json;

    use super::*;

    #[test]
    fn deserialize_request_preserves_unknown_fields() {
        let request: ChatRequest = serde_json::from_value(json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "Say hi"}],
            "stream": true,
            "logit_bias": {"50256": -100},
            "seed": 42
        }))
        .unwrap();

        assert_eq!(request.model, "gpt-4o-mini");
        assert!(request.is_streaming());
        assert_eq!(request.extra.get("seed"), Some(&json!(42)));
        assert_eq!(request.extra.get("logit_bias"), Some(&json!({"50256": -100})));
    }

    #[test]
    fn intermediate_chunk_keeps_null_finish_reason() {
        let chunk: ChatChunk = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 1,
            "model": "gpt-4o-mini",
            "choices": [{"index": 0, "delta": {"content": "H"}, "finish_reason": null}]
        }))
        .unwrap();

        assert_eq!(chunk.primary_finish_reason(), None);
        assert_eq!(chunk.primary_delta().unwrap().content.as_deref(), Some("H"));
    }

    #[test]
    fn tool_call_fragments_deserialize() {
        let chunk: ChatChunk = serde_json::from_value(json!({
            "id": "chatcmpl-2",
            "object": "chat.completion.chunk",
            "created": 1,
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "delta": {
                    "tool_calls": [{
                        "index": 0,
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": ""}
                    }]
                },
                "finish_reason": null
            }]
        }))
        .unwrap();

        let delta = chunk.primary_delta().unwrap();
        let fragment = &delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(fragment.id.as_deref(), Some("call_abc"));
        assert_eq!(
            fragment.function.as_ref().unwrap().name.as_deref(),
            Some("get_weather")
        );
    }

    #[test]
    fn serialize_assistant_tool_call_message() {
        let message = ChatMessage {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(vec![ToolCall {
                id: "call_1".to_string(),
                kind: ToolCallKind::Function,
                function: FunctionCall {
                    name: "get_weather".to_string(),
                    arguments: r#"{"location":"SF"}"#.to_string(),
                },
            }]),
            tool_call_id: None,
        };

        assert_json_snapshot!(message, @r#"
        {
          "role": "assistant",
          "content": null,
          "tool_calls": [
            {
              "id": "call_1",
              "type": "function",
              "function": {
                "name": "get_weather",
                "arguments": "{\"location\":\"SF\"}"
              }
            }
          ]
        }
        "#);
    }

    #[test]
    fn finish_chunk_round_trips() {
        let chunk = ChatChunk::finish(FinishReason::Stop, "gpt-4o-mini");
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
        assert_eq!(value["object"], "chat.completion.chunk");

        let parsed: ChatChunk = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.primary_finish_reason(), Some(FinishReason::Stop));
    }

    #[test]
    fn tool_choice_shapes() {
        let auto: ToolChoice = serde_json::from_value(json!("auto")).unwrap();
        assert!(matches!(auto, ToolChoice::Mode(ToolChoiceMode::Auto)));

        let specific: ToolChoice = serde_json::from_value(json!({
            "type": "function",
            "function": {"name": "get_weather"}
        }))
        .unwrap();
        assert!(matches!(specific, ToolChoice::Specific { .. }));
    }
}
