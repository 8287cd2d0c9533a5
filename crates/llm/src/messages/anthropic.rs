//! Anthropic Messages protocol types.
//!
//! The format differs from the OpenAI shape in several ways that matter to
//! the converters:
//! - the system prompt is a top-level field, either a string or an array of
//!   text blocks
//! - message content is an array of typed blocks (or a bare string)
//! - tool interactions use `tool_use`/`tool_result` blocks instead of
//!   `tool_calls`/tool-role messages
//! - streaming is a named-event SSE sequence rather than uniform chunks

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body for the Messages API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    /// Model identifier, e.g. `claude-sonnet-4-20250514`.
    pub model: String,

    /// Conversation turns, alternating user and assistant.
    pub messages: Vec<InputMessage>,

    /// Maximum number of tokens to generate. Required by the API.
    pub max_tokens: u32,

    /// System prompt, separate from the messages array.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,

    /// Sampling temperature (0.0 to 1.0).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling cutoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Sequences that stop generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    /// Whether to stream the response as SSE events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Request metadata; `user_id` may carry a session suffix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,

    /// Tools the model may use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    /// Controls how the model uses tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    /// Fields this gateway does not model, preserved by key.
    #[serde(flatten)]
    pub extra: std::collections::BTreeMap<String, Value>,
}

/// The system prompt: a plain string or an array of text blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    /// Simple string form.
    Text(String),
    /// Structured form; only the text parts are meaningful here.
    Blocks(Vec<SystemBlock>),
}

impl SystemPrompt {
    /// Concatenation of all text parts.
    pub fn text(&self) -> String {
        match self {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => blocks.iter().map(|block| block.text.as_str()).collect(),
        }
    }
}

/// One block of a structured system prompt. Only text blocks carry content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    /// Always `"text"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The text content.
    #[serde(default)]
    pub text: String,
}

/// An input message with role and content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputMessage {
    /// The role of the message sender.
    pub role: Role,
    /// Bare string or an array of content blocks.
    pub content: MessageContent,
}

/// Message content: a bare string or typed blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Shorthand for a single text block.
    Text(String),
    /// Typed content blocks.
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// View the content as a slice of blocks, wrapping a bare string.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match self {
            MessageContent::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
            MessageContent::Blocks(blocks) => blocks.clone(),
        }
    }
}

/// Role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User message.
    User,
    /// Assistant message.
    Assistant,
}

/// Content block in a message or response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },

    /// Tool use request from the assistant.
    ToolUse {
        /// Unique identifier for this tool use.
        id: String,
        /// Name of the tool.
        name: String,
        /// Input parameters for the tool.
        input: Value,
    },

    /// Result of a tool execution, sent back by the user.
    ToolResult {
        /// The `tool_use` id this result answers.
        tool_use_id: String,
        /// The result content.
        #[serde(default)]
        content: Option<ToolResultContent>,
        /// Whether the execution failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },

    /// Block types this gateway does not model (images, documents, …).
    /// Preserved so parsing never fails; converters drop them with a log
    /// line.
    #[serde(untagged)]
    Unknown(Value),
}

/// Content of a tool result: a bare string or nested blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    /// Simple string result.
    Text(String),
    /// Structured result blocks.
    Blocks(Vec<ToolResultBlock>),
}

impl ToolResultContent {
    /// Concatenation of all text parts.
    pub fn text(&self) -> String {
        match self {
            ToolResultContent::Text(text) => text.clone(),
            ToolResultContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ToolResultBlock::Text { text } => Some(text.as_str()),
                    ToolResultBlock::Unknown(_) => None,
                })
                .collect(),
        }
    }
}

/// One block of a structured tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultBlock {
    /// Text result.
    Text {
        /// The text content.
        text: String,
    },
    /// Unmodelled block types, preserved verbatim.
    #[serde(untagged)]
    Unknown(Value),
}

/// Request metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Opaque end-user identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// The name of the tool.
    pub name: String,

    /// What the tool does.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON Schema of the tool input.
    pub input_schema: Value,
}

/// Tool choice configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    /// Let the model decide.
    Auto,
    /// Force the model to use any available tool.
    Any,
    /// Force a specific tool.
    Tool {
        /// The tool to use.
        name: String,
    },
}

/// Response from the Messages API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    /// Message identifier (`msg_…`).
    pub id: String,

    /// Always `"message"`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Always `"assistant"`.
    pub role: Role,

    /// The response content blocks.
    pub content: Vec<ContentBlock>,

    /// The model that generated the response.
    pub model: String,

    /// Why generation stopped.
    pub stop_reason: Option<StopReason>,

    /// The stop sequence encountered, if any.
    pub stop_sequence: Option<String>,

    /// Token usage.
    pub usage: Usage,
}

/// The reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural stopping point.
    EndTurn,
    /// Token limit reached.
    MaxTokens,
    /// A stop sequence was generated.
    StopSequence,
    /// The model invoked a tool.
    ToolUse,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndTurn => write!(f, "end_turn"),
            StopReason::MaxTokens => write!(f, "max_tokens"),
            StopReason::StopSequence => write!(f, "stop_sequence"),
            StopReason::ToolUse => write!(f, "tool_use"),
        }
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Number of input tokens.
    pub input_tokens: u32,
    /// Number of output tokens.
    pub output_tokens: u32,
}

/// Error envelope (`{"type": "error", "error": {...}}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always `"error"`.
    #[serde(rename = "type")]
    pub kind: String,

    /// The error details.
    pub error: ErrorDetail,
}

impl ErrorResponse {
    /// Build the standard envelope around an error type and message.
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            error: ErrorDetail {
                error_type: error_type.into(),
                message: message.into(),
            },
        }
    }
}

/// Error details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error type, e.g. `authentication_error` or `overloaded_error`.
    #[serde(rename = "type")]
    pub error_type: String,

    /// Human-readable message.
    pub message: String,
}

/// Streaming event surface of the Messages API.
///
/// A stream begins with `message_start`, emits one or more block lifecycles
/// (`content_block_start` → `content_block_delta`* → `content_block_stop`),
/// reports the stop reason in `message_delta` and ends with `message_stop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Announces the streamed message.
    MessageStart {
        /// Initial message metadata.
        message: StreamMessageStart,
    },

    /// A content block begins.
    ContentBlockStart {
        /// Block index, reused by delta and stop events.
        index: u32,
        /// The block being started.
        content_block: ContentBlock,
    },

    /// Incremental update for the indexed block.
    ContentBlockDelta {
        /// Block index.
        index: u32,
        /// The delta payload.
        delta: ContentDelta,
    },

    /// The indexed block is finished.
    ContentBlockStop {
        /// Block index.
        index: u32,
    },

    /// Top-level message changes (stop reason, cumulative usage).
    MessageDelta {
        /// The delta payload.
        delta: MessageDeltaBody,
        /// Cumulative usage, when provided.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    /// No further events follow.
    MessageStop,

    /// Heartbeat; may appear at any point.
    Ping,

    /// In-stream error without tearing down the connection.
    Error {
        /// The error details.
        error: ErrorDetail,
    },
}

impl StreamEvent {
    /// The SSE `event:` name for this event.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Ping => "ping",
            StreamEvent::Error { .. } => "error",
        }
    }
}

/// Metadata carried by `message_start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessageStart {
    /// Message identifier.
    pub id: String,

    /// Always `"message"`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Always `"assistant"`.
    pub role: Role,

    /// Initially empty content array.
    pub content: Vec<ContentBlock>,

    /// The model emitting the stream.
    pub model: String,

    /// Stop reason, null at stream start.
    pub stop_reason: Option<StopReason>,

    /// Stop sequence, null at stream start.
    pub stop_sequence: Option<String>,

    /// Usage snapshot at stream start.
    pub usage: Usage,
}

/// Delta payload of `content_block_delta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    /// Streaming text.
    TextDelta {
        /// Additional text.
        text: String,
    },

    /// Partial JSON for a tool input.
    InputJsonDelta {
        /// JSON fragment to append.
        partial_json: String,
    },
}

/// Delta payload of `message_delta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    /// Stop reason once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,

    /// Stop sequence if one was encountered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
}
