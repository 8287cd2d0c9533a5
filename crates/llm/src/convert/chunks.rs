//! The stateful Anthropic-event → OpenAI-chunk assembler.

use std::collections::HashMap;

use crate::messages::{anthropic, openai};

/// Per-stream state machine turning Anthropic message-stream events into
/// internal OpenAI-shaped chunks.
///
/// Inverse of [`super::SseAssembler`]: the message id and model are taken
/// from `message_start`, Anthropic block indices are mapped onto dense
/// provider tool-call indices, and `message_delta` becomes the terminal
/// finish-reason chunk.
pub struct ChunkAssembler {
    chunk_id: String,
    model: String,
    /// Maps Anthropic block index → provider tool-call index.
    tool_indices: HashMap<u32, u32>,
    next_tool_index: u32,
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkAssembler {
    /// Create an assembler for one stream.
    pub fn new() -> Self {
        Self {
            chunk_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: String::new(),
            tool_indices: HashMap::new(),
            next_tool_index: 0,
        }
    }

    /// Feed one event, producing at most one chunk.
    pub fn feed(&mut self, event: anthropic::StreamEvent) -> Option<openai::ChatChunk> {
        match event {
            anthropic::StreamEvent::MessageStart { message } => {
                self.chunk_id = message.id;
                self.model = message.model;

                Some(self.chunk(
                    openai::Delta {
                        role: Some(openai::Role::Assistant),
                        content: None,
                        tool_calls: None,
                    },
                    None,
                    None,
                ))
            }
            anthropic::StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                anthropic::ContentBlock::Text { text } => {
                    if text.is_empty() {
                        None
                    } else {
                        Some(self.content_chunk(text))
                    }
                }
                anthropic::ContentBlock::ToolUse { id, name, input } => {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_indices.insert(index, tool_index);

                    let arguments = if input.as_object().is_some_and(|map| map.is_empty()) {
                        String::new()
                    } else {
                        serde_json::to_string(&input).unwrap_or_default()
                    };

                    Some(self.chunk(
                        openai::Delta {
                            role: None,
                            content: None,
                            tool_calls: Some(vec![openai::ToolCallDelta {
                                index: tool_index,
                                id: Some(id),
                                kind: Some(openai::ToolCallKind::Function),
                                function: Some(openai::FunctionDelta {
                                    name: Some(name),
                                    arguments: Some(arguments),
                                }),
                            }]),
                        },
                        None,
                        None,
                    ))
                }
                other => {
                    log::debug!("Ignoring unmodelled content_block_start: {other:?}");
                    None
                }
            },
            anthropic::StreamEvent::ContentBlockDelta { index, delta } => match delta {
                anthropic::ContentDelta::TextDelta { text } => Some(self.content_chunk(text)),
                anthropic::ContentDelta::InputJsonDelta { partial_json } => {
                    let Some(tool_index) = self.tool_indices.get(&index).copied() else {
                        log::warn!("input_json_delta for unknown block index {index}");
                        return None;
                    };

                    Some(self.chunk(
                        openai::Delta {
                            role: None,
                            content: None,
                            tool_calls: Some(vec![openai::ToolCallDelta {
                                index: tool_index,
                                id: None,
                                kind: None,
                                function: Some(openai::FunctionDelta {
                                    name: None,
                                    arguments: Some(partial_json),
                                }),
                            }]),
                        },
                        None,
                        None,
                    ))
                }
            },
            anthropic::StreamEvent::MessageDelta { delta, usage } => {
                let finish_reason = delta.stop_reason.map(super::stop_to_finish_reason);
                let usage = usage.map(|usage| openai::Usage {
                    prompt_tokens: usage.input_tokens,
                    completion_tokens: usage.output_tokens,
                    total_tokens: usage.input_tokens + usage.output_tokens,
                });

                Some(self.chunk(openai::Delta::default(), finish_reason, usage))
            }
            anthropic::StreamEvent::ContentBlockStop { .. }
            | anthropic::StreamEvent::MessageStop
            | anthropic::StreamEvent::Ping => None,
            anthropic::StreamEvent::Error { error } => {
                log::warn!(
                    "In-stream error event from upstream: {} ({})",
                    error.message,
                    error.error_type
                );
                None
            }
        }
    }

    fn content_chunk(&self, text: String) -> openai::ChatChunk {
        self.chunk(
            openai::Delta {
                role: None,
                content: Some(text),
                tool_calls: None,
            },
            None,
            None,
        )
    }

    fn chunk(
        &self,
        delta: openai::Delta,
        finish_reason: Option<openai::FinishReason>,
        usage: Option<openai::Usage>,
    ) -> openai::ChatChunk {
        openai::ChatChunk {
            id: self.chunk_id.clone(),
            object: openai::ObjectType::ChatCompletionChunk,
            created: 0,
            model: self.model.clone(),
            choices: vec![openai::ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event(value: serde_json::Value) -> anthropic::StreamEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn message_start_yields_role_chunk_and_captures_identity() {
        let mut assembler = ChunkAssembler::new();

        let chunk = assembler
            .feed(event(json!({
                "type": "message_start",
                "message": {
                    "id": "msg_1",
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": "claude-sonnet-4-20250514",
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 10, "output_tokens": 0}
                }
            })))
            .unwrap();

        assert_eq!(chunk.id, "msg_1");
        assert_eq!(chunk.model, "claude-sonnet-4-20250514");
        assert_eq!(chunk.primary_delta().unwrap().role, Some(openai::Role::Assistant));
    }

    #[test]
    fn tool_use_blocks_map_to_dense_tool_indices() {
        let mut assembler = ChunkAssembler::new();

        // Text block occupies Anthropic index 0; tool blocks arrive at 1, 2.
        let first = assembler
            .feed(event(json!({
                "type": "content_block_start",
                "index": 1,
                "content_block": {"type": "tool_use", "id": "toolu_1", "name": "a", "input": {}}
            })))
            .unwrap();
        let second = assembler
            .feed(event(json!({
                "type": "content_block_start",
                "index": 2,
                "content_block": {"type": "tool_use", "id": "toolu_2", "name": "b", "input": {}}
            })))
            .unwrap();

        let index_of = |chunk: &openai::ChatChunk| {
            chunk.primary_delta().unwrap().tool_calls.as_ref().unwrap()[0].index
        };
        assert_eq!(index_of(&first), 0);
        assert_eq!(index_of(&second), 1);

        // Fragment for Anthropic index 2 lands on provider index 1.
        let fragment = assembler
            .feed(event(json!({
                "type": "content_block_delta",
                "index": 2,
                "delta": {"type": "input_json_delta", "partial_json": "{\"x\":1}"}
            })))
            .unwrap();
        assert_eq!(index_of(&fragment), 1);
    }

    #[test]
    fn text_delta_becomes_content_chunk() {
        let mut assembler = ChunkAssembler::new();

        let chunk = assembler
            .feed(event(json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": "Hello"}
            })))
            .unwrap();

        assert_eq!(chunk.primary_delta().unwrap().content.as_deref(), Some("Hello"));
    }

    #[test]
    fn message_delta_becomes_finish_chunk() {
        let mut assembler = ChunkAssembler::new();

        let chunk = assembler
            .feed(event(json!({
                "type": "message_delta",
                "delta": {"stop_reason": "tool_use"},
                "usage": {"input_tokens": 5, "output_tokens": 7}
            })))
            .unwrap();

        assert_eq!(
            chunk.primary_finish_reason(),
            Some(openai::FinishReason::ToolCalls)
        );
        assert_eq!(chunk.usage.unwrap().total_tokens, 12);
    }

    #[test]
    fn lifecycle_events_produce_no_chunks() {
        let mut assembler = ChunkAssembler::new();

        assert!(assembler.feed(event(json!({"type": "ping"}))).is_none());
        assert!(
            assembler
                .feed(event(json!({"type": "content_block_stop", "index": 0})))
                .is_none()
        );
        assert!(assembler.feed(event(json!({"type": "message_stop"}))).is_none());
    }
}
