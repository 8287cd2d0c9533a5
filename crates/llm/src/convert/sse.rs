//! The stateful OpenAI-chunk → Anthropic-event assembler.

use crate::messages::{anthropic, openai};

/// Per-stream state machine turning internal chunks into the Anthropic
/// message-stream event sequence.
///
/// Discipline enforced here: exactly one `message_start` and one
/// `message_stop` per stream, exactly one `content_block_start` and one
/// `content_block_stop` per block, blocks indexed in emission order (text
/// block at 0 when present, tool blocks following).
///
/// The assembler never buffers: every fed chunk yields its events
/// immediately, and `input_json_delta` events are forwarded one per
/// arguments fragment.
pub struct SseAssembler {
    message_id: String,
    model: String,
    state: BlockState,
    started: bool,
    terminal_emitted: bool,
    /// Anthropic index assigned to the text block, when one was started.
    text_index: Option<u32>,
    /// Next free Anthropic block index.
    next_index: u32,
    /// Maps the provider's tool-call index to the Anthropic block index.
    tool_indices: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    BeforeMessage,
    BetweenBlocks,
    InTextBlock,
    InToolUseBlock { index: u32 },
}

impl SseAssembler {
    /// Create an assembler for one stream.
    ///
    /// `message_id` and `model` seed the `message_start` event.
    pub fn new(message_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            state: BlockState::BeforeMessage,
            started: false,
            terminal_emitted: false,
            text_index: None,
            next_index: 0,
            tool_indices: Vec::new(),
        }
    }

    /// Feed one chunk, producing zero or more events.
    pub fn feed(&mut self, chunk: &openai::ChatChunk) -> Vec<anthropic::StreamEvent> {
        let mut events = Vec::new();

        if self.terminal_emitted {
            log::warn!("Chunk received after terminal events were emitted; ignoring");
            return events;
        }

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        if chunk.choices.len() > 1 {
            log::warn!(
                "Streaming chunk carries {} choices; only index 0 is processed",
                chunk.choices.len()
            );
        }

        if let Some(content) = choice.delta.content.as_deref()
            && !content.is_empty()
        {
            self.ensure_started(&mut events);
            self.enter_text_block(&mut events);

            let index = self.text_index.unwrap_or(0);
            events.push(anthropic::StreamEvent::ContentBlockDelta {
                index,
                delta: anthropic::ContentDelta::TextDelta {
                    text: content.to_string(),
                },
            });
        }

        for fragment in choice.delta.tool_calls.as_deref().unwrap_or_default() {
            self.ensure_started(&mut events);
            self.feed_tool_fragment(fragment, &mut events);
        }

        if let Some(reason) = choice.finish_reason {
            self.ensure_started(&mut events);
            self.close_open_block(&mut events);

            events.push(anthropic::StreamEvent::MessageDelta {
                delta: anthropic::MessageDeltaBody {
                    stop_reason: Some(super::finish_to_stop_reason(reason)),
                    stop_sequence: None,
                },
                usage: chunk.usage.map(|usage| anthropic::Usage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                }),
            });
            events.push(anthropic::StreamEvent::MessageStop);
            self.terminal_emitted = true;
        }

        events
    }

    /// Close the stream when the source ended without a finish chunk.
    ///
    /// Returns the outstanding terminal events, or nothing when the finish
    /// chunk already produced them. A stream that never carried content
    /// yields nothing: no bytes were sent, so no sentinel is owed.
    pub fn end(&mut self) -> Vec<anthropic::StreamEvent> {
        let mut events = Vec::new();

        if self.terminal_emitted || !self.started {
            return events;
        }

        self.close_open_block(&mut events);
        events.push(anthropic::StreamEvent::MessageDelta {
            delta: anthropic::MessageDeltaBody {
                stop_reason: Some(anthropic::StopReason::EndTurn),
                stop_sequence: None,
            },
            usage: None,
        });
        events.push(anthropic::StreamEvent::MessageStop);
        self.terminal_emitted = true;

        events
    }

    /// Terminate the stream with an in-stream error.
    ///
    /// Emits the `error` event followed by `message_stop` when a
    /// `message_start` was already sent; at-most-once discipline holds.
    pub fn fail(&mut self, error: anthropic::StreamEvent) -> Vec<anthropic::StreamEvent> {
        let mut events = Vec::new();

        if self.terminal_emitted {
            return events;
        }

        self.close_open_block(&mut events);
        events.push(error);

        if self.started {
            events.push(anthropic::StreamEvent::MessageStop);
        }

        self.terminal_emitted = true;
        events
    }

    /// Whether `message_start` has been emitted.
    pub fn message_started(&self) -> bool {
        self.started
    }

    fn ensure_started(&mut self, events: &mut Vec<anthropic::StreamEvent>) {
        if self.started {
            return;
        }

        self.started = true;
        events.push(anthropic::StreamEvent::MessageStart {
            message: anthropic::StreamMessageStart {
                id: self.message_id.clone(),
                kind: "message".to_string(),
                role: anthropic::Role::Assistant,
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: anthropic::Usage::default(),
            },
        });
    }

    fn enter_text_block(&mut self, events: &mut Vec<anthropic::StreamEvent>) {
        match self.state {
            BlockState::InTextBlock => {}
            BlockState::InToolUseBlock { .. } => {
                // Content after tool blocks breaks the block-order
                // invariant; emit the transition and note the anomaly.
                log::warn!("Text delta after a tool-use block; forcing block transition");
                self.close_open_block(events);
                self.start_text_block(events);
            }
            BlockState::BeforeMessage | BlockState::BetweenBlocks => {
                self.start_text_block(events);
            }
        }
    }

    fn start_text_block(&mut self, events: &mut Vec<anthropic::StreamEvent>) {
        let index = self.next_index;
        self.next_index += 1;
        self.text_index = Some(index);
        self.state = BlockState::InTextBlock;

        events.push(anthropic::StreamEvent::ContentBlockStart {
            index,
            content_block: anthropic::ContentBlock::Text { text: String::new() },
        });
    }

    fn feed_tool_fragment(
        &mut self,
        fragment: &openai::ToolCallDelta,
        events: &mut Vec<anthropic::StreamEvent>,
    ) {
        let block_index = match self.lookup_tool_index(fragment.index) {
            Some(index) => index,
            None => {
                // First fragment for this tool call: close whatever block
                // is open and start the tool_use block.
                self.close_open_block(events);

                let index = self.next_index;
                self.next_index += 1;
                self.tool_indices.push((fragment.index, index));
                self.state = BlockState::InToolUseBlock { index };

                let id = fragment.id.clone().unwrap_or_default();
                let name = fragment
                    .function
                    .as_ref()
                    .and_then(|function| function.name.clone())
                    .unwrap_or_default();

                events.push(anthropic::StreamEvent::ContentBlockStart {
                    index,
                    content_block: anthropic::ContentBlock::ToolUse {
                        id,
                        name,
                        input: serde_json::Value::Object(serde_json::Map::new()),
                    },
                });

                index
            }
        };

        if let Some(arguments) = fragment
            .function
            .as_ref()
            .and_then(|function| function.arguments.as_deref())
            && !arguments.is_empty()
        {
            events.push(anthropic::StreamEvent::ContentBlockDelta {
                index: block_index,
                delta: anthropic::ContentDelta::InputJsonDelta {
                    partial_json: arguments.to_string(),
                },
            });
        }
    }

    fn lookup_tool_index(&self, provider_index: u32) -> Option<u32> {
        self.tool_indices
            .iter()
            .find(|(provider, _)| *provider == provider_index)
            .map(|(_, block)| *block)
    }

    fn close_open_block(&mut self, events: &mut Vec<anthropic::StreamEvent>) {
        match self.state {
            BlockState::InTextBlock => {
                let index = self.text_index.unwrap_or(0);
                events.push(anthropic::StreamEvent::ContentBlockStop { index });
                self.state = BlockState::BetweenBlocks;
            }
            BlockState::InToolUseBlock { index } => {
                events.push(anthropic::StreamEvent::ContentBlockStop { index });
                self.state = BlockState::BetweenBlocks;
            }
            BlockState::BeforeMessage | BlockState::BetweenBlocks => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::messages::openai::{ChatChunk, FinishReason};

    use super::*;

    fn tool_fragment_chunk(
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> ChatChunk {
        serde_json::from_value(serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 1,
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "delta": {
                    "tool_calls": [{
                        "index": index,
                        "id": id,
                        "type": id.map(|_| "function"),
                        "function": {"name": name, "arguments": arguments}
                    }]
                },
                "finish_reason": null
            }]
        }))
        .unwrap()
    }

    fn event_names(events: &[anthropic::StreamEvent]) -> Vec<&'static str> {
        events.iter().map(|event| event.name()).collect()
    }

    #[test]
    fn text_then_tool_call_event_order() {
        let mut assembler = SseAssembler::new("msg_1", "claude-sonnet-4-20250514");
        let mut all = Vec::new();

        all.extend(assembler.feed(&ChatChunk::text("Let me check.", "m")));
        all.extend(assembler.feed(&tool_fragment_chunk(
            0,
            Some("toolu_1"),
            Some("get_weather"),
            None,
        )));
        all.extend(assembler.feed(&tool_fragment_chunk(0, None, None, Some(r#"{"loc"#))));
        all.extend(assembler.feed(&tool_fragment_chunk(0, None, None, Some(r#"ation":"SF"}"#))));
        all.extend(assembler.feed(&ChatChunk::finish(FinishReason::ToolCalls, "m")));

        assert_eq!(
            event_names(&all),
            [
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        // Tool block carries index 1 (text block took 0) and its metadata.
        let anthropic::StreamEvent::ContentBlockStart {
            index,
            content_block: anthropic::ContentBlock::ToolUse { id, name, input },
        } = &all[4]
        else {
            unreachable!("expected tool_use content_block_start");
        };
        assert_eq!(*index, 1);
        assert_eq!(id, "toolu_1");
        assert_eq!(name, "get_weather");
        assert_eq!(input, &serde_json::json!({}));
    }

    #[test]
    fn argument_fragments_are_forwarded_one_per_event() {
        let mut assembler = SseAssembler::new("msg_1", "m");

        assembler.feed(&tool_fragment_chunk(0, Some("toolu_1"), Some("f"), None));
        let first = assembler.feed(&tool_fragment_chunk(0, None, None, Some(r#"{"a":"#)));
        let second = assembler.feed(&tool_fragment_chunk(0, None, None, Some("1}")));

        for (events, expected) in [(&first, r#"{"a":"#), (&second, "1}")] {
            assert_eq!(events.len(), 1);
            let anthropic::StreamEvent::ContentBlockDelta {
                delta: anthropic::ContentDelta::InputJsonDelta { partial_json },
                ..
            } = &events[0]
            else {
                unreachable!("expected input_json_delta");
            };
            assert_eq!(partial_json, expected);
        }
    }

    #[test]
    fn text_only_stream_uses_block_zero() {
        let mut assembler = SseAssembler::new("msg_1", "m");
        let mut all = Vec::new();

        all.extend(assembler.feed(&ChatChunk::text("H", "m")));
        all.extend(assembler.feed(&ChatChunk::text("i", "m")));
        all.extend(assembler.feed(&ChatChunk::finish(FinishReason::Stop, "m")));

        assert_eq!(
            event_names(&all),
            [
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        let anthropic::StreamEvent::MessageDelta { delta, .. } = &all[5] else {
            unreachable!("expected message_delta");
        };
        assert_eq!(delta.stop_reason, Some(anthropic::StopReason::EndTurn));
    }

    #[test]
    fn second_tool_call_closes_the_first() {
        let mut assembler = SseAssembler::new("msg_1", "m");
        let mut all = Vec::new();

        all.extend(assembler.feed(&tool_fragment_chunk(0, Some("toolu_1"), Some("a"), Some("{}"))));
        all.extend(assembler.feed(&tool_fragment_chunk(1, Some("toolu_2"), Some("b"), Some("{}"))));
        all.extend(assembler.feed(&ChatChunk::finish(FinishReason::ToolCalls, "m")));

        assert_eq!(
            event_names(&all),
            [
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[test]
    fn end_without_finish_chunk_emits_terminal_events_once() {
        let mut assembler = SseAssembler::new("msg_1", "m");

        assembler.feed(&ChatChunk::text("partial", "m"));
        let terminal = assembler.end();

        assert_eq!(
            event_names(&terminal),
            ["content_block_stop", "message_delta", "message_stop"]
        );
        assert!(assembler.end().is_empty());
    }

    #[test]
    fn end_before_any_content_is_silent() {
        let mut assembler = SseAssembler::new("msg_1", "m");
        assert!(assembler.end().is_empty());
        assert!(!assembler.message_started());
    }

    #[test]
    fn fail_mid_stream_emits_error_then_stop() {
        let mut assembler = SseAssembler::new("msg_1", "m");
        assembler.feed(&ChatChunk::text("partial", "m"));

        let error = anthropic::StreamEvent::Error {
            error: anthropic::ErrorDetail {
                error_type: "overloaded_error".to_string(),
                message: "stalled".to_string(),
            },
        };
        let events = assembler.fail(error);

        assert_eq!(
            event_names(&events),
            ["content_block_stop", "error", "message_stop"]
        );
        assert!(assembler.end().is_empty());
    }

    #[test]
    fn determinism_same_chunks_same_events() {
        let chunks = vec![
            ChatChunk::text("a", "m"),
            tool_fragment_chunk(0, Some("toolu_1"), Some("f"), None),
            tool_fragment_chunk(0, None, None, Some("{}")),
            ChatChunk::finish(FinishReason::ToolCalls, "m"),
        ];

        let mut first = SseAssembler::new("msg_1", "m");
        let mut second = SseAssembler::new("msg_1", "m");

        for chunk in &chunks {
            let a = serde_json::to_value(first.feed(chunk)).unwrap();
            let b = serde_json::to_value(second.feed(chunk)).unwrap();
            assert_eq!(a, b);
        }
    }
}
