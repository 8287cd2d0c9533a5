//! Chunk-to-block aggregation for streaming responses.

use llm::messages::openai::ChatChunk;
use thiserror::Error;

use crate::{blocks::StreamBlock, state::StreamState};

/// Errors raised while aggregating a chunk sequence.
#[derive(Debug, Error)]
pub enum AggregationError {
    /// Tool call indices must arrive in ascending order without gaps.
    #[error("tool call index {got} arrived, expected {expected}")]
    ToolIndexGap {
        /// The index the provider sent.
        got: u32,
        /// The next index the aggregator would accept.
        expected: u32,
    },
}

/// Turns a sequence of normalized chunks into an ordered block list.
///
/// Feeding the same chunk sequence into two fresh aggregators yields equal
/// state at every step; the aggregator holds no clocks and no randomness.
#[derive(Debug, Default)]
pub struct ChunkAggregator {
    state: StreamState,
}

impl ChunkAggregator {
    /// A fresh aggregator with empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current aggregated state.
    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut StreamState {
        &mut self.state
    }

    /// Feed one chunk, updating the state.
    ///
    /// On return, `just_completed` names the block finalized by this chunk,
    /// or nothing. At most one block completes per chunk.
    pub fn feed(&mut self, chunk: ChatChunk) -> Result<(), AggregationError> {
        self.state.just_completed = None;

        if chunk.choices.len() > 1 {
            log::warn!(
                "Chunk carries {} choices; only index 0 drives aggregation",
                chunk.choices.len()
            );
        }

        let Some(choice) = chunk.choices.first() else {
            self.state.raw_chunks.push(chunk);
            return Ok(());
        };

        let delta = choice.delta.clone();
        let finish_reason = choice.finish_reason;
        self.state.raw_chunks.push(chunk);

        if let Some(content) = delta.content.as_deref()
            && !content.is_empty()
        {
            self.append_content(content);
        }

        for fragment in delta.tool_calls.as_deref().unwrap_or_default() {
            self.append_tool_fragment(fragment)?;
        }

        if let Some(reason) = finish_reason {
            self.state.finish_reason = Some(reason);
            if let Some(index) = self.state.current.take() {
                self.finalize(index);
            }
        }

        Ok(())
    }

    fn append_content(&mut self, content: &str) {
        let content_index = self
            .state
            .blocks
            .iter()
            .position(|block| matches!(block, StreamBlock::Content { .. }));

        // A chunk delivering new content while a tool block is open breaks
        // the block-order contract; finalize the tool block and log it.
        if let Some(current) = self.state.current
            && matches!(self.state.blocks[current], StreamBlock::Tool { .. })
        {
            log::warn!("Content delta while a tool call block is open; finalizing the tool block");
            self.state.current = None;
            self.finalize(current);
        }

        let index = match content_index {
            Some(index) => index,
            None => {
                // The content block is always first in block order; any
                // index recorded before the insertion shifts by one.
                self.state.blocks.insert(
                    0,
                    StreamBlock::Content {
                        content: String::new(),
                        is_complete: false,
                    },
                );
                if let Some(completed) = &mut self.state.just_completed {
                    *completed += 1;
                }
                0
            }
        };

        if let StreamBlock::Content {
            content: accumulated, ..
        } = &mut self.state.blocks[index]
        {
            accumulated.push_str(content);
        }

        self.state.current = Some(index);
    }

    fn append_tool_fragment(
        &mut self,
        fragment: &llm::messages::openai::ToolCallDelta,
    ) -> Result<(), AggregationError> {
        let existing = self.state.blocks.iter().position(|block| {
            matches!(block, StreamBlock::Tool { index, .. } if *index == fragment.index)
        });

        let index = match existing {
            Some(index) => index,
            None => {
                let expected = self
                    .state
                    .blocks
                    .iter()
                    .filter_map(|block| match block {
                        StreamBlock::Tool { index, .. } => Some(*index + 1),
                        StreamBlock::Content { .. } => None,
                    })
                    .max()
                    .unwrap_or(0);

                if fragment.index != expected {
                    return Err(AggregationError::ToolIndexGap {
                        got: fragment.index,
                        expected,
                    });
                }

                // A new tool call finalizes whatever block was streaming.
                if let Some(current) = self.state.current.take() {
                    self.finalize(current);
                }

                self.state.blocks.push(StreamBlock::Tool {
                    id: fragment.id.clone().unwrap_or_default(),
                    index: fragment.index,
                    name: String::new(),
                    arguments: String::new(),
                    is_complete: false,
                });
                self.state.blocks.len() - 1
            }
        };

        // A fragment addressed to a block finalized earlier in this same
        // feed (the combined content+arguments chunk shape) must not
        // mutate the block's final content.
        if self.state.blocks[index].is_complete() {
            log::warn!(
                "Tool call fragment for completed block index {}; dropping the fragment",
                fragment.index
            );
            return Ok(());
        }

        if let StreamBlock::Tool {
            id, name, arguments, ..
        } = &mut self.state.blocks[index]
        {
            if let Some(fragment_id) = &fragment.id
                && id.is_empty()
            {
                fragment_id.clone_into(id);
            }

            if let Some(function) = &fragment.function {
                if let Some(fragment_name) = &function.name
                    && name.is_empty()
                {
                    fragment_name.clone_into(name);
                }

                if let Some(fragment_arguments) = &function.arguments {
                    arguments.push_str(fragment_arguments);
                }
            }
        }

        self.state.current = Some(index);
        Ok(())
    }

    fn finalize(&mut self, index: usize) {
        if self.state.blocks[index].is_complete() {
            return;
        }

        self.state.blocks[index].set_complete();

        if self.state.just_completed.is_some() {
            // The contract is at most one completion per chunk; keep the
            // first and surface the violation.
            log::warn!("Multiple blocks completed by a single chunk; keeping the first");
            return;
        }

        self.state.just_completed = Some(index);
    }
}
