//! The evolving view of one streaming response.

use llm::messages::openai::{ChatChunk, FinishReason};

use crate::blocks::StreamBlock;

/// Aggregated state of a streaming response, passed (read-only) to policy
/// callbacks on each chunk.
///
/// `current` and `just_completed` are indices into `blocks`;
/// `just_completed` is only set on the chunk that finalized the block and
/// is cleared before the next chunk is processed.
#[derive(Debug, Default)]
pub struct StreamState {
    /// All blocks started so far, in stream order.
    pub(crate) blocks: Vec<StreamBlock>,
    /// Index of the block currently being appended to.
    pub(crate) current: Option<usize>,
    /// Index of the block finalized by this chunk, if any.
    pub(crate) just_completed: Option<usize>,
    /// The choice-level finish reason, once the provider signalled it.
    pub(crate) finish_reason: Option<FinishReason>,
    /// Every normalized chunk in arrival order.
    pub(crate) raw_chunks: Vec<ChatChunk>,
    /// Length-prefix of `raw_chunks` already emitted to the client by the
    /// passthrough-accumulated helper. Never written by the aggregator.
    pub(crate) last_emission_index: usize,
}

impl StreamState {
    /// All blocks started so far, in stream order.
    pub fn blocks(&self) -> &[StreamBlock] {
        &self.blocks
    }

    /// The block currently being appended to.
    pub fn current_block(&self) -> Option<&StreamBlock> {
        self.current.map(|index| &self.blocks[index])
    }

    /// The block finalized by the chunk under processing, if any.
    pub fn just_completed(&self) -> Option<&StreamBlock> {
        self.just_completed.map(|index| &self.blocks[index])
    }

    /// The choice-level finish reason, null until the terminal chunk.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Every normalized chunk received so far, in arrival order.
    pub fn raw_chunks(&self) -> &[ChatChunk] {
        &self.raw_chunks
    }

    /// The most recently received chunk.
    pub fn last_chunk(&self) -> Option<&ChatChunk> {
        self.raw_chunks.last()
    }

    /// How many raw chunks the passthrough helper has already emitted.
    pub fn last_emission_index(&self) -> usize {
        self.last_emission_index
    }

    /// The accumulated content text, empty when no content block exists.
    pub fn content(&self) -> &str {
        self.blocks
            .iter()
            .find_map(|block| block.content())
            .unwrap_or_default()
    }
}
