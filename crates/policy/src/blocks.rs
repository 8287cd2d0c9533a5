//! Semantic blocks assembled from streaming chunks.

use llm::messages::openai::{FunctionCall, ToolCall, ToolCallKind};

/// One semantic unit of a streaming response.
///
/// Blocks stream sequentially: the content block (if any) first, then tool
/// call blocks in ascending index. A block accumulates deltas from multiple
/// chunks until it completes; at most one block completes per chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamBlock {
    /// The text content of the response. At most one per stream, always
    /// first when present.
    Content {
        /// Accumulated text.
        content: String,
        /// Whether the block has finished streaming.
        is_complete: bool,
    },

    /// One streamed tool call.
    Tool {
        /// Tool call id, from the first chunk that names it.
        id: String,
        /// The provider's `tool_calls[i].index`, stable across the call.
        index: u32,
        /// Function name, set once by the first fragment carrying it.
        name: String,
        /// Concatenated JSON argument fragments. Never parsed here.
        arguments: String,
        /// Whether the block has finished streaming.
        is_complete: bool,
    },
}

impl StreamBlock {
    /// Whether the block has finished streaming.
    pub fn is_complete(&self) -> bool {
        match self {
            StreamBlock::Content { is_complete, .. } => *is_complete,
            StreamBlock::Tool { is_complete, .. } => *is_complete,
        }
    }

    pub(crate) fn set_complete(&mut self) {
        match self {
            StreamBlock::Content { is_complete, .. } => *is_complete = true,
            StreamBlock::Tool { is_complete, .. } => *is_complete = true,
        }
    }

    /// The accumulated text of a content block.
    pub fn content(&self) -> Option<&str> {
        match self {
            StreamBlock::Content { content, .. } => Some(content),
            StreamBlock::Tool { .. } => None,
        }
    }

    /// View a tool block as a completed [`ToolCall`].
    pub fn tool_call(&self) -> Option<ToolCall> {
        match self {
            StreamBlock::Tool {
                id, name, arguments, ..
            } => Some(ToolCall {
                id: id.clone(),
                kind: ToolCallKind::Function,
                function: FunctionCall {
                    name: name.clone(),
                    arguments: arguments.clone(),
                },
            }),
            StreamBlock::Content { .. } => None,
        }
    }
}
