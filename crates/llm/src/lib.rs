//! Wire protocols and upstream plumbing for the Warden gateway.
//!
//! This crate owns everything that touches a wire shape:
//!
//! - [`messages::openai`] — the OpenAI chat-completions types, which double
//!   as Warden's internal representation for requests, responses and chunks
//! - [`messages::anthropic`] — the Anthropic Messages types
//! - [`convert`] — the pure conversions between the two protocols and the
//!   stateful streaming assemblers
//! - [`client`] — the upstream provider abstraction
//!
//! Raw JSON does not leak past this crate: every payload is parsed into a
//! tagged type at the boundary and serialized again on the way out. Unknown
//! keys ride along in flattened extension maps where the destination shape
//! has one.

mod client;
pub mod convert;
mod error;
pub mod messages;

pub use client::{ChunkStream, LlmClient, OpenAiClient, ensure_provider_prefix};
pub use error::{AnthropicErrorResponse, AnthropicResult, LlmError, LlmResult as Result};
