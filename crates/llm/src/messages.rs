//! Message types for the two supported LLM protocols.
//!
//! The OpenAI chat-completions shape is the internal interchange format:
//! Anthropic requests are converted into it at ingress and responses are
//! converted back at egress.

pub mod anthropic;
pub mod openai;
