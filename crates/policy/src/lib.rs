//! The streaming policy engine of the Warden gateway.
//!
//! A [`Policy`] observes and may rewrite every transaction flowing through
//! the proxy. Non-streaming transactions pass through `on_request` and
//! `on_response`. Streaming transactions are decomposed into semantic
//! blocks by the [`aggregator`], drive the policy's streaming hooks in a
//! fixed order, and whatever the policy writes to its egress queue is what
//! the client receives.
//!
//! The [`orchestrator`] module coordinates one transaction; the
//! [`manager`] owns the active policy and supports hot swaps; [`compose`]
//! builds serial and parallel combinations of policies.

pub mod aggregator;
mod blocks;
pub mod builtin;
pub mod compose;
mod context;
pub mod events;
mod hooks;
pub mod manager;
mod orchestrator;
mod simple;
mod state;
pub mod store;

pub use blocks::StreamBlock;
pub use context::{EgressSendError, Keepalive, PolicyContext, Scratchpad, StreamingPolicyContext};
pub use hooks::{AnthropicPolicy, Policy};
pub use orchestrator::{OrchestratorSettings, PolicyOrchestrator, PolicyStream, dispatch_chunk};
pub use simple::{Simple, SimplePolicy};
pub use state::StreamState;
