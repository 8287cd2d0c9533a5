//! The policy hook surface.

use std::sync::Arc;

use async_trait::async_trait;
use llm::messages::{
    anthropic::{MessagesRequest, MessagesResponse, StreamEvent},
    openai::{ChatRequest, ChatResponse},
};

use crate::context::{PolicyContext, StreamingPolicyContext};

/// A policy observes and may rewrite every transaction.
///
/// Policies are immutable after construction and shared across concurrent
/// transactions; per-request state lives on the context scratchpad. Every
/// hook has a pass-through default, so concrete policies override only
/// what they need.
///
/// Streaming hooks run strictly sequentially per transaction, in this
/// order for each chunk: `on_chunk_received`, then conditionally
/// `on_content_delta`, `on_content_complete`, `on_tool_call_delta`,
/// `on_tool_call_complete`, `on_finish_reason`; and once at the end,
/// `on_stream_complete`.
///
/// The default `on_chunk_received` passes the latest raw chunk through
/// unchanged. A policy that overrides it takes responsibility for *all*
/// egress: nothing reaches the client except what the policy enqueues.
///
/// Hooks that suspend for longer than the configured stall timeout must
/// call [`StreamingPolicyContext::keepalive`] at a faster cadence, or the
/// orchestrator cancels the transaction.
#[async_trait]
pub trait Policy: Send + Sync {
    /// Short name used in logs and admin responses.
    fn name(&self) -> &str;

    /// Transform or validate the request before it is sent upstream.
    async fn on_request(&self, request: ChatRequest, ctx: &mut PolicyContext) -> anyhow::Result<ChatRequest> {
        let _ = ctx;
        Ok(request)
    }

    /// Post-process a non-streaming response.
    async fn on_response(&self, response: ChatResponse, ctx: &mut PolicyContext) -> anyhow::Result<ChatResponse> {
        let _ = ctx;
        Ok(response)
    }

    /// Called on every chunk, before the conditional hooks.
    async fn on_chunk_received(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        ctx.passthrough_last_chunk().await?;
        Ok(())
    }

    /// Called when the chunk carried a content delta.
    async fn on_content_delta(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called when the content block completed on this chunk.
    async fn on_content_complete(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called when the chunk carried tool-call fragments.
    async fn on_tool_call_delta(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called when a tool call block completed on this chunk.
    async fn on_tool_call_complete(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called when the chunk carried the choice-level finish reason.
    async fn on_finish_reason(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called once after the upstream stream ended.
    async fn on_stream_complete(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// The members of a serial chain, for chains only.
    ///
    /// Lets the composition layer insert into an existing chain instead
    /// of nesting chains.
    fn serial_members(&self) -> Option<&[Arc<dyn Policy>]> {
        None
    }

    /// Native Anthropic hook set, for policies that opt in.
    ///
    /// Returning `Some` routes `/v1/messages` transactions through the
    /// [`AnthropicPolicy`] hooks on the native types, bypassing protocol
    /// conversion for the policy's view of the data.
    fn as_anthropic(&self) -> Option<&dyn AnthropicPolicy> {
        None
    }
}

impl std::fmt::Debug for dyn Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy").field("name", &self.name()).finish()
    }
}

/// Hook set operating on native Anthropic request/response/event types.
///
/// Used by the Anthropic-native path for policies that explicitly opt in
/// via [`Policy::as_anthropic`]. All hooks default to pass-through.
#[async_trait]
pub trait AnthropicPolicy: Send + Sync {
    /// Transform or validate a native Messages request.
    async fn on_messages_request(
        &self,
        request: MessagesRequest,
        ctx: &mut PolicyContext,
    ) -> anyhow::Result<MessagesRequest> {
        let _ = ctx;
        Ok(request)
    }

    /// Post-process a native non-streaming Messages response.
    async fn on_messages_response(
        &self,
        response: MessagesResponse,
        ctx: &mut PolicyContext,
    ) -> anyhow::Result<MessagesResponse> {
        let _ = ctx;
        Ok(response)
    }

    /// Observe or rewrite one egress stream event. Returning `None` drops
    /// the event.
    async fn on_stream_event(
        &self,
        event: StreamEvent,
        ctx: &mut PolicyContext,
    ) -> anyhow::Result<Option<StreamEvent>> {
        let _ = ctx;
        Ok(Some(event))
    }
}
