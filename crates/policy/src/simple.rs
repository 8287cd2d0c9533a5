//! Buffered policy authoring: trade streaming latency for simplicity.

use async_trait::async_trait;
use llm::messages::openai::{ChatChunk, ChatRequest, ChatResponse, FinishReason, ToolCall};

use crate::{
    blocks::StreamBlock,
    context::{PolicyContext, StreamingPolicyContext},
    hooks::Policy,
};

/// Simplified hook surface for content-level policies.
///
/// Implementors see complete blocks instead of deltas: the full response
/// text and fully assembled tool calls. The [`Simple`] adapter implements
/// the streaming [`Policy`] hooks by buffering deltas and emitting a
/// reconstructed chunk when each block completes.
///
/// Returning `None` from [`on_response_tool_call`] blocks the tool call:
/// nothing of it reaches the client, a policy-provided notice text is sent
/// instead, and a stream that would have finished with `tool_calls` ends
/// with `stop` when every call was blocked.
///
/// [`on_response_tool_call`]: SimplePolicy::on_response_tool_call
#[async_trait]
pub trait SimplePolicy: Send + Sync {
    /// Short name used in logs and admin responses.
    fn name(&self) -> &str;

    /// Transform or validate the request before it is sent upstream.
    async fn on_request(&self, request: ChatRequest) -> anyhow::Result<ChatRequest> {
        Ok(request)
    }

    /// Transform the complete response content.
    async fn on_response_content(&self, content: String, request: &ChatRequest) -> anyhow::Result<String> {
        let _ = request;
        Ok(content)
    }

    /// Transform or block a complete tool call. `None` blocks it.
    async fn on_response_tool_call(
        &self,
        tool_call: ToolCall,
        request: &ChatRequest,
    ) -> anyhow::Result<Option<ToolCall>> {
        let _ = request;
        Ok(Some(tool_call))
    }

    /// Text sent to the client in place of a blocked tool call.
    fn blocked_tool_call_message(&self, tool_call: &ToolCall) -> String {
        format!("Tool call '{}' was blocked by policy.", tool_call.function.name)
    }
}

/// Adapter turning a [`SimplePolicy`] into a full [`Policy`].
pub struct Simple<P> {
    inner: P,
}

impl<P> Simple<P> {
    /// Wrap a simple policy.
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

/// Per-transaction bookkeeping for the adapter, kept on the scratchpad.
#[derive(Default)]
struct SimpleStreamState {
    /// Whether any block was replaced instead of passed through.
    replaced: bool,
    /// Tool calls emitted (passed or rewritten).
    emitted_tools: u32,
    /// Tool calls blocked.
    blocked_tools: u32,
}

#[async_trait]
impl<P: SimplePolicy> Policy for Simple<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn on_request(&self, request: ChatRequest, _ctx: &mut PolicyContext) -> anyhow::Result<ChatRequest> {
        self.inner.on_request(request).await
    }

    async fn on_response(&self, mut response: ChatResponse, ctx: &mut PolicyContext) -> anyhow::Result<ChatResponse> {
        let Some(choice) = response.choices.first_mut() else {
            return Ok(response);
        };

        let request_view = ctx.request.clone().unwrap_or_else(|| ChatRequest {
            model: response.model.clone(),
            messages: Vec::new(),
            tools: None,
            tool_choice: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            stream: None,
            user: None,
            extra: Default::default(),
        });

        if let Some(content) = choice.message.content.take() {
            choice.message.content = Some(self.inner.on_response_content(content, &request_view).await?);
        }

        if let Some(calls) = choice.message.tool_calls.take() {
            let mut kept = Vec::with_capacity(calls.len());
            let mut notices = Vec::new();

            for call in calls {
                match self.inner.on_response_tool_call(call.clone(), &request_view).await? {
                    Some(call) => kept.push(call),
                    None => notices.push(self.inner.blocked_tool_call_message(&call)),
                }
            }

            if kept.is_empty() && !notices.is_empty() {
                if choice.finish_reason == Some(FinishReason::ToolCalls) {
                    choice.finish_reason = Some(FinishReason::Stop);
                }
                let mut content = choice.message.content.take().unwrap_or_default();
                for notice in &notices {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str(notice);
                }
                choice.message.content = Some(content);
                choice.message.tool_calls = None;
            } else {
                choice.message.tool_calls = if kept.is_empty() { None } else { Some(kept) };
            }
        }

        Ok(response)
    }

    // The assembler buffers; nothing is emitted per chunk.
    async fn on_chunk_received(&self, _ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_content_complete(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        let Some(StreamBlock::Content { content, .. }) = ctx.state().just_completed() else {
            anyhow::bail!("on_content_complete called without a completed content block");
        };

        let content = content.clone();
        let request = ctx.request.clone();
        let transformed = self.inner.on_response_content(content.clone(), &request).await?;

        if transformed != content {
            ctx.scratchpad.get_or_default::<SimpleStreamState>().replaced = true;
            ctx.mark_emitted();
            ctx.send_text(transformed).await?;
        } else {
            ctx.passthrough_accumulated().await?;
        }

        Ok(())
    }

    async fn on_tool_call_complete(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        let Some(block @ StreamBlock::Tool { .. }) = ctx.state().just_completed() else {
            anyhow::bail!("on_tool_call_complete called without a completed tool call block");
        };

        let original = block
            .tool_call()
            .unwrap_or_else(|| unreachable!("tool block always yields a tool call"));
        let request = ctx.request.clone();

        match self.inner.on_response_tool_call(original.clone(), &request).await? {
            Some(transformed) if transformed == original => {
                let state = ctx.scratchpad.get_or_default::<SimpleStreamState>();
                state.emitted_tools += 1;
                ctx.passthrough_accumulated().await?;
            }
            Some(transformed) => {
                let index = {
                    let state = ctx.scratchpad.get_or_default::<SimpleStreamState>();
                    state.replaced = true;
                    let index = state.emitted_tools;
                    state.emitted_tools += 1;
                    index
                };
                ctx.mark_emitted();
                ctx.send_tool_call(transformed, index).await?;
            }
            None => {
                let notice = self.inner.blocked_tool_call_message(&original);
                {
                    let state = ctx.scratchpad.get_or_default::<SimpleStreamState>();
                    state.replaced = true;
                    state.blocked_tools += 1;
                }
                ctx.mark_emitted();
                ctx.emit(
                    "tool_call_blocked",
                    &notice,
                    serde_json::json!({
                        "tool_name": original.function.name,
                        "tool_id": original.id,
                    }),
                );
                ctx.send_text(notice).await?;
            }
        }

        Ok(())
    }

    async fn on_finish_reason(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        let bookkeeping = {
            let state = ctx.scratchpad.get_or_default::<SimpleStreamState>();
            (state.replaced, state.emitted_tools, state.blocked_tools)
        };
        let (replaced, emitted_tools, blocked_tools) = bookkeeping;

        if !replaced {
            // Every block passed through; the finish chunk is among the
            // accumulated raw chunks.
            ctx.passthrough_accumulated().await?;
            return Ok(());
        }

        let original = ctx.state().finish_reason().unwrap_or(FinishReason::Stop);
        let reason = if original == FinishReason::ToolCalls && emitted_tools == 0 && blocked_tools > 0 {
            FinishReason::Stop
        } else {
            original
        };

        ctx.mark_emitted();
        let model = ctx.request.model.clone();
        ctx.send_chunk(ChatChunk::finish(reason, model)).await?;
        Ok(())
    }
}
