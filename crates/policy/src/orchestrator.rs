//! The per-request pipeline coordinator.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::{Stream, StreamExt};
use llm::{
    LlmClient, LlmError,
    messages::openai::{ChatChunk, ChatRequest, ChatResponse},
};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    blocks::StreamBlock,
    context::{EgressSendError, Keepalive, PolicyContext, StreamingPolicyContext},
    events::{EventBus, EventRecord, unix_timestamp},
    hooks::Policy,
};

/// Timeouts and capacities governing one transaction.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Maximum time without chunk progress or a policy keepalive.
    pub stall_timeout: Duration,
    /// Maximum time a policy may block on an egress write.
    pub egress_put_timeout: Duration,
    /// Capacity of the egress queue.
    pub egress_capacity: usize,
}

impl From<&config::PolicyConfig> for OrchestratorSettings {
    fn from(config: &config::PolicyConfig) -> Self {
        Self {
            stall_timeout: config.stall_timeout,
            egress_put_timeout: config.egress_put_timeout,
            egress_capacity: config.egress_capacity,
        }
    }
}

/// Coordinates one client transaction through the policy and the upstream
/// provider.
///
/// The policy reference is captured at construction: transactions keep the
/// policy they started with even when the manager swaps the active policy
/// mid-flight.
pub struct PolicyOrchestrator {
    policy: Arc<dyn Policy>,
    client: Arc<dyn LlmClient>,
    events: EventBus,
    settings: OrchestratorSettings,
}

impl PolicyOrchestrator {
    /// Build an orchestrator for one transaction.
    pub fn new(
        policy: Arc<dyn Policy>,
        client: Arc<dyn LlmClient>,
        events: EventBus,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            policy,
            client,
            events,
            settings,
        }
    }

    /// The policy driving this transaction.
    pub fn policy(&self) -> &Arc<dyn Policy> {
        &self.policy
    }

    /// Run a non-streaming transaction: request hook, upstream call,
    /// response hook.
    pub async fn complete(&self, request: ChatRequest, ctx: &mut PolicyContext) -> llm::Result<ChatResponse> {
        let request = self
            .policy
            .on_request(request, ctx)
            .await
            .map_err(|error| map_hook_error(self.policy.name(), error))?;

        ctx.request = Some(request.clone());
        self.emit_backend_request(&ctx.transaction_id, &request);

        let response = match self.client.complete(request).await {
            Ok(response) => {
                self.emit_backend_response(&ctx.transaction_id, "ok");
                response
            }
            Err(error) => {
                self.emit_backend_response(&ctx.transaction_id, "error");
                return Err(error);
            }
        };

        self.policy
            .on_response(response, ctx)
            .await
            .map_err(|error| map_hook_error(self.policy.name(), error))
    }

    /// Run a streaming transaction.
    ///
    /// Returns the egress stream: the chunks the policy enqueued, in
    /// order, with at most one terminal `Err` item on failure. Dropping
    /// the stream cancels the transaction and closes the upstream stream.
    pub async fn stream(&self, request: ChatRequest, ctx: &mut PolicyContext) -> llm::Result<PolicyStream> {
        let request = self
            .policy
            .on_request(request, ctx)
            .await
            .map_err(|error| map_hook_error(self.policy.name(), error))?;

        ctx.request = Some(request.clone());
        self.emit_backend_request(&ctx.transaction_id, &request);

        let upstream = match self.client.stream(request.clone()).await {
            Ok(upstream) => upstream,
            Err(error) => {
                self.emit_backend_response(&ctx.transaction_id, "error");
                return Err(error);
            }
        };

        let (tx, rx) = mpsc::channel::<llm::Result<ChatChunk>>(self.settings.egress_capacity);
        let keepalive = Keepalive::new();
        let cancel = CancellationToken::new();

        let mut streaming_ctx = StreamingPolicyContext::for_channel(
            ctx.transaction_id.clone(),
            request,
            tx.clone(),
            self.settings.egress_put_timeout,
            keepalive.clone(),
            self.events.clone(),
            ctx.store_handle(),
        );

        let stalled = Arc::new(std::sync::atomic::AtomicBool::new(false));

        // Feeder: reads provider chunks, drives the aggregator and the
        // policy hooks in canonical order.
        let feeder = {
            let policy = Arc::clone(&self.policy);
            let events = self.events.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            let put_timeout = self.settings.egress_put_timeout;
            let transaction_id = ctx.transaction_id.clone();
            let stalled = Arc::clone(&stalled);

            async move {
                let result = feed_loop(policy, &mut streaming_ctx, upstream, &cancel).await;

                let status = match &result {
                    Ok(()) => "ok",
                    Err(LlmError::Cancelled) if stalled.load(std::sync::atomic::Ordering::Relaxed) => "timeout",
                    Err(LlmError::Stalled(_)) | Err(LlmError::UpstreamTimeout(_)) => "timeout",
                    Err(LlmError::Cancelled) => "cancelled",
                    Err(_) => "error",
                };
                events.publish(EventRecord::BackendResponse {
                    transaction_id,
                    timestamp: unix_timestamp(),
                    status: status.to_string(),
                    payload: None,
                });

                // Cancellation means either a dead client or a stall the
                // monitor already reported; everything else is encoded as
                // the single terminal error item, best-effort.
                if let Err(error) = result
                    && !matches!(error, LlmError::Cancelled)
                {
                    let _ = tokio::time::timeout(put_timeout, tx.send(Err(error))).await;
                }

                cancel.cancel();
            }
        };
        tokio::spawn(feeder);

        // Stall monitor: cancels the pipeline when neither chunks nor
        // keepalives arrive within the stall window.
        let monitor = {
            let cancel = cancel.clone();
            let stall_timeout = self.settings.stall_timeout;
            let period = stall_period(stall_timeout);

            async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(period) => {
                            if keepalive.elapsed() > stall_timeout {
                                log::warn!("Stream stalled for more than {stall_timeout:?}; cancelling");
                                stalled.store(true, std::sync::atomic::Ordering::Relaxed);
                                let _ = tx.try_send(Err(LlmError::Stalled(stall_timeout.as_secs())));
                                cancel.cancel();
                                return;
                            }
                        }
                    }
                }
            }
        };
        tokio::spawn(monitor);

        Ok(PolicyStream {
            rx,
            _cancel_on_drop: cancel.drop_guard(),
        })
    }

    fn emit_backend_request(&self, transaction_id: &str, request: &ChatRequest) {
        self.events.publish(EventRecord::BackendRequest {
            transaction_id: transaction_id.to_string(),
            timestamp: unix_timestamp(),
            model: request.model.clone(),
            payload: None,
        });
    }

    fn emit_backend_response(&self, transaction_id: &str, status: &str) {
        self.events.publish(EventRecord::BackendResponse {
            transaction_id: transaction_id.to_string(),
            timestamp: unix_timestamp(),
            status: status.to_string(),
            payload: None,
        });
    }
}

fn stall_period(stall_timeout: Duration) -> Duration {
    (stall_timeout / 4)
        .min(Duration::from_millis(250))
        .max(Duration::from_millis(10))
}

async fn feed_loop(
    policy: Arc<dyn Policy>,
    ctx: &mut StreamingPolicyContext,
    mut upstream: llm::ChunkStream,
    cancel: &CancellationToken,
) -> Result<(), LlmError> {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            next = upstream.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                // Chunk progress counts as keepalive.
                ctx.keepalive();

                dispatch_chunk(policy.as_ref(), ctx, chunk)
                    .await
                    .map_err(|error| map_hook_error(policy.name(), error))?;
            }
            Some(Err(error)) => return Err(error),
            None => {
                policy
                    .on_stream_complete(ctx)
                    .await
                    .map_err(|error| map_hook_error(policy.name(), error))?;
                return Ok(());
            }
        }
    }
}

/// Feed one chunk into the context and invoke the policy hooks in the
/// canonical order.
///
/// Shared between the orchestrator's feeder and the composition layer,
/// which replays chunks through per-stage contexts.
pub async fn dispatch_chunk(
    policy: &dyn Policy,
    ctx: &mut StreamingPolicyContext,
    chunk: ChatChunk,
) -> anyhow::Result<()> {
    let delta = chunk.primary_delta();
    let had_content = delta
        .and_then(|delta| delta.content.as_deref())
        .is_some_and(|content| !content.is_empty());
    let had_tool_fragments = delta.is_some_and(|delta| delta.tool_calls.as_ref().is_some_and(|t| !t.is_empty()));
    let finish_reason = chunk.primary_finish_reason();

    ctx.feed(chunk)?;

    policy.on_chunk_received(ctx).await?;

    if had_content {
        policy.on_content_delta(ctx).await?;
    }

    if matches!(ctx.state().just_completed(), Some(StreamBlock::Content { .. })) {
        policy.on_content_complete(ctx).await?;
    }

    if had_tool_fragments {
        policy.on_tool_call_delta(ctx).await?;
    }

    if matches!(ctx.state().just_completed(), Some(StreamBlock::Tool { .. })) {
        policy.on_tool_call_complete(ctx).await?;
    }

    if finish_reason.is_some() {
        policy.on_finish_reason(ctx).await?;
    }

    Ok(())
}

fn map_hook_error(policy_name: &str, error: anyhow::Error) -> LlmError {
    match error.downcast_ref::<EgressSendError>() {
        Some(EgressSendError::Timeout(seconds)) => LlmError::EgressTimeout(*seconds),
        Some(EgressSendError::Closed) => LlmError::Cancelled,
        None => {
            if let Some(aggregation) = error.downcast_ref::<crate::aggregator::AggregationError>() {
                log::error!("Stream aggregation failed: {aggregation}");
                return LlmError::InternalError(Some(format!("stream aggregation failed: {aggregation}")));
            }

            log::error!("Policy '{policy_name}' hook failed: {error:#}");
            LlmError::PolicyError {
                policy: policy_name.to_string(),
                message: format!("{error:#}"),
            }
        }
    }
}

/// The egress stream of one streaming transaction.
///
/// Yields the chunks the policy enqueued; a terminal `Err` item encodes a
/// failure that must be rendered as a format-appropriate error event.
/// Dropping the stream (client disconnect) cancels the transaction.
pub struct PolicyStream {
    rx: mpsc::Receiver<llm::Result<ChatChunk>>,
    _cancel_on_drop: DropGuard,
}

impl Stream for PolicyStream {
    type Item = llm::Result<ChatChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
