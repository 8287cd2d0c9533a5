//! Serial and parallel composition of policies.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use llm::messages::{
    anthropic::{MessagesRequest, MessagesResponse, StreamEvent},
    openai::{ChatChunk, ChatRequest, ChatResponse},
};

use crate::{
    context::{PolicyContext, StreamingPolicyContext},
    orchestrator::dispatch_chunk,
    hooks::{AnthropicPolicy, Policy},
};

/// Insert a policy into the current policy chain.
///
/// When `current` is already a serial chain, the new policy is inserted
/// into that chain instead of nesting chains. `position` follows
/// list-insert semantics; `None` appends.
pub fn compose_policy(
    current: Arc<dyn Policy>,
    additional: Arc<dyn Policy>,
    position: Option<usize>,
) -> Arc<SerialPolicy> {
    let mut policies: Vec<Arc<dyn Policy>> = match current.serial_members() {
        Some(members) => members.to_vec(),
        None => vec![current],
    };

    match position {
        None => policies.push(additional),
        Some(position) => {
            let position = position.min(policies.len());
            policies.insert(position, additional);
        }
    }

    let composed = SerialPolicy::new(policies);
    log::info!("Composed policy chain: {}", composed.name());
    Arc::new(composed)
}

/// Per-transaction stage contexts for a composed policy, kept on the
/// outer context's scratchpad.
struct ComposedStages {
    stages: Vec<StreamingPolicyContext>,
}

/// Serial composition: each sub-policy observes the chunks produced by
/// the previous one.
///
/// `on_request` and `on_response` chain in declaration order. For
/// streaming, every sub-policy gets a private stage context whose egress
/// feeds the next stage's ingress; only the last stage's output reaches
/// the transaction's true egress queue. The composite owns all egress, so
/// it overrides `on_chunk_received` and leaves the per-block hooks to the
/// stage dispatch.
pub struct SerialPolicy {
    name: String,
    policies: Vec<Arc<dyn Policy>>,
    anthropic_conformance: OnceLock<bool>,
}

impl SerialPolicy {
    /// Compose the given policies, flattening nested serial chains.
    pub fn new(policies: Vec<Arc<dyn Policy>>) -> Self {
        let policies: Vec<Arc<dyn Policy>> = policies
            .into_iter()
            .flat_map(|policy| match policy.serial_members() {
                Some(members) => members.to_vec(),
                None => vec![policy],
            })
            .collect();

        let name = format!(
            "serial({})",
            policies.iter().map(|policy| policy.name()).collect::<Vec<_>>().join(",")
        );

        Self {
            name,
            policies,
            anthropic_conformance: OnceLock::new(),
        }
    }

    /// The composed sub-policies, in order.
    pub fn members(&self) -> &[Arc<dyn Policy>] {
        &self.policies
    }

    async fn cascade(
        &self,
        stages: &mut ComposedStages,
        input: Vec<ChatChunk>,
    ) -> anyhow::Result<Vec<ChatChunk>> {
        let mut ingress = input;

        for (policy, stage) in self.policies.iter().zip(stages.stages.iter_mut()) {
            if ingress.is_empty() {
                break;
            }

            for chunk in ingress.drain(..) {
                dispatch_chunk(policy.as_ref(), stage, chunk).await?;
            }
            ingress = stage.take_buffered();
        }

        Ok(ingress)
    }

    fn take_stages(&self, ctx: &mut StreamingPolicyContext) -> ComposedStages {
        ctx.scratchpad.remove::<ComposedStages>().unwrap_or_else(|| ComposedStages {
            stages: self.policies.iter().map(|_| ctx.make_stage()).collect(),
        })
    }
}

#[async_trait]
impl Policy for SerialPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn serial_members(&self) -> Option<&[Arc<dyn Policy>]> {
        Some(&self.policies)
    }

    async fn on_request(&self, mut request: ChatRequest, ctx: &mut PolicyContext) -> anyhow::Result<ChatRequest> {
        for policy in &self.policies {
            request = policy.on_request(request, ctx).await?;
        }
        Ok(request)
    }

    async fn on_response(&self, mut response: ChatResponse, ctx: &mut PolicyContext) -> anyhow::Result<ChatResponse> {
        for policy in &self.policies {
            response = policy.on_response(response, ctx).await?;
        }
        Ok(response)
    }

    async fn on_chunk_received(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        let Some(chunk) = ctx.state().last_chunk().cloned() else {
            return Ok(());
        };

        let mut stages = self.take_stages(ctx);
        let result = self.cascade(&mut stages, vec![chunk]).await;
        ctx.scratchpad.insert(stages);

        for chunk in result? {
            ctx.send_chunk(chunk).await?;
        }
        Ok(())
    }

    async fn on_stream_complete(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        let Some(mut stages) = ctx.scratchpad.remove::<ComposedStages>() else {
            return Ok(());
        };

        // Completion flows stage by stage: chunks a stage emits on
        // completion are replayed into the stages after it.
        let mut carry: Vec<ChatChunk> = Vec::new();

        for (index, policy) in self.policies.iter().enumerate() {
            let stage = &mut stages.stages[index];

            for chunk in carry.drain(..) {
                dispatch_chunk(policy.as_ref(), stage, chunk).await?;
            }

            policy.on_stream_complete(stage).await?;
            carry = stage.take_buffered();
        }

        for chunk in carry {
            ctx.send_chunk(chunk).await?;
        }
        Ok(())
    }

    fn as_anthropic(&self) -> Option<&dyn AnthropicPolicy> {
        let conforms = *self
            .anthropic_conformance
            .get_or_init(|| self.policies.iter().all(|policy| policy.as_anthropic().is_some()));

        conforms.then_some(self as &dyn AnthropicPolicy)
    }
}

#[async_trait]
impl AnthropicPolicy for SerialPolicy {
    async fn on_messages_request(
        &self,
        mut request: MessagesRequest,
        ctx: &mut PolicyContext,
    ) -> anyhow::Result<MessagesRequest> {
        for policy in &self.policies {
            let Some(native) = policy.as_anthropic() else {
                anyhow::bail!(
                    "policy '{}' does not implement the Anthropic interface",
                    policy.name()
                );
            };
            request = native.on_messages_request(request, ctx).await?;
        }
        Ok(request)
    }

    async fn on_messages_response(
        &self,
        mut response: MessagesResponse,
        ctx: &mut PolicyContext,
    ) -> anyhow::Result<MessagesResponse> {
        for policy in &self.policies {
            let Some(native) = policy.as_anthropic() else {
                anyhow::bail!(
                    "policy '{}' does not implement the Anthropic interface",
                    policy.name()
                );
            };
            response = native.on_messages_response(response, ctx).await?;
        }
        Ok(response)
    }

    async fn on_stream_event(
        &self,
        event: StreamEvent,
        ctx: &mut PolicyContext,
    ) -> anyhow::Result<Option<StreamEvent>> {
        let mut current = Some(event);

        for policy in &self.policies {
            let Some(native) = policy.as_anthropic() else {
                anyhow::bail!(
                    "policy '{}' does not implement the Anthropic interface",
                    policy.name()
                );
            };
            match current {
                Some(event) => current = native.on_stream_event(event, ctx).await?,
                None => break,
            }
        }
        Ok(current)
    }
}

/// Parallel composition: all sub-policies observe the same inputs; their
/// outputs are merged.
///
/// Requests and responses are merged with a deterministic arbiter: the
/// first sub-policy (in declaration order) whose output differs from the
/// input wins. Streaming uses last-writer-wins per chunk; sub-policies
/// that disagree on output indicate a configuration error and are
/// surfaced as a runtime warning.
pub struct ParallelPolicy {
    name: String,
    policies: Vec<Arc<dyn Policy>>,
}

impl ParallelPolicy {
    /// Compose the given policies for parallel execution.
    pub fn new(policies: Vec<Arc<dyn Policy>>) -> Self {
        let name = format!(
            "parallel({})",
            policies.iter().map(|policy| policy.name()).collect::<Vec<_>>().join(",")
        );

        Self { name, policies }
    }

    fn merge<T: serde::Serialize>(&self, input: &T, outputs: Vec<T>) -> T
    where
        T: Clone,
    {
        let input_json = serde_json::to_value(input).ok();

        for (policy, output) in self.policies.iter().zip(outputs.iter()) {
            let output_json = serde_json::to_value(output).ok();
            if output_json != input_json {
                log::debug!("Parallel merge: '{}' modified the payload", policy.name());
                return output.clone();
            }
        }

        outputs.into_iter().next().unwrap_or_else(|| input.clone())
    }
}

#[async_trait]
impl Policy for ParallelPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_request(&self, request: ChatRequest, ctx: &mut PolicyContext) -> anyhow::Result<ChatRequest> {
        let mut outputs = Vec::with_capacity(self.policies.len());

        for policy in &self.policies {
            outputs.push(policy.on_request(request.clone(), ctx).await?);
        }

        Ok(self.merge(&request, outputs))
    }

    async fn on_response(&self, response: ChatResponse, ctx: &mut PolicyContext) -> anyhow::Result<ChatResponse> {
        let mut outputs = Vec::with_capacity(self.policies.len());

        for policy in &self.policies {
            outputs.push(policy.on_response(response.clone(), ctx).await?);
        }

        Ok(self.merge(&response, outputs))
    }

    async fn on_chunk_received(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        let Some(chunk) = ctx.state().last_chunk().cloned() else {
            return Ok(());
        };

        let mut stages = ctx.scratchpad.remove::<ComposedStages>().unwrap_or_else(|| ComposedStages {
            stages: self.policies.iter().map(|_| ctx.make_stage()).collect(),
        });

        let mut outputs: Vec<Vec<ChatChunk>> = Vec::with_capacity(self.policies.len());
        let mut result = Ok(());

        for (policy, stage) in self.policies.iter().zip(stages.stages.iter_mut()) {
            if let Err(error) = dispatch_chunk(policy.as_ref(), stage, chunk.clone()).await {
                result = Err(error);
                break;
            }
            outputs.push(stage.take_buffered());
        }

        ctx.scratchpad.insert(stages);
        result?;

        let winner = self.pick_winner(outputs);
        for chunk in winner {
            ctx.send_chunk(chunk).await?;
        }
        Ok(())
    }

    async fn on_stream_complete(&self, ctx: &mut StreamingPolicyContext) -> anyhow::Result<()> {
        let Some(mut stages) = ctx.scratchpad.remove::<ComposedStages>() else {
            return Ok(());
        };

        let mut outputs: Vec<Vec<ChatChunk>> = Vec::with_capacity(self.policies.len());

        for (policy, stage) in self.policies.iter().zip(stages.stages.iter_mut()) {
            policy.on_stream_complete(stage).await?;
            outputs.push(stage.take_buffered());
        }

        for chunk in self.pick_winner(outputs) {
            ctx.send_chunk(chunk).await?;
        }
        Ok(())
    }
}

impl ParallelPolicy {
    /// Last writer wins: the final sub-policy's output is authoritative.
    /// Divergent non-empty output from an earlier sub-policy is a
    /// configuration error, surfaced as a warning.
    fn pick_winner(&self, mut outputs: Vec<Vec<ChatChunk>>) -> Vec<ChatChunk> {
        let winner = outputs.pop().unwrap_or_default();
        let winner_json = serde_json::to_value(&winner).ok();

        for (policy, output) in self.policies.iter().zip(outputs.iter()) {
            if !output.is_empty() && serde_json::to_value(output).ok() != winner_json {
                log::warn!(
                    "Parallel-composed policy '{}' disagrees with the last writer; its output is discarded ({})",
                    policy.name(),
                    self.name
                );
            }
        }

        winner
    }
}

#[cfg(test)]
mod tests {
    use llm::messages::openai::FinishReason;
    use serde_json::json;

    use crate::{
        builtin::{NoOpPolicy, UppercasePolicy},
        events::EventBus,
        simple::{Simple, SimplePolicy},
    };

    use super::*;

    /// Tags the request model so hook ordering is observable.
    struct TagRequest(&'static str);

    #[async_trait]
    impl Policy for TagRequest {
        fn name(&self) -> &str {
            self.0
        }

        async fn on_request(&self, mut request: ChatRequest, _ctx: &mut PolicyContext) -> anyhow::Result<ChatRequest> {
            request.model = format!("{}+{}", request.model, self.0);
            Ok(request)
        }
    }

    struct AppendBang;

    #[async_trait]
    impl SimplePolicy for AppendBang {
        fn name(&self) -> &str {
            "append-bang"
        }

        async fn on_response_content(&self, content: String, _request: &ChatRequest) -> anyhow::Result<String> {
            Ok(format!("{content}!"))
        }
    }

    fn chat_request() -> ChatRequest {
        serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap()
    }

    async fn run_streaming(policy: &dyn Policy, chunks: Vec<ChatChunk>) -> Vec<ChatChunk> {
        let (events, _worker) = EventBus::for_tests();
        let mut ctx = StreamingPolicyContext::for_buffer(
            "t-1",
            chat_request(),
            crate::context::Keepalive::new(),
            events,
            None,
        );

        for chunk in chunks {
            dispatch_chunk(policy, &mut ctx, chunk).await.unwrap();
        }
        policy.on_stream_complete(&mut ctx).await.unwrap();

        ctx.take_buffered()
    }

    #[tokio::test]
    async fn request_hooks_chain_in_order() {
        let serial = SerialPolicy::new(vec![Arc::new(TagRequest("a")), Arc::new(TagRequest("b"))]);
        let (events, _worker) = EventBus::for_tests();
        let mut ctx = PolicyContext::new("t-1", None, events);

        let request = serial.on_request(chat_request(), &mut ctx).await.unwrap();
        assert_eq!(request.model, "m+a+b");
    }

    #[tokio::test]
    async fn composing_single_policy_is_observationally_identity() {
        let serial = SerialPolicy::new(vec![Arc::new(NoOpPolicy) as Arc<dyn Policy>]);

        let chunks = vec![
            ChatChunk::text("a", "m"),
            ChatChunk::text("b", "m"),
            ChatChunk::finish(FinishReason::Stop, "m"),
        ];
        let output = run_streaming(&serial, chunks.clone()).await;

        assert_eq!(
            serde_json::to_value(&output).unwrap(),
            serde_json::to_value(&chunks).unwrap()
        );
    }

    #[tokio::test]
    async fn serial_stages_observe_previous_stage_output() {
        let serial = SerialPolicy::new(vec![
            Arc::new(UppercasePolicy::boxed()) as Arc<dyn Policy>,
            Arc::new(Simple::new(AppendBang)) as Arc<dyn Policy>,
        ]);

        let output = run_streaming(
            &serial,
            vec![
                ChatChunk::text("hello ", "m"),
                ChatChunk::text("world", "m"),
                ChatChunk::finish(FinishReason::Stop, "m"),
            ],
        )
        .await;

        let text: String = output
            .iter()
            .filter_map(|chunk| chunk.primary_delta().and_then(|delta| delta.content.clone()))
            .collect();
        assert_eq!(text, "HELLO WORLD!");

        let finish = output
            .iter()
            .filter_map(ChatChunk::primary_finish_reason)
            .next_back();
        assert_eq!(finish, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn compose_policy_flattens_existing_chains() {
        let base: Arc<dyn Policy> = Arc::new(SerialPolicy::new(vec![
            Arc::new(TagRequest("a")) as Arc<dyn Policy>,
            Arc::new(TagRequest("c")) as Arc<dyn Policy>,
        ]));

        let composed = compose_policy(base, Arc::new(TagRequest("b")), Some(1));
        assert_eq!(composed.members().len(), 3);

        let (events, _worker) = EventBus::for_tests();
        let mut ctx = PolicyContext::new("t-1", None, events);
        let request = composed.on_request(chat_request(), &mut ctx).await.unwrap();
        assert_eq!(request.model, "m+a+b+c");
    }

    #[tokio::test]
    async fn compose_policy_appends_by_default() {
        let composed = compose_policy(Arc::new(TagRequest("a")), Arc::new(TagRequest("b")), None);
        let composed = compose_policy(composed, Arc::new(TagRequest("c")), None);

        let (events, _worker) = EventBus::for_tests();
        let mut ctx = PolicyContext::new("t-1", None, events);
        let request = composed.on_request(chat_request(), &mut ctx).await.unwrap();
        assert_eq!(request.model, "m+a+b+c");
    }

    #[tokio::test]
    async fn serial_chain_conforms_to_anthropic_only_when_all_members_do() {
        let noop_chain = SerialPolicy::new(vec![Arc::new(NoOpPolicy) as Arc<dyn Policy>]);
        assert!(noop_chain.as_anthropic().is_none());
    }

    #[tokio::test]
    async fn parallel_merge_prefers_first_modification() {
        let parallel = ParallelPolicy::new(vec![
            Arc::new(NoOpPolicy) as Arc<dyn Policy>,
            Arc::new(TagRequest("x")) as Arc<dyn Policy>,
        ]);

        let (events, _worker) = EventBus::for_tests();
        let mut ctx = PolicyContext::new("t-1", None, events);
        let request = parallel.on_request(chat_request(), &mut ctx).await.unwrap();
        assert_eq!(request.model, "m+x");
    }

    #[tokio::test]
    async fn parallel_streaming_last_writer_wins() {
        let parallel = ParallelPolicy::new(vec![
            Arc::new(NoOpPolicy) as Arc<dyn Policy>,
            Arc::new(UppercasePolicy::boxed()) as Arc<dyn Policy>,
        ]);

        let output = run_streaming(
            &parallel,
            vec![
                ChatChunk::text("hi", "m"),
                ChatChunk::finish(FinishReason::Stop, "m"),
            ],
        )
        .await;

        let text: String = output
            .iter()
            .filter_map(|chunk| chunk.primary_delta().and_then(|delta| delta.content.clone()))
            .collect();
        assert_eq!(text, "HI");
    }
}
