//! Per-transaction context objects handed to policy hooks.
//!
//! Policies are immutable and shared across transactions; everything
//! request-scoped lives here. The streaming context additionally owns the
//! ingress aggregator state and a writer handle onto the transaction's
//! egress queue.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use llm::messages::openai::{ChatChunk, ChatRequest, ToolCall};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    aggregator::{AggregationError, ChunkAggregator},
    events::EventBus,
    state::StreamState,
    store::StreamContextStore,
};

/// Typed per-transaction storage for policy state.
///
/// Policies stay stateless by keeping request-scoped values here, keyed by
/// type. Each policy defines its own private state type, which makes
/// collisions between composed policies impossible.
#[derive(Default)]
pub struct Scratchpad {
    slots: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl Scratchpad {
    /// Store a value, replacing any previous value of the same type.
    pub fn insert<T: Send + 'static>(&mut self, value: T) {
        self.slots.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Borrow the stored value of this type.
    pub fn get<T: Send + 'static>(&self) -> Option<&T> {
        self.slots
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref())
    }

    /// Mutably borrow the stored value of this type.
    pub fn get_mut<T: Send + 'static>(&mut self) -> Option<&mut T> {
        self.slots
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut())
    }

    /// Borrow the value of this type, inserting a default first if absent.
    pub fn get_or_default<T: Default + Send + 'static>(&mut self) -> &mut T {
        self.slots
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::<T>::default());
        self.get_mut()
            .unwrap_or_else(|| unreachable!("slot inserted above"))
    }

    /// Remove and return the stored value of this type.
    pub fn remove<T: Send + 'static>(&mut self) -> Option<T> {
        self.slots
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast().ok())
            .map(|boxed| *boxed)
    }
}

/// Shared stall-timer handle.
///
/// The orchestrator's stall monitor cancels the transaction when too much
/// time passes without a chunk or a [`Keepalive::touch`]. Policies doing
/// long-running work call `touch` at a cadence faster than the configured
/// stall timeout.
#[derive(Clone)]
pub struct Keepalive {
    last: Arc<Mutex<Instant>>,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self::new()
    }
}

impl Keepalive {
    /// A fresh timer starting now.
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Reset the stall timer.
    pub fn touch(&self) {
        if let Ok(mut last) = self.last.lock() {
            *last = Instant::now();
        }
    }

    /// Time since the last touch.
    pub fn elapsed(&self) -> Duration {
        self.last
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

/// Error writing to the egress queue.
#[derive(Debug, Error)]
pub enum EgressSendError {
    /// The put timed out; the client is presumed dead.
    #[error("egress write timed out after {0} seconds")]
    Timeout(u64),
    /// The transaction was cancelled and the queue closed.
    #[error("egress queue closed")]
    Closed,
}

/// Writer half of the egress queue.
///
/// The orchestrator owns the receiving half; composed policies get
/// buffer-backed writers whose output feeds the next stage instead.
pub(crate) enum EgressWriter {
    /// Bounded channel to the client formatter.
    Channel {
        tx: mpsc::Sender<llm::Result<ChatChunk>>,
        timeout: Duration,
    },
    /// Local buffer, drained by the composition layer.
    Buffer(Vec<ChatChunk>),
}

impl EgressWriter {
    async fn send(&mut self, chunk: ChatChunk) -> Result<(), EgressSendError> {
        match self {
            EgressWriter::Channel { tx, timeout } => {
                match tokio::time::timeout(*timeout, tx.send(Ok(chunk))).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(EgressSendError::Closed),
                    Err(_) => Err(EgressSendError::Timeout(timeout.as_secs())),
                }
            }
            EgressWriter::Buffer(buffer) => {
                buffer.push(chunk);
                Ok(())
            }
        }
    }
}

/// Context for non-streaming policy hooks and event emission.
pub struct PolicyContext {
    /// The transaction id correlating all records of this cycle.
    pub transaction_id: String,
    /// Optional session id extracted at ingress.
    pub session_id: Option<String>,
    /// The request driving this transaction. Set by the orchestrator after
    /// `on_request` ran, so `on_response` hooks can consult it.
    pub request: Option<ChatRequest>,
    events: EventBus,
    store: Option<Arc<StreamContextStore>>,
    /// Typed per-transaction storage.
    pub scratchpad: Scratchpad,
}

impl PolicyContext {
    /// Create a context for one transaction.
    pub fn new(transaction_id: impl Into<String>, session_id: Option<String>, events: EventBus) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            session_id,
            request: None,
            events,
            store: None,
            scratchpad: Scratchpad::default(),
        }
    }

    /// Attach the per-call streaming context store.
    pub fn with_store(mut self, store: Arc<StreamContextStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The per-call streaming context store, when one is attached.
    pub fn store(&self) -> Option<&StreamContextStore> {
        self.store.as_deref()
    }

    pub(crate) fn store_handle(&self) -> Option<Arc<StreamContextStore>> {
        self.store.clone()
    }

    /// Emit a policy-decision record to the event sink.
    ///
    /// Delivery is best-effort and never affects the transaction outcome.
    pub fn emit(&self, event_type: &str, summary: &str, details: serde_json::Value) {
        self.events.publish(crate::events::EventRecord::PolicyDecision {
            transaction_id: self.transaction_id.clone(),
            timestamp: crate::events::unix_timestamp(),
            event_type: event_type.to_string(),
            summary: summary.to_string(),
            details,
        });
    }

    /// The event bus handle for this transaction.
    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

/// Context for streaming policy hooks: the ingress state, the egress
/// writer, the scratchpad and the keepalive handle.
pub struct StreamingPolicyContext {
    /// The transaction id correlating all records of this cycle.
    pub transaction_id: String,
    /// The request after `on_request`, as sent upstream.
    pub request: ChatRequest,
    /// Typed per-transaction storage.
    pub scratchpad: Scratchpad,
    aggregator: ChunkAggregator,
    egress: EgressWriter,
    keepalive: Keepalive,
    events: EventBus,
    store: Option<Arc<StreamContextStore>>,
}

impl StreamingPolicyContext {
    /// Context whose egress feeds the transaction's true egress queue.
    pub(crate) fn for_channel(
        transaction_id: impl Into<String>,
        request: ChatRequest,
        tx: mpsc::Sender<llm::Result<ChatChunk>>,
        timeout: Duration,
        keepalive: Keepalive,
        events: EventBus,
        store: Option<Arc<StreamContextStore>>,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            request,
            scratchpad: Scratchpad::default(),
            aggregator: ChunkAggregator::new(),
            egress: EgressWriter::Channel { tx, timeout },
            keepalive,
            events,
            store,
        }
    }

    /// Context whose egress collects into a local buffer. Used by the
    /// composition layer to chain sub-policies.
    pub(crate) fn for_buffer(
        transaction_id: impl Into<String>,
        request: ChatRequest,
        keepalive: Keepalive,
        events: EventBus,
        store: Option<Arc<StreamContextStore>>,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            request,
            scratchpad: Scratchpad::default(),
            aggregator: ChunkAggregator::new(),
            egress: EgressWriter::Buffer(Vec::new()),
            keepalive,
            events,
            store,
        }
    }

    /// The per-call streaming context store, when one is attached.
    ///
    /// Policies use it for cross-chunk memory that must survive process
    /// boundaries (`append_delta`, `get_accumulated`, `get_index`,
    /// `clear`), keyed by the transaction id.
    pub fn store(&self) -> Option<&StreamContextStore> {
        self.store.as_deref()
    }

    /// Feed one normalized chunk into the ingress aggregator.
    pub(crate) fn feed(&mut self, chunk: ChatChunk) -> Result<(), AggregationError> {
        self.aggregator.feed(chunk)
    }

    /// A buffer-backed stage context sharing this context's identity,
    /// keepalive and event bus. Used by the composition layer.
    pub(crate) fn make_stage(&self) -> StreamingPolicyContext {
        StreamingPolicyContext::for_buffer(
            self.transaction_id.clone(),
            self.request.clone(),
            self.keepalive.clone(),
            self.events.clone(),
            self.store.clone(),
        )
    }

    /// Drain chunks collected by a buffer-backed context.
    pub(crate) fn take_buffered(&mut self) -> Vec<ChatChunk> {
        match &mut self.egress {
            EgressWriter::Buffer(buffer) => std::mem::take(buffer),
            EgressWriter::Channel { .. } => Vec::new(),
        }
    }

    /// The aggregated view of the stream so far.
    pub fn state(&self) -> &StreamState {
        self.aggregator.state()
    }

    /// Signal that the policy is still working; resets the stall timer.
    pub fn keepalive(&self) {
        self.keepalive.touch();
    }

    /// Emit a policy-decision record to the event sink.
    pub fn emit(&self, event_type: &str, summary: &str, details: serde_json::Value) {
        self.events.publish(crate::events::EventRecord::PolicyDecision {
            transaction_id: self.transaction_id.clone(),
            timestamp: crate::events::unix_timestamp(),
            event_type: event_type.to_string(),
            summary: summary.to_string(),
            details,
        });
    }

    /// The event bus handle for this transaction.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Enqueue a chunk for the client. The only channel by which a policy
    /// affects the client stream.
    pub async fn send_chunk(&mut self, chunk: ChatChunk) -> Result<(), EgressSendError> {
        self.egress.send(chunk).await
    }

    /// Enqueue a synthetic text chunk.
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), EgressSendError> {
        let model = self.request.model.clone();
        self.send_chunk(ChatChunk::text(text, model)).await
    }

    /// Enqueue a synthetic chunk carrying one complete tool call.
    pub async fn send_tool_call(&mut self, call: ToolCall, index: u32) -> Result<(), EgressSendError> {
        let model = self.request.model.clone();
        self.send_chunk(ChatChunk::tool_call(call, index, model)).await
    }

    /// Pass the most recently received raw chunk through unchanged.
    pub async fn passthrough_last_chunk(&mut self) -> Result<(), EgressSendError> {
        let Some(chunk) = self.state().last_chunk().cloned() else {
            return Ok(());
        };
        self.send_chunk(chunk).await
    }

    /// Emit every raw chunk buffered since the last emission, preserving
    /// the original chunk timing for unchanged content.
    pub async fn passthrough_accumulated(&mut self) -> Result<(), EgressSendError> {
        let start = self.state().last_emission_index();
        let pending: Vec<ChatChunk> = self.state().raw_chunks()[start..].to_vec();

        for chunk in pending {
            self.send_chunk(chunk).await?;
        }

        let total = self.state().raw_chunks().len();
        self.aggregator.state_mut().last_emission_index = total;
        Ok(())
    }

    /// Mark every chunk received so far as emitted without sending them.
    /// Used by policies that replace a block instead of passing it through.
    pub fn mark_emitted(&mut self) {
        let total = self.state().raw_chunks().len();
        self.aggregator.state_mut().last_emission_index = total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, PartialEq, Debug)]
    struct Counter(u32);

    #[test]
    fn scratchpad_round_trips_typed_values() {
        let mut scratchpad = Scratchpad::default();

        scratchpad.insert(Counter(3));
        assert_eq!(scratchpad.get::<Counter>(), Some(&Counter(3)));

        scratchpad.get_mut::<Counter>().unwrap().0 += 1;
        assert_eq!(scratchpad.remove::<Counter>(), Some(Counter(4)));
        assert!(scratchpad.get::<Counter>().is_none());
    }

    #[test]
    fn scratchpad_get_or_default_inserts_once() {
        let mut scratchpad = Scratchpad::default();

        scratchpad.get_or_default::<Counter>().0 = 7;
        assert_eq!(scratchpad.get_or_default::<Counter>().0, 7);
    }

    #[test]
    fn keepalive_touch_resets_elapsed() {
        let keepalive = Keepalive::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(keepalive.elapsed() >= Duration::from_millis(20));

        keepalive.touch();
        assert!(keepalive.elapsed() < Duration::from_millis(20));
    }

    fn chat_request() -> ChatRequest {
        serde_json::from_value(serde_json::json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn buffered_context_collects_chunks() {
        let (events, _worker) = EventBus::for_tests();
        let mut ctx = StreamingPolicyContext::for_buffer("t-1", chat_request(), Keepalive::new(), events, None);

        ctx.send_text("a").await.unwrap();
        ctx.send_text("b").await.unwrap();

        let buffered = ctx.take_buffered();
        assert_eq!(buffered.len(), 2);
        assert!(ctx.take_buffered().is_empty());
    }

    #[tokio::test]
    async fn passthrough_accumulated_tracks_emission_index() {
        let (events, _worker) = EventBus::for_tests();
        let mut ctx = StreamingPolicyContext::for_buffer("t-1", chat_request(), Keepalive::new(), events, None);

        ctx.feed(ChatChunk::text("a", "m")).unwrap();
        ctx.feed(ChatChunk::text("b", "m")).unwrap();

        ctx.passthrough_accumulated().await.unwrap();
        assert_eq!(ctx.take_buffered().len(), 2);
        assert_eq!(ctx.state().last_emission_index(), 2);

        ctx.feed(ChatChunk::text("c", "m")).unwrap();
        ctx.passthrough_accumulated().await.unwrap();
        assert_eq!(ctx.take_buffered().len(), 1);
    }

    #[tokio::test]
    async fn egress_timeout_reports_dead_client() {
        let (tx, _rx) = mpsc::channel(1);
        let (events, _worker) = EventBus::for_tests();
        let mut ctx = StreamingPolicyContext::for_channel(
            "t-1",
            chat_request(),
            tx,
            Duration::from_millis(10),
            Keepalive::new(),
            events,
            None,
        );

        // First write fills the queue; nobody drains it.
        ctx.send_text("a").await.unwrap();
        let error = ctx.send_text("b").await.unwrap_err();

        assert!(matches!(error, EgressSendError::Timeout(_)));
    }
}
