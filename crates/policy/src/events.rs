//! Structured observability records and the best-effort sink fan-out.
//!
//! Records are published with `try_send` onto a bounded queue; a
//! supervised worker drains the queue to every registered sink. Publishing
//! never blocks the request path and never fails a transaction - records
//! dropped under overload are counted and surfaced in the logs.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::{sync::mpsc, task::JoinHandle};

/// Seconds since the Unix epoch.
pub fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

/// A structured record emitted at a transaction boundary.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventRecord {
    /// A client request arrived.
    RequestReceived {
        /// Transaction id.
        transaction_id: String,
        /// Unix timestamp.
        timestamp: u64,
        /// Client protocol tag (`openai` or `anthropic`).
        client_format: String,
        /// Session id, when one was identified.
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Request body as JSON, when payload logging is enabled.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<String>,
    },

    /// The (possibly transformed) request was sent upstream.
    BackendRequest {
        /// Transaction id.
        transaction_id: String,
        /// Unix timestamp.
        timestamp: u64,
        /// Requested model.
        model: String,
        /// Request body as JSON, when payload logging is enabled.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<String>,
    },

    /// The upstream returned (or finished streaming) a response.
    BackendResponse {
        /// Transaction id.
        transaction_id: String,
        /// Unix timestamp.
        timestamp: u64,
        /// Outcome: `ok`, `error`, `timeout` or `cancelled`.
        status: String,
        /// Response body as JSON, when payload logging is enabled.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<String>,
    },

    /// The response (or terminal error) was delivered to the client.
    ClientResponse {
        /// Transaction id.
        transaction_id: String,
        /// Unix timestamp.
        timestamp: u64,
        /// Outcome: `ok`, `error`, `timeout` or `cancelled`.
        status: String,
        /// Response body as JSON, when payload logging is enabled.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<String>,
    },

    /// A policy recorded a decision.
    PolicyDecision {
        /// Transaction id.
        transaction_id: String,
        /// Unix timestamp.
        timestamp: u64,
        /// Decision type, e.g. `tool_call_blocked`.
        event_type: String,
        /// Human-readable summary.
        summary: String,
        /// Structured detail payload.
        details: serde_json::Value,
    },
}

impl EventRecord {
    /// The transaction this record belongs to.
    pub fn transaction_id(&self) -> &str {
        match self {
            EventRecord::RequestReceived { transaction_id, .. }
            | EventRecord::BackendRequest { transaction_id, .. }
            | EventRecord::BackendResponse { transaction_id, .. }
            | EventRecord::ClientResponse { transaction_id, .. }
            | EventRecord::PolicyDecision { transaction_id, .. } => transaction_id,
        }
    }
}

/// A destination for event records.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one record. Failures are logged by the worker, never
    /// propagated.
    async fn deliver(&self, record: &EventRecord) -> anyhow::Result<()>;

    /// Sink name for diagnostics.
    fn name(&self) -> &str;
}

/// Sink that writes records to the process log.
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn deliver(&self, record: &EventRecord) -> anyhow::Result<()> {
        let json = serde_json::to_string(record)?;
        log::info!("event {json}");
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Cloneable publish handle onto the event queue.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<EventRecord>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Start the bus: returns the publish handle and the drain worker.
    ///
    /// The worker exits once every publish handle is dropped and the queue
    /// is drained.
    pub fn start(capacity: usize, sinks: Vec<Box<dyn EventSink>>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<EventRecord>(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));

        let worker = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                for sink in &sinks {
                    if let Err(error) = sink.deliver(&record).await {
                        log::warn!(
                            "Event sink '{}' failed for transaction {}: {error}",
                            sink.name(),
                            record.transaction_id()
                        );
                    }
                }
            }
        });

        (Self { tx, dropped }, worker)
    }

    /// A bus with a log sink, sized for unit tests.
    pub fn for_tests() -> (Self, JoinHandle<()>) {
        Self::start(64, vec![Box::new(LogSink)])
    }

    /// Publish a record, best-effort.
    ///
    /// Returns immediately; a full queue drops the record and bumps the
    /// drop counter.
    pub fn publish(&self, record: EventRecord) {
        if let Err(error) = self.tx.try_send(record) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            match error {
                mpsc::error::TrySendError::Full(record) => {
                    log::warn!(
                        "Event queue full; dropped record for transaction {} ({total} dropped so far)",
                        record.transaction_id()
                    );
                }
                mpsc::error::TrySendError::Closed(_) => {
                    log::debug!("Event worker stopped; record dropped ({total} dropped so far)");
                }
            }
        }
    }

    /// Number of records dropped because the queue was full or closed.
    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
