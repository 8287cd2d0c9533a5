//! The OpenAI chat-completions endpoint.

use std::{convert::Infallible, sync::Arc};

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response, Sse, sse::Event},
};
use futures::StreamExt;
use llm::{LlmError, messages::openai::ChatRequest};
use policy::{
    PolicyContext, PolicyOrchestrator, PolicyStream,
    events::{EventBus, EventRecord, unix_timestamp},
};
use tokio::sync::mpsc;

use crate::{AppState, auth, routes::ChannelStream, session};

/// Handle chat completion requests.
///
/// Supports both streaming and non-streaming responses. With
/// `stream: true` the response is sent as SSE `data:` lines terminated by
/// `data: [DONE]`; otherwise a standard JSON response is returned.
pub(crate) async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !auth::client_authorized(&headers, state.config.server.client_api_key.as_ref()) {
        return LlmError::AuthenticationFailed("Invalid or missing API key".to_string()).into_response();
    }

    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(error) => {
            return LlmError::InvalidRequest(format!("Malformed request body: {error}")).into_response();
        }
    };

    log::debug!(
        "Chat completions called for model '{}' with {} messages (streaming: {})",
        request.model,
        request.messages.len(),
        request.is_streaming()
    );

    let transaction_id = uuid::Uuid::new_v4().to_string();
    let session_id = session::from_headers(&headers);

    state.events.publish(EventRecord::RequestReceived {
        transaction_id: transaction_id.clone(),
        timestamp: unix_timestamp(),
        client_format: "openai".to_string(),
        session_id: session_id.clone(),
        payload: state
            .config
            .events
            .log_payloads
            .then(|| String::from_utf8_lossy(&body).into_owned()),
    });

    // The policy reference is captured here; admin swaps affect future
    // transactions only.
    let policy = state.manager.current();
    let orchestrator = PolicyOrchestrator::new(
        policy,
        Arc::clone(&state.client),
        state.events.clone(),
        state.orchestrator_settings(),
    );
    let mut ctx = PolicyContext::new(transaction_id.clone(), session_id, state.events.clone())
        .with_store(Arc::clone(&state.store));

    if request.is_streaming() {
        let stream = match orchestrator.stream(request, &mut ctx).await {
            Ok(stream) => stream,
            Err(error) => {
                emit_client_response(&state.events, &transaction_id, "error");
                return error.into_response();
            }
        };

        let rx = spawn_formatter(stream, state.events.clone(), transaction_id);
        Sse::new(ChannelStream(rx).map(Ok::<_, Infallible>)).into_response()
    } else {
        match orchestrator.complete(request, &mut ctx).await {
            Ok(response) => {
                emit_client_response(&state.events, &transaction_id, "ok");
                Json(response).into_response()
            }
            Err(error) => {
                emit_client_response(&state.events, &transaction_id, "error");
                error.into_response()
            }
        }
    }
}

/// Client formatter task: drains the egress stream into OpenAI SSE
/// events. Exactly one `[DONE]` sentinel is emitted, on success and on
/// failure alike.
fn spawn_formatter(mut stream: PolicyStream, events: EventBus, transaction_id: String) -> mpsc::Receiver<Event> {
    let (tx, rx) = mpsc::channel::<Event>(32);

    tokio::spawn(async move {
        let mut status = "ok";

        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    let json = serde_json::to_string(&chunk).unwrap_or_else(|error| {
                        log::error!("Failed to serialize chunk: {error}");
                        r#"{"error":"serialization failed"}"#.to_string()
                    });

                    if tx.send(Event::default().data(json)).await.is_err() {
                        status = "cancelled";
                        break;
                    }
                }
                Err(error) => {
                    status = terminal_status(&error);
                    log::warn!("Stream error for transaction {transaction_id}: {error}");

                    let json = serde_json::to_string(&error.to_error_response()).unwrap_or_else(|serialize_error| {
                        log::error!("Failed to serialize stream error: {serialize_error}");
                        r#"{"error":{"message":"stream failed","type":"api_error"}}"#.to_string()
                    });
                    let _ = tx.send(Event::default().data(json)).await;
                    break;
                }
            }
        }

        let _ = tx.send(Event::default().data("[DONE]")).await;

        events.publish(EventRecord::ClientResponse {
            transaction_id,
            timestamp: unix_timestamp(),
            status: status.to_string(),
            payload: None,
        });
    });

    rx
}

pub(crate) fn terminal_status(error: &LlmError) -> &'static str {
    match error {
        LlmError::Stalled(_) | LlmError::UpstreamTimeout(_) | LlmError::EgressTimeout(_) => "timeout",
        LlmError::Cancelled => "cancelled",
        _ => "error",
    }
}

fn emit_client_response(events: &EventBus, transaction_id: &str, status: &str) {
    events.publish(EventRecord::ClientResponse {
        transaction_id: transaction_id.to_string(),
        timestamp: unix_timestamp(),
        status: status.to_string(),
        payload: None,
    });
}
