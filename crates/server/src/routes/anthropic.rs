//! The Anthropic Messages endpoint.

use std::{convert::Infallible, sync::Arc};

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response, Sse, sse::Event},
};
use futures::StreamExt;
use llm::{
    AnthropicErrorResponse, LlmError, convert,
    convert::SseAssembler,
    messages::anthropic::{MessagesRequest, StreamEvent},
};
use policy::{
    AnthropicPolicy as _, Policy, PolicyContext, PolicyOrchestrator, PolicyStream,
    events::{EventBus, EventRecord, unix_timestamp},
};
use tokio::sync::mpsc;

use crate::{AppState, auth, routes::ChannelStream, session};

use super::openai::terminal_status;

/// Handle Anthropic Messages requests.
///
/// Supports both streaming and non-streaming responses. Streaming uses
/// the named-event SSE sequence (`message_start`,
/// `content_block_start/delta/stop`, `message_delta`, `message_stop`).
///
/// Policies implementing the native Anthropic hook set observe the
/// request, the response and every egress event in native form.
pub(crate) async fn messages(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    if !auth::client_authorized(&headers, state.config.server.client_api_key.as_ref()) {
        return AnthropicErrorResponse::from(LlmError::AuthenticationFailed(
            "Invalid or missing API key".to_string(),
        ))
        .into_response();
    }

    let request: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(error) => {
            return AnthropicErrorResponse::from(LlmError::InvalidRequest(format!(
                "Malformed request body: {error}"
            )))
            .into_response();
        }
    };

    log::debug!(
        "Messages endpoint called for model '{}' with {} messages (streaming: {})",
        request.model,
        request.messages.len(),
        request.stream.unwrap_or(false)
    );

    let transaction_id = uuid::Uuid::new_v4().to_string();
    let session_id = session::from_messages_request(&request);

    state.events.publish(EventRecord::RequestReceived {
        transaction_id: transaction_id.clone(),
        timestamp: unix_timestamp(),
        client_format: "anthropic".to_string(),
        session_id: session_id.clone(),
        payload: state
            .config
            .events
            .log_payloads
            .then(|| String::from_utf8_lossy(&body).into_owned()),
    });

    let policy = state.manager.current();
    let mut ctx = PolicyContext::new(transaction_id.clone(), session_id, state.events.clone())
        .with_store(Arc::clone(&state.store));

    // Native request hook for policies that opted into the Anthropic
    // interface; everything else sees the converted request.
    let request = match apply_native_request_hook(&policy, request, &mut ctx).await {
        Ok(request) => request,
        Err(error) => return AnthropicErrorResponse::from(error).into_response(),
    };

    let chat_request = convert::messages_request_to_chat(request);
    let model = chat_request.model.clone();
    let streaming = chat_request.is_streaming();

    let orchestrator = PolicyOrchestrator::new(
        Arc::clone(&policy),
        Arc::clone(&state.client),
        state.events.clone(),
        state.orchestrator_settings(),
    );

    if streaming {
        let stream = match orchestrator.stream(chat_request, &mut ctx).await {
            Ok(stream) => stream,
            Err(error) => {
                emit_client_response(&state.events, &transaction_id, "error");
                return AnthropicErrorResponse::from(error).into_response();
            }
        };

        let assembler = SseAssembler::new(format!("msg_{transaction_id}"), model);
        let rx = spawn_formatter(stream, assembler, policy, ctx, state.events.clone(), transaction_id);

        Sse::new(ChannelStream(rx).map(Ok::<_, Infallible>)).into_response()
    } else {
        let response = match orchestrator.complete(chat_request, &mut ctx).await {
            Ok(response) => response,
            Err(error) => {
                emit_client_response(&state.events, &transaction_id, "error");
                return AnthropicErrorResponse::from(error).into_response();
            }
        };

        let mut anthropic_response = convert::chat_response_to_messages(response);

        if let Some(native) = policy.as_anthropic() {
            anthropic_response = match native.on_messages_response(anthropic_response, &mut ctx).await {
                Ok(response) => response,
                Err(error) => {
                    log::error!("Native response hook failed: {error:#}");
                    emit_client_response(&state.events, &transaction_id, "error");
                    return AnthropicErrorResponse::from(LlmError::PolicyError {
                        policy: policy.name().to_string(),
                        message: format!("{error:#}"),
                    })
                    .into_response();
                }
            };
        }

        emit_client_response(&state.events, &transaction_id, "ok");
        Json(anthropic_response).into_response()
    }
}

async fn apply_native_request_hook(
    policy: &Arc<dyn Policy>,
    request: MessagesRequest,
    ctx: &mut PolicyContext,
) -> Result<MessagesRequest, LlmError> {
    let Some(native) = policy.as_anthropic() else {
        return Ok(request);
    };

    native.on_messages_request(request, ctx).await.map_err(|error| {
        log::error!("Native request hook failed: {error:#}");
        LlmError::PolicyError {
            policy: policy.name().to_string(),
            message: format!("{error:#}"),
        }
    })
}

/// Client formatter task: renders the internal chunk stream as the
/// Anthropic event sequence. Terminal events (`error`, `message_stop`)
/// bypass the native event filter so the stream-end discipline holds no
/// matter what a policy does.
fn spawn_formatter(
    mut stream: PolicyStream,
    mut assembler: SseAssembler,
    policy: Arc<dyn Policy>,
    mut ctx: PolicyContext,
    events: EventBus,
    transaction_id: String,
) -> mpsc::Receiver<Event> {
    let (tx, rx) = mpsc::channel::<Event>(32);

    tokio::spawn(async move {
        let mut status = "ok";

        'receive: while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    for event in assembler.feed(&chunk) {
                        if !forward_event(&tx, &policy, &mut ctx, event).await {
                            status = "cancelled";
                            break 'receive;
                        }
                    }
                }
                Err(error) => {
                    status = terminal_status(&error);
                    log::warn!("Stream error for transaction {transaction_id}: {error}");

                    for event in assembler.fail(error.to_stream_event()) {
                        if !forward_event(&tx, &policy, &mut ctx, event).await {
                            break;
                        }
                    }
                    break 'receive;
                }
            }
        }

        if status == "ok" {
            for event in assembler.end() {
                if !forward_event(&tx, &policy, &mut ctx, event).await {
                    status = "cancelled";
                    break;
                }
            }
        }

        events.publish(EventRecord::ClientResponse {
            transaction_id,
            timestamp: unix_timestamp(),
            status: status.to_string(),
            payload: None,
        });
    });

    rx
}

/// Send one event to the client, routing it through the native event
/// filter when the policy opted in. Returns false once the client is
/// gone.
async fn forward_event(
    tx: &mpsc::Sender<Event>,
    policy: &Arc<dyn Policy>,
    ctx: &mut PolicyContext,
    event: StreamEvent,
) -> bool {
    let filterable = !matches!(event, StreamEvent::MessageStop | StreamEvent::Error { .. });

    let event = if filterable
        && let Some(native) = policy.as_anthropic()
    {
        match native.on_stream_event(event.clone(), ctx).await {
            Ok(Some(event)) => event,
            Ok(None) => return true,
            Err(error) => {
                log::error!("Native event hook failed; passing the event through: {error:#}");
                event
            }
        }
    } else {
        event
    };

    let json = serde_json::to_string(&event).unwrap_or_else(|error| {
        log::error!("Failed to serialize stream event: {error}");
        r#"{"type":"error","error":{"type":"api_error","message":"serialization failed"}}"#.to_string()
    });

    tx.send(Event::default().event(event.name()).data(json)).await.is_ok()
}

fn emit_client_response(events: &EventBus, transaction_id: &str, status: &str) {
    events.publish(EventRecord::ClientResponse {
        transaction_id: transaction_id.to_string(),
        timestamp: unix_timestamp(),
        status: status.to_string(),
        payload: None,
    });
}
