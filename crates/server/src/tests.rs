//! End-to-end tests over the router with a scripted upstream.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use futures::stream;
use llm::{
    LlmClient,
    messages::openai::{ChatChunk, ChatRequest, ChatResponse, FinishReason},
};
use policy::{Policy as _, events::EventBus, manager::PolicyManager, store::StreamContextStore};
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::{AppState, router};

struct ScriptedClient {
    chunks: Vec<ChatChunk>,
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(&self, request: ChatRequest) -> llm::Result<ChatResponse> {
        Ok(serde_json::from_value(json!({
            "id": "chatcmpl-scripted",
            "object": "chat.completion",
            "created": 0,
            "model": request.model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "scripted"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3}
        }))
        .unwrap())
    }

    async fn stream(&self, _request: ChatRequest) -> llm::Result<llm::ChunkStream> {
        let chunks: Vec<llm::Result<ChatChunk>> = self.chunks.clone().into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

fn tool_chunk(index: u32, id: Option<&str>, name: Option<&str>, arguments: Option<&str>) -> ChatChunk {
    serde_json::from_value(json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "created": 1,
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "delta": {
                "tool_calls": [{
                    "index": index,
                    "id": id,
                    "function": {"name": name, "arguments": arguments}
                }]
            },
            "finish_reason": null
        }]
    }))
    .unwrap()
}

async fn test_router(config_toml: &str, chunks: Vec<ChatChunk>) -> (Router, Arc<AppState>) {
    let config: config::Config = toml::from_str(config_toml).unwrap();
    let (events, _worker) = EventBus::for_tests();
    let store = Arc::new(
        StreamContextStore::from_config(&config.policy.stream_store)
            .await
            .unwrap(),
    );
    let manager = Arc::new(PolicyManager::default());

    let state = Arc::new(AppState::new(
        config.clone(),
        manager,
        Arc::new(ScriptedClient { chunks }),
        events,
        store,
    ));

    (router(state.clone(), &config), state)
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, String) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

fn post(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn sse_data_lines(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter_map(|block| {
            block
                .lines()
                .find_map(|line| line.strip_prefix("data: ").map(str::to_string))
        })
        .collect()
}

fn sse_event_names(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter_map(|block| {
            block
                .lines()
                .find_map(|line| line.strip_prefix("event: ").map(str::to_string))
        })
        .collect()
}

#[tokio::test]
async fn health_endpoint_responds() {
    let (router, _state) = test_router("", Vec::new()).await;

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, r#"{"status":"ok"}"#);
}

#[tokio::test]
async fn passthrough_openai_streaming_bytes() {
    let chunks = vec![
        ChatChunk::text("H", "gpt-4o-mini"),
        ChatChunk::text("i", "gpt-4o-mini"),
        ChatChunk::finish(FinishReason::Stop, "gpt-4o-mini"),
    ];
    let (router, _state) = test_router("", chunks).await;

    let (status, body) = send(
        router,
        post(
            "/v1/chat/completions",
            json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "user", "content": "Say hi"}],
                "stream": true
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);

    let data = sse_data_lines(&body);
    assert_eq!(data.len(), 4);

    let first: Value = serde_json::from_str(&data[0]).unwrap();
    assert_eq!(first["choices"][0]["delta"]["content"], "H");
    let second: Value = serde_json::from_str(&data[1]).unwrap();
    assert_eq!(second["choices"][0]["delta"]["content"], "i");
    let third: Value = serde_json::from_str(&data[2]).unwrap();
    assert_eq!(third["choices"][0]["finish_reason"], "stop");
    assert_eq!(data[3], "[DONE]");
}

#[tokio::test]
async fn anthropic_streaming_tool_call_event_order() {
    let chunks = vec![
        ChatChunk::text("Let me check.", "gpt-4o-mini"),
        tool_chunk(0, Some("toolu_1"), Some("get_weather"), None),
        tool_chunk(0, None, None, Some(r#"{"loc"#)),
        tool_chunk(0, None, None, Some(r#"ation":"SF"}"#)),
        ChatChunk::finish(FinishReason::ToolCalls, "gpt-4o-mini"),
    ];
    let (router, _state) = test_router("", chunks).await;

    let (status, body) = send(
        router,
        post(
            "/v1/messages",
            json!({
                "model": "gpt-4o-mini",
                "max_tokens": 1024,
                "stream": true,
                "messages": [{"role": "user", "content": "Weather in SF?"}],
                "tools": [{
                    "name": "get_weather",
                    "description": "Get the weather",
                    "input_schema": {"type": "object"}
                }]
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);

    assert_eq!(
        sse_event_names(&body),
        [
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    let data = sse_data_lines(&body);

    let tool_start: Value = serde_json::from_str(&data[4]).unwrap();
    assert_eq!(tool_start["index"], 1);
    assert_eq!(tool_start["content_block"]["type"], "tool_use");
    assert_eq!(tool_start["content_block"]["id"], "toolu_1");
    assert_eq!(tool_start["content_block"]["name"], "get_weather");
    assert_eq!(tool_start["content_block"]["input"], json!({}));

    let fragments: String = [5, 6]
        .iter()
        .map(|&i| {
            let event: Value = serde_json::from_str(&data[i]).unwrap();
            event["delta"]["partial_json"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(fragments, r#"{"location":"SF"}"#);

    let message_delta: Value = serde_json::from_str(&data[8]).unwrap();
    assert_eq!(message_delta["delta"]["stop_reason"], "tool_use");
}

#[tokio::test]
async fn non_streaming_anthropic_response_is_converted() {
    let (router, _state) = test_router("", Vec::new()).await;

    let (status, body) = send(
        router,
        post(
            "/v1/messages",
            json!({
                "model": "gpt-4o-mini",
                "max_tokens": 100,
                "messages": [{"role": "user", "content": "hi"}]
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["type"], "message");
    assert_eq!(value["role"], "assistant");
    assert_eq!(value["content"][0]["text"], "scripted");
    assert_eq!(value["stop_reason"], "end_turn");
}

#[tokio::test]
async fn missing_client_key_is_rejected_in_client_format() {
    let config = indoc::indoc! {r#"
        [server]
        client_api_key = "sk-clients"
    "#};
    let (router, _state) = test_router(config, Vec::new()).await;

    let (status, body) = send(
        router.clone(),
        post("/v1/chat/completions", json!({"model": "m", "messages": []})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["error"]["type"], "authentication_error");

    let (status, body) = send(
        router,
        post(
            "/v1/messages",
            json!({"model": "m", "max_tokens": 1, "messages": []}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["type"], "error");
    assert_eq!(value["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn valid_client_key_is_accepted() {
    let config = indoc::indoc! {r#"
        [server]
        client_api_key = "sk-clients"
    "#};
    let (router, _state) = test_router(config, Vec::new()).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("authorization", "Bearer sk-clients")
        .body(Body::from(
            json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "user", "content": "hi"}]
            })
            .to_string(),
        ))
        .unwrap();

    let (status, body) = send(router, request).await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["choices"][0]["message"]["content"], "scripted");
}

#[tokio::test]
async fn malformed_request_is_an_invalid_request_error() {
    let (router, _state) = test_router("", Vec::new()).await;

    let (status, body) = send(
        router,
        post("/v1/chat/completions", json!({"messages": "not-an-array"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn oversized_requests_are_rejected_before_parsing() {
    let config = indoc::indoc! {r#"
        [server]
        max_request_bytes = 64
    "#};
    let (router, _state) = test_router(config, Vec::new()).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("content-length", "1000000")
        .body(Body::from("x".repeat(128)))
        .unwrap();

    let (status, _body) = send(router, request).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn admin_surface_requires_the_admin_key() {
    let config = indoc::indoc! {r#"
        [server]
        admin_api_key = "sk-admin"
    "#};
    let (router, _state) = test_router(config, Vec::new()).await;

    let request = Request::builder()
        .uri("/admin/policy/current")
        .body(Body::empty())
        .unwrap();
    let (status, _body) = send(router.clone(), request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let request = Request::builder()
        .uri("/admin/policy/current")
        .header("x-api-key", "sk-admin")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(router, request).await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["policy"], "noop");
}

#[tokio::test]
async fn policy_activation_affects_new_transactions() {
    let config = indoc::indoc! {r#"
        [server]
        admin_api_key = "sk-admin"
    "#};
    let (router, state) = test_router(config, Vec::new()).await;

    // A transaction in flight keeps the policy captured at request start.
    let captured_before_swap = state.manager.current();
    assert_eq!(captured_before_swap.name(), "noop");

    let request = Request::builder()
        .method("POST")
        .uri("/admin/policy/activate")
        .header("content-type", "application/json")
        .header("x-api-key", "sk-admin")
        .body(Body::from(
            json!({"class": "warden.policies:UppercasePolicy"}).to_string(),
        ))
        .unwrap();
    let (status, body) = send(router.clone(), request).await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["status"], "activated");

    assert_eq!(captured_before_swap.name(), "noop");
    assert_eq!(state.manager.current().name(), "uppercase");

    // A transaction arriving after the swap runs under the new policy.
    let (status, body) = send(
        router,
        post(
            "/v1/chat/completions",
            json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "user", "content": "hi"}]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["choices"][0]["message"]["content"], "SCRIPTED");
}

#[tokio::test]
async fn validate_reports_errors_without_activating() {
    let config = indoc::indoc! {r#"
        [server]
        admin_api_key = "sk-admin"
    "#};
    let (router, state) = test_router(config, Vec::new()).await;

    let request = Request::builder()
        .method("POST")
        .uri("/admin/policies/validate")
        .header("content-type", "application/json")
        .header("x-api-key", "sk-admin")
        .body(Body::from(
            json!({"class": "warden.policies:DoesNotExist"}).to_string(),
        ))
        .unwrap();
    let (status, body) = send(router, request).await;

    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["valid"], false);
    assert_eq!(state.manager.current().name(), "noop");
}
