//! Request body size limiting.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::AppState;

/// Rejects oversized request bodies by Content-Length before they are
/// read, with a 413 response.
pub(crate) async fn request_size_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let max_bytes = state.config.server.max_request_bytes;

    if matches!(request.method(), &Method::POST | &Method::PUT | &Method::PATCH) {
        let content_length = request
            .headers()
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());

        if let Some(length) = content_length
            && length > max_bytes
        {
            log::warn!(
                "Request rejected: {length} bytes exceeds the {max_bytes} byte limit ({} {})",
                request.method(),
                request.uri().path()
            );

            let body = serde_json::json!({
                "error": {
                    "message": format!(
                        "Request size {length} bytes exceeds maximum allowed size of {max_bytes} bytes"
                    ),
                    "type": "invalid_request_error",
                    "code": 413
                }
            });

            return (StatusCode::PAYLOAD_TOO_LARGE, axum::Json(body)).into_response();
        }
    }

    next.run(request).await
}
