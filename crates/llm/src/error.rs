use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::messages::{anthropic, openai};

pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// Gateway errors with appropriate HTTP status codes and wire mappings.
///
/// Both client protocols use the same error-type vocabulary
/// (`authentication_error`, `rate_limit_error`, …); only the envelope
/// differs. [`LlmError::into_response`] produces the OpenAI envelope,
/// [`AnthropicErrorResponse`] the Anthropic one.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Client credentials missing or invalid.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Malformed client request or schema mismatch.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The requested model is unknown upstream.
    #[error("{0}")]
    ModelNotFound(String),

    /// Upstream rate limit hit.
    #[error("Rate limit exceeded: {message}")]
    RateLimitExceeded {
        /// Provider-supplied message.
        message: String,
    },

    /// The upstream provider returned an error status.
    #[error("Provider API error ({status}): {message}")]
    ProviderApiError {
        /// Upstream HTTP status, preserved for the client.
        status: u16,
        /// Provider-supplied message.
        message: String,
    },

    /// Network or connection failure talking to the provider.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The upstream call exceeded its timeout.
    #[error("Upstream request timed out after {0} seconds")]
    UpstreamTimeout(u64),

    /// A policy hook failed. The policy name is logged, never exposed.
    #[error("Policy '{policy}' failed: {message}")]
    PolicyError {
        /// Name of the failing policy.
        policy: String,
        /// Internal failure description.
        message: String,
    },

    /// No chunk progress and no keepalive within the stall window.
    #[error("Stream stalled: no progress for {0} seconds")]
    Stalled(u64),

    /// The policy could not write to the egress queue in time; the client
    /// is presumed gone.
    #[error("Egress write timed out after {0} seconds")]
    EgressTimeout(u64),

    /// The client disconnected or the transaction was cancelled.
    #[error("Transaction cancelled")]
    Cancelled,

    /// Internal error. `Some` messages come from a provider and may be
    /// shown; `None` must not leak details.
    #[error("Internal server error")]
    InternalError(Option<String>),
}

impl LlmError {
    /// The HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            Self::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ConnectionError(_) => StatusCode::BAD_GATEWAY,
            Self::ProviderApiError { status, .. } => match *status {
                400 => StatusCode::BAD_REQUEST,
                401 => StatusCode::UNAUTHORIZED,
                403 => StatusCode::FORBIDDEN,
                404 => StatusCode::NOT_FOUND,
                429 => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::BAD_GATEWAY,
            },
            Self::UpstreamTimeout(_) | Self::Stalled(_) | Self::EgressTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_GATEWAY),
            Self::PolicyError { .. } | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The error type string, shared by both client conventions.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::AuthenticationFailed(_) => "authentication_error",
            Self::ModelNotFound(_) => "not_found_error",
            Self::RateLimitExceeded { .. } => "rate_limit_error",
            Self::ConnectionError(_) | Self::ProviderApiError { .. } => "api_error",
            Self::Stalled(_) => "overloaded_error",
            Self::UpstreamTimeout(_) | Self::EgressTimeout(_) => "api_error",
            Self::Cancelled => "api_error",
            Self::PolicyError { .. } => "api_error",
            Self::InternalError(_) => "api_error",
        }
    }

    /// Message that is safe to expose to API consumers.
    ///
    /// Policy internals and gateway internals are not leaked; provider
    /// messages are passed through.
    pub fn client_message(&self) -> String {
        match self {
            Self::PolicyError { .. } => "Policy processing failed".to_string(),
            Self::InternalError(Some(provider_msg)) => provider_msg.clone(),
            Self::InternalError(None) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    /// This error as an Anthropic in-stream `error` event.
    pub fn to_stream_event(&self) -> anthropic::StreamEvent {
        anthropic::StreamEvent::Error {
            error: anthropic::ErrorDetail {
                error_type: self.error_type().to_string(),
                message: self.client_message(),
            },
        }
    }

    /// This error as an OpenAI error payload (used both for HTTP bodies
    /// and in-stream terminal error chunks).
    pub fn to_error_response(&self) -> openai::ErrorResponse {
        openai::ErrorResponse {
            error: openai::ErrorDetail {
                message: self.client_message(),
                error_type: self.error_type().to_string(),
                code: Some(self.status_code().as_u16()),
            },
        }
    }
}

impl IntoResponse for LlmError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.to_error_response();

        (status, Json(body)).into_response()
    }
}

/// The same error rendered in the Anthropic envelope.
pub struct AnthropicErrorResponse {
    status: StatusCode,
    body: anthropic::ErrorResponse,
}

impl From<LlmError> for AnthropicErrorResponse {
    fn from(error: LlmError) -> Self {
        let status = error.status_code();
        let body = anthropic::ErrorResponse::new(error.error_type(), error.client_message());

        Self { status, body }
    }
}

impl IntoResponse for AnthropicErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub type AnthropicResult<T> = std::result::Result<T, AnthropicErrorResponse>;
