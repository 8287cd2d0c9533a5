//! Session id extraction from client requests.
//!
//! Sessions correlate multiple transactions from the same end-user agent.
//! OpenAI-format clients pass an `x-session-id` header; Anthropic-format
//! clients (Claude Code among them) encode the session in
//! `metadata.user_id` as `user_<hash>_account__session_<uuid>`.

use std::sync::OnceLock;

use axum::http::HeaderMap;
use llm::messages::anthropic::MessagesRequest;
use regex::Regex;

/// Header OpenAI-format clients use to provide a session id.
pub(crate) const SESSION_HEADER: &str = "x-session-id";

fn session_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"_session_([a-f0-9-]+)$").unwrap_or_else(|_| unreachable!("pattern is valid"))
    })
}

/// Session id from the `x-session-id` header, if present and non-empty.
pub(crate) fn from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Session id extracted from an Anthropic request's `metadata.user_id`.
pub(crate) fn from_messages_request(request: &MessagesRequest) -> Option<String> {
    let user_id = request.metadata.as_ref()?.user_id.as_deref()?;

    session_pattern()
        .captures(user_id)
        .and_then(|captures| captures.get(1))
        .map(|capture| capture.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use serde_json::json;

    use super::*;

    #[test]
    fn extracts_session_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("sess-42"));

        assert_eq!(from_headers(&headers).as_deref(), Some("sess-42"));
    }

    #[test]
    fn empty_header_means_no_session() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static(""));

        assert_eq!(from_headers(&headers), None);
    }

    fn request_with_user_id(user_id: &str) -> MessagesRequest {
        serde_json::from_value(json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 100,
            "metadata": {"user_id": user_id},
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap()
    }

    #[test]
    fn extracts_session_from_metadata_suffix() {
        let request = request_with_user_id(
            "user_7fae31_account__session_0f0e0d0c-aaaa-bbbb-cccc-111122223333",
        );

        assert_eq!(
            from_messages_request(&request).as_deref(),
            Some("0f0e0d0c-aaaa-bbbb-cccc-111122223333")
        );
    }

    #[test]
    fn user_id_without_session_suffix_yields_none() {
        let request = request_with_user_id("user_7fae31_account");
        assert_eq!(from_messages_request(&request), None);
    }

    #[test]
    fn missing_metadata_yields_none() {
        let request: MessagesRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();

        assert_eq!(from_messages_request(&request), None);
    }
}
