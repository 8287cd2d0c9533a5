//! Upstream LLM provider configuration.

use std::time::Duration;

use duration_str::deserialize_duration;
use secrecy::SecretString;
use serde::Deserialize;

fn default_upstream_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Configuration for the upstream LLM provider connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible upstream API.
    ///
    /// Defaults to the public OpenAI endpoint when unset.
    pub base_url: Option<String>,
    /// API key forwarded to the upstream provider.
    pub api_key: Option<SecretString>,
    /// Timeout for a single upstream call (connect + first byte).
    #[serde(deserialize_with = "deserialize_duration")]
    pub upstream_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            upstream_timeout: default_upstream_timeout(),
        }
    }
}
