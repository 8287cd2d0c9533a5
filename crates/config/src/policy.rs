//! Policy engine configuration, including the YAML policy document.

use std::{collections::BTreeMap, path::Path, time::Duration};

use duration_str::deserialize_duration;
use serde::Deserialize;

fn default_stall_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_egress_put_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_stream_store_ttl() -> Duration {
    Duration::from_secs(3600)
}

/// Policy engine settings from warden.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Path to the YAML policy document loaded at startup.
    ///
    /// When unset, the no-op policy is active until an admin activates
    /// another one.
    pub config_file: Option<String>,
    /// Maximum time a streaming transaction may go without progress or a
    /// policy keepalive before it is cancelled.
    #[serde(deserialize_with = "deserialize_duration")]
    pub stall_timeout: Duration,
    /// Maximum time a policy may block on an egress write before the
    /// transaction is treated as abandoned by the client.
    #[serde(deserialize_with = "deserialize_duration")]
    pub egress_put_timeout: Duration,
    /// Capacity of the per-transaction egress queue.
    pub egress_capacity: usize,
    /// Per-call streaming context store settings.
    pub stream_store: StreamStoreConfig,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            config_file: None,
            stall_timeout: default_stall_timeout(),
            egress_put_timeout: default_egress_put_timeout(),
            egress_capacity: 64,
            stream_store: StreamStoreConfig::default(),
        }
    }
}

/// Settings for the per-call streaming context store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamStoreConfig {
    /// Redis connection URL. When unset, an in-process store is used.
    pub redis_url: Option<String>,
    /// Time-to-live for per-call keys, refreshed on every write.
    #[serde(deserialize_with = "deserialize_duration")]
    pub ttl: Duration,
}

impl Default for StreamStoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            ttl: default_stream_store_ttl(),
        }
    }
}

/// Error raised while reading or parsing a policy document.
#[derive(Debug, thiserror::Error)]
pub enum PolicySpecError {
    /// The document could not be read from disk.
    #[error("failed to read policy document: {0}")]
    Read(#[from] std::io::Error),
    /// The document is not valid YAML or misses required fields.
    #[error("failed to parse policy document: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// The YAML policy document:
///
/// ```yaml
/// policy:
///   class: "warden.policies:ToolFilterPolicy"
///   config:
///     blocked_tools: ["delete_file"]
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PolicySpec {
    /// The policy declaration.
    pub policy: PolicyDecl,
}

/// A single policy declaration: class reference plus constructor kwargs.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PolicyDecl {
    /// Class reference of the form `module.path:ClassName`.
    pub class: String,
    /// Constructor keyword arguments, passed to the policy factory verbatim.
    #[serde(default)]
    pub config: BTreeMap<String, serde_yaml::Value>,
}

impl PolicySpec {
    /// Load a policy document from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PolicySpecError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a policy document from a YAML string.
    pub fn parse(content: &str) -> Result<Self, PolicySpecError> {
        Ok(serde_yaml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn parses_minimal_document() {
        let spec = PolicySpec::parse(indoc! {r#"
            policy:
              class: "warden.policies:NoOpPolicy"
        "#})
        .unwrap();

        assert_eq!(spec.policy.class, "warden.policies:NoOpPolicy");
        assert!(spec.policy.config.is_empty());
    }

    #[test]
    fn parses_constructor_kwargs() {
        let spec = PolicySpec::parse(indoc! {r#"
            policy:
              class: "warden.policies:ToolFilterPolicy"
              config:
                blocked_tools:
                  - delete_file
                  - execute_code
        "#})
        .unwrap();

        let tools = spec.policy.config.get("blocked_tools").unwrap();
        let tools: Vec<String> = serde_yaml::from_value(tools.clone()).unwrap();
        assert_eq!(tools, ["delete_file", "execute_code"]);
    }

    #[test]
    fn unknown_top_level_keys_rejected() {
        let error = PolicySpec::parse(indoc! {r#"
            policy:
              class: "warden.policies:NoOpPolicy"
            policies: []
        "#})
        .unwrap_err();

        assert!(matches!(error, PolicySpecError::Parse(_)));
    }
}
