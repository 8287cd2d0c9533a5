//! Warden configuration structures to map the warden.toml configuration.

#![deny(missing_docs)]

mod events;
mod llm;
mod loader;
mod policy;
mod server;

use std::path::Path;

pub use events::EventsConfig;
pub use llm::LlmConfig;
pub use loader::Error as LoadError;
pub use policy::{PolicyConfig, PolicyDecl, PolicySpec, PolicySpecError, StreamStoreConfig};
pub use server::ServerConfig;
use serde::Deserialize;

/// Main configuration structure for the Warden application.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    pub server: ServerConfig,
    /// Upstream LLM provider configuration settings.
    pub llm: LlmConfig,
    /// Policy engine configuration settings.
    pub policy: PolicyConfig,
    /// Event emission configuration settings.
    pub events: EventsConfig,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates that the configuration can serve requests.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;

    use crate::Config;

    #[test]
    fn defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_debug_snapshot!(&config, @r#"
        Config {
            server: ServerConfig {
                listen_address: None,
                client_api_key: None,
                admin_api_key: None,
                health_path: "/health",
                max_request_bytes: 10485760,
            },
            llm: LlmConfig {
                base_url: None,
                api_key: None,
                upstream_timeout: 60s,
            },
            policy: PolicyConfig {
                config_file: None,
                stall_timeout: 30s,
                egress_put_timeout: 30s,
                egress_capacity: 64,
                stream_store: StreamStoreConfig {
                    redis_url: None,
                    ttl: 3600s,
                },
            },
            events: EventsConfig {
                queue_capacity: 1024,
                log_payloads: false,
            },
        }
        "#);
    }

    #[test]
    fn custom_listen_and_timeouts() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen_address = "0.0.0.0:4100"
            client_api_key = "secret"

            [policy]
            stall_timeout = "5s"
            egress_capacity = 16
            "#,
        )
        .unwrap();

        assert_eq!(
            config.server.listen_address,
            Some("0.0.0.0:4100".parse().unwrap())
        );
        assert_eq!(config.policy.stall_timeout.as_secs(), 5);
        assert_eq!(config.policy.egress_capacity, 16);
        assert!(config.server.client_api_key.is_some());
    }

    #[test]
    fn unknown_fields_rejected() {
        let error = toml::from_str::<Config>("[server]\nlisten_addres = \"0.0.0.0:1\"").unwrap_err();
        assert!(error.to_string().contains("unknown field"));
    }
}
