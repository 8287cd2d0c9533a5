//! HTTP server configuration settings.

use std::net::SocketAddr;

use secrecy::SecretString;
use serde::Deserialize;

/// Default cap on client request bodies (10 MiB).
const DEFAULT_MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

/// HTTP server configuration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// The socket address the server should listen on.
    pub listen_address: Option<SocketAddr>,
    /// API key clients must present (Bearer token or `x-api-key` header).
    ///
    /// When unset, client authentication is disabled. Useful for local
    /// development only.
    pub client_api_key: Option<SecretString>,
    /// Separate API key for the `/admin` surface.
    ///
    /// Admin endpoints reject every request when this is unset.
    pub admin_api_key: Option<SecretString>,
    /// Path for the liveness endpoint.
    pub health_path: String,
    /// Maximum accepted request body size in bytes.
    pub max_request_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            client_api_key: None,
            admin_api_key: None,
            health_path: "/health".to_string(),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}
