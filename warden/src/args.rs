use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Warden, a policy-enforcing LLM gateway.
#[derive(Debug, Parser)]
#[command(name = "warden", version)]
pub(crate) struct Args {
    /// Path to the warden.toml configuration file.
    #[arg(short, long, env = "WARDEN_CONFIG", default_value = "warden.toml")]
    pub(crate) config: PathBuf,

    /// Listen address, overriding the configuration file.
    #[arg(short, long, env = "WARDEN_LISTEN_ADDRESS")]
    pub(crate) listen_address: Option<SocketAddr>,

    /// Log filter, e.g. "info" or "server=debug,policy=debug".
    #[arg(long, env = "WARDEN_LOG", default_value = "info")]
    pub(crate) log_filter: String,
}

impl Args {
    pub(crate) fn listen_address(&self, config: &config::Config) -> SocketAddr {
        self.listen_address
            .or(config.server.listen_address)
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 4100)))
    }
}
