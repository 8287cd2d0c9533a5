use std::path::Path;

use anyhow::bail;
use indoc::indoc;

use crate::Config;

/// Error raised while opening or parsing warden.toml.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configuration file could not be read.
    #[error("Failed to open configuration file: {0}")]
    ConfigOpen(#[from] std::io::Error),
    /// The configuration file is not valid TOML.
    #[error("Failed to parse configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

pub(crate) fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(Error::ConfigOpen)?;
    let config: Config = toml::from_str(&content).map_err(Error::ConfigParse)?;

    validate(&config)?;

    Ok(config)
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    if config.server.client_api_key.is_none() {
        log::warn!("No client_api_key configured - client authentication is disabled");
    }

    if config.policy.egress_capacity == 0 {
        bail!(indoc! {r#"
            The egress queue capacity must be at least 1.

              [policy]
              egress_capacity = 64
        "#});
    }

    if config.policy.stall_timeout.is_zero() {
        bail!(indoc! {r#"
            The stall timeout must be non-zero. Streaming transactions are cancelled
            when no chunk arrives and no policy keepalive is signalled within this
            window.

              [policy]
              stall_timeout = "30s"
        "#});
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_egress_capacity() {
        let config: Config = toml::from_str("[policy]\negress_capacity = 0").unwrap();
        let error = validate(&config).unwrap_err();
        assert!(error.to_string().contains("egress queue capacity"));
    }

    #[test]
    fn rejects_zero_stall_timeout() {
        let config: Config = toml::from_str("[policy]\nstall_timeout = \"0s\"").unwrap();
        let error = validate(&config).unwrap_err();
        assert!(error.to_string().contains("stall timeout"));
    }

    #[test]
    fn accepts_defaults() {
        let config: Config = toml::from_str("").unwrap();
        validate(&config).unwrap();
    }
}
