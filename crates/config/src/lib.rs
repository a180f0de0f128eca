//! Gateway configuration: server settings, routing knobs and credential pools.

mod error;
mod llm;
mod loader;
mod pools;
mod server;

use std::path::Path;

use serde::Deserialize;

pub use error::Error;
pub use llm::{HealthConfig, LlmConfig, RoutingConfig};
pub use pools::{CredentialDefinition, PoolDefinitions};
pub use server::{ServerConfig, TlsServerConfig};

pub type Result<T> = std::result::Result<T, error::Error>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Config> {
        loader::load(path)
    }

    /// Parse a configuration document, expanding `{{ env.NAME }}` placeholders.
    pub fn from_toml(content: &str) -> crate::Result<Config> {
        loader::parse(content)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use indoc::indoc;

    use crate::Config;

    #[test]
    fn all_values() {
        let config = indoc! {r#"
            [server]
            listen_address = "127.0.0.1:8080"

            [llm]
            default_provider = "gemini"
            max_error_count = 2
            request_max_retries = 5
            request_base_delay = 10
            request_max_delay = 100
            cool_down = 1000

            [llm.provider_fallback_chain]
            kiro = ["gemini"]

            [[llm.provider_pools.kiro]]
            id = "kiro-1"
            priority = 1
            accessToken = "token"
        "#};

        let config = Config::from_toml(config).unwrap();

        assert_eq!(config.server.listen_address, Some("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(config.llm.default_provider.as_deref(), Some("gemini"));
        assert_eq!(config.llm.health().max_error_count, 2);
        assert_eq!(config.llm.health().cool_down, Duration::from_secs(1));
        assert_eq!(config.llm.routing().max_delay, Duration::from_millis(100));

        let pools = config.llm.pool_definitions().unwrap();
        let (provider, credentials) = pools.iter().next().unwrap();

        assert_eq!(provider, "kiro");
        assert_eq!(credentials[0].id.as_deref(), Some("kiro-1"));
        assert_eq!(credentials[0].priority, 1);
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_toml("").unwrap();

        assert!(config.server.listen_address.is_none());
        assert!(config.llm.pool_definitions().unwrap().is_empty());
    }
}
