//! Routing, fallback and credential pool configuration for the LLM core.

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Deserializer};

use crate::pools::PoolDefinitions;

/// LLM configuration: where credentials come from and how a dispatch falls back.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    /// Path to the JSON file enumerating credentials per provider type.
    #[serde(alias = "PROVIDER_POOLS_FILE_PATH")]
    pub provider_pools_file_path: Option<PathBuf>,

    /// Credentials defined inline. Ignored when `provider_pools_file_path` is set.
    pub provider_pools: PoolDefinitions,

    /// Provider type serving requests when the caller does not name one.
    #[serde(alias = "MODEL_PROVIDER")]
    pub default_provider: Option<String>,

    /// `providerType -> ordered alternate provider types`.
    #[serde(alias = "providerFallbackChain")]
    pub provider_fallback_chain: BTreeMap<String, Vec<String>>,

    /// `modelName -> ordered alternate model names`.
    #[serde(alias = "modelFallbackMapping")]
    pub model_fallback_mapping: BTreeMap<String, Vec<String>>,

    /// Retryable failures tolerated before a credential is disabled.
    #[serde(alias = "MAX_ERROR_COUNT")]
    pub max_error_count: u32,

    /// Cap on upstream attempts within one dispatch.
    #[serde(alias = "REQUEST_MAX_RETRIES")]
    pub request_max_retries: u32,

    /// Base of the exponential backoff between attempts, in milliseconds.
    #[serde(alias = "REQUEST_BASE_DELAY", deserialize_with = "millis")]
    pub request_base_delay: Duration,

    /// Upper bound for a single backoff wait, in milliseconds.
    #[serde(alias = "REQUEST_MAX_DELAY", deserialize_with = "millis")]
    pub request_max_delay: Duration,

    /// How long a disabled credential stays out of rotation, in milliseconds.
    #[serde(alias = "COOL_DOWN", deserialize_with = "millis")]
    pub cool_down: Duration,

    /// Request-scoped deadline covering every attempt of a dispatch, in milliseconds.
    #[serde(alias = "REQUEST_TIMEOUT", deserialize_with = "optional_millis")]
    pub request_timeout: Option<Duration>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider_pools_file_path: None,
            provider_pools: PoolDefinitions::default(),
            default_provider: None,
            provider_fallback_chain: BTreeMap::new(),
            model_fallback_mapping: BTreeMap::new(),
            max_error_count: 3,
            request_max_retries: 3,
            request_base_delay: Duration::from_millis(1000),
            request_max_delay: Duration::from_millis(30_000),
            cool_down: Duration::from_millis(60_000),
            request_timeout: Some(Duration::from_millis(300_000)),
        }
    }
}

impl LlmConfig {
    /// Resolve the credential definitions, reading the pool file when one is configured.
    pub fn pool_definitions(&self) -> crate::Result<PoolDefinitions> {
        match self.provider_pools_file_path {
            Some(ref path) => PoolDefinitions::load(path),
            None => Ok(self.provider_pools.clone()),
        }
    }

    /// Snapshot of the knobs the fallback router reads once per dispatch.
    pub fn routing(&self) -> RoutingConfig {
        RoutingConfig {
            default_provider: self.default_provider.clone(),
            provider_fallback_chain: self.provider_fallback_chain.clone(),
            model_fallback_mapping: self.model_fallback_mapping.clone(),
            max_attempts: self.request_max_retries.max(1),
            base_delay: self.request_base_delay,
            max_delay: self.request_max_delay,
            request_timeout: self.request_timeout,
        }
    }

    /// Health thresholds applied by the provider pool.
    pub fn health(&self) -> HealthConfig {
        HealthConfig {
            max_error_count: self.max_error_count.max(1),
            cool_down: self.cool_down,
        }
    }
}

/// Immutable routing settings, shared by every attempt of one dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingConfig {
    pub default_provider: Option<String>,
    pub provider_fallback_chain: BTreeMap<String, Vec<String>>,
    pub model_fallback_mapping: BTreeMap<String, Vec<String>>,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub request_timeout: Option<Duration>,
}

/// Thresholds for disabling a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    pub max_error_count: u32,
    pub cool_down: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        LlmConfig::default().health()
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn optional_millis<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    // Zero disables the deadline.
    let value = Option::<u64>::deserialize(deserializer)?;
    Ok(value.filter(|ms| *ms > 0).map(Duration::from_millis))
}
