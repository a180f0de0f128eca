//! Credential pools with per-credential health tracking.
//!
//! A [`ProviderPool`] holds the current [`PoolGeneration`]. A reload swaps in
//! a new generation atomically; a dispatch keeps the `Arc` of the generation
//! it started with, so health updates made during that dispatch land on the
//! credentials it actually used.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use config::{HealthConfig, PoolDefinitions};
use indexmap::IndexMap;
use jiff::Timestamp;

mod credential;

pub use credential::{Credential, CredentialHealth, CredentialStatus};

/// Why [`PoolGeneration::select`] found nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Unavailable {
    /// The provider type has no credentials at all.
    #[strum(to_string = "no credentials configured")]
    NotConfigured,
    /// Every credential is disabled or already tried by this dispatch.
    #[strum(to_string = "all credentials disabled or excluded")]
    Exhausted,
}

pub struct ProviderPool {
    current: RwLock<Arc<PoolGeneration>>,
    generations: AtomicU64,
    health: HealthConfig,
}

impl ProviderPool {
    pub fn new(definitions: &PoolDefinitions, health: HealthConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(PoolGeneration::build(0, definitions, health))),
            generations: AtomicU64::new(0),
            health,
        }
    }

    /// The generation new dispatches should use.
    pub fn generation(&self) -> Arc<PoolGeneration> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace every credential with a new generation built from `definitions`.
    pub fn reload(&self, definitions: &PoolDefinitions) -> u64 {
        let number = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = Arc::new(PoolGeneration::build(number, definitions, self.health));

        log::info!(
            "Reloaded provider pools (generation {number}, {} credentials)",
            generation.by_id.len()
        );

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = generation;

        number
    }

    pub fn select(&self, provider_type: &str, exclude: &HashSet<String>) -> Result<Arc<Credential>, Unavailable> {
        self.generation().select(provider_type, exclude)
    }

    pub fn record_success(&self, credential_id: &str) {
        self.generation().record_success(credential_id);
    }

    pub fn record_failure(&self, credential_id: &str, retryable: bool, reason: &str) {
        self.generation().record_failure(credential_id, retryable, reason);
    }

    pub fn record_auth_failure(&self, credential_id: &str, reason: &str) {
        self.generation().record_auth_failure(credential_id, reason);
    }

    /// Clear every health field of a credential, re-enabling it immediately.
    pub fn reset_health(&self, credential_id: &str) -> bool {
        self.generation().with_credential(credential_id, Credential::reset)
    }

    /// Called by the external refresher once a new token is in place.
    ///
    /// Clears the refresh flag only; the error count is reset by the next success.
    pub fn mark_refreshed(&self, credential_id: &str) -> bool {
        self.generation().with_credential(credential_id, Credential::mark_refreshed)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.generation().snapshot()
    }
}

/// One immutable set of credentials, as loaded from configuration.
pub struct PoolGeneration {
    number: u64,
    /// Per provider type, sorted by priority then file order.
    providers: IndexMap<String, Vec<Arc<Credential>>>,
    by_id: HashMap<String, Arc<Credential>>,
    health: HealthConfig,
}

impl PoolGeneration {
    fn build(number: u64, definitions: &PoolDefinitions, health: HealthConfig) -> Self {
        let mut providers = IndexMap::new();
        let mut by_id = HashMap::new();

        for (provider_type, entries) in definitions.iter() {
            let mut credentials = Vec::with_capacity(entries.len());

            for definition in entries {
                let id = match definition.id.clone() {
                    Some(id) if !by_id.contains_key(&id) => id,
                    Some(id) => {
                        let fresh = uuid::Uuid::new_v4().to_string();
                        log::warn!("Duplicate credential id '{id}' in pool '{provider_type}', using '{fresh}'");
                        fresh
                    }
                    None => uuid::Uuid::new_v4().to_string(),
                };

                let credential = Arc::new(Credential::new(provider_type, id.clone(), definition));
                by_id.insert(id, credential.clone());
                credentials.push(credential);
            }

            // Stable: ties keep file order.
            credentials.sort_by_key(|credential| credential.priority());
            providers.insert(provider_type.to_string(), credentials);
        }

        Self {
            number,
            providers,
            by_id,
            health,
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// The first selectable credential of `provider_type` not in `exclude`.
    pub fn select(&self, provider_type: &str, exclude: &HashSet<String>) -> Result<Arc<Credential>, Unavailable> {
        self.select_at(provider_type, exclude, Timestamp::now())
    }

    pub(crate) fn select_at(
        &self,
        provider_type: &str,
        exclude: &HashSet<String>,
        now: Timestamp,
    ) -> Result<Arc<Credential>, Unavailable> {
        let credentials = match self.providers.get(provider_type) {
            Some(credentials) if !credentials.is_empty() => credentials,
            _ => return Err(Unavailable::NotConfigured),
        };

        credentials
            .iter()
            .filter(|credential| !exclude.contains(credential.id()))
            .find(|credential| credential.is_selectable_at(now))
            .cloned()
            .ok_or(Unavailable::Exhausted)
    }

    pub fn credential(&self, credential_id: &str) -> Option<&Arc<Credential>> {
        self.by_id.get(credential_id)
    }

    pub fn record_success(&self, credential_id: &str) {
        self.with_credential(credential_id, |credential| credential.record_success(Timestamp::now()));
    }

    /// Count a failure against the credential. Non-retryable failures are not the credential's fault.
    pub fn record_failure(&self, credential_id: &str, retryable: bool, reason: &str) {
        if !retryable {
            return;
        }

        let health = self.health;

        self.with_credential(credential_id, |credential| {
            if credential.record_failure(reason, Timestamp::now(), health) {
                log::warn!(
                    "Credential '{credential_id}' of '{}' disabled for {}ms after {} errors",
                    credential.provider_type(),
                    health.cool_down.as_millis(),
                    credential.health().error_count,
                );
            }
        });
    }

    pub fn record_auth_failure(&self, credential_id: &str, reason: &str) {
        self.with_credential(credential_id, |credential| {
            credential.record_auth_failure(reason, Timestamp::now());
            log::warn!(
                "Credential '{credential_id}' of '{}' was rejected and needs a refresh",
                credential.provider_type()
            );
        });
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            generation: self.number,
            credentials: self.providers.values().flatten().map(|credential| credential.status()).collect(),
        }
    }

    /// Counts of (total, configured-disabled) credentials for a provider type.
    pub(crate) fn census(&self, provider_type: &str) -> (usize, usize) {
        let credentials = self.providers.get(provider_type).map(Vec::as_slice).unwrap_or_default();
        let disabled = credentials.iter().filter(|c| c.is_configured_disabled()).count();

        (credentials.len(), disabled)
    }

    fn with_credential(&self, credential_id: &str, f: impl FnOnce(&Credential)) -> bool {
        match self.by_id.get(credential_id) {
            Some(credential) => {
                f(credential);
                true
            }
            None => {
                log::debug!("Credential '{credential_id}' is not part of pool generation {}", self.number);
                false
            }
        }
    }
}

/// Health report of every credential of one generation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolSnapshot {
    pub generation: u64,
    pub credentials: Vec<CredentialStatus>,
}
