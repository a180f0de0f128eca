use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use config::{CredentialDefinition, HealthConfig};
use jiff::Timestamp;
use secrecy::SecretString;
use serde::Serialize;
use serde_json::Value;
use url::Url;

/// One credential of a provider pool.
///
/// Identity and auth material are fixed for the lifetime of the pool generation;
/// only [`CredentialHealth`] changes, always under the credential's own lock.
#[derive(Debug)]
pub struct Credential {
    id: String,
    provider_type: String,
    priority: i32,
    api_key: Option<SecretString>,
    base_url: Option<Url>,
    extra: BTreeMap<String, Value>,
    /// Disabled in the pool file. Never selected, whatever its health.
    administratively_disabled: bool,
    health: Mutex<CredentialHealth>,
}

/// Mutable health fields of a credential.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialHealth {
    pub error_count: u32,
    pub disabled_until: Option<Timestamp>,
    /// Rejections of the credential itself, kept apart from `error_count`.
    pub auth_failures: u32,
    /// Set by an auth rejection, cleared when the external refresher reports a new token.
    pub needs_refresh: bool,
    pub usage_count: u64,
    pub last_used: Option<Timestamp>,
    pub last_error: Option<String>,
}

impl CredentialHealth {
    fn is_disabled_at(&self, now: Timestamp) -> bool {
        self.disabled_until.is_some_and(|until| until > now)
    }
}

/// Diagnostic view of one credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStatus {
    pub id: String,
    pub provider_type: String,
    pub priority: i32,
    pub is_disabled: bool,
    #[serde(flatten)]
    pub health: CredentialHealth,
}

impl Credential {
    pub(crate) fn new(provider_type: &str, id: String, definition: &CredentialDefinition) -> Self {
        Self {
            id,
            provider_type: provider_type.to_string(),
            priority: definition.priority,
            api_key: definition.api_key.clone(),
            base_url: definition.base_url.clone(),
            extra: definition.extra.clone(),
            administratively_disabled: definition.is_disabled,
            health: Mutex::new(CredentialHealth::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn provider_type(&self) -> &str {
        &self.provider_type
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn api_key(&self) -> Option<&SecretString> {
        self.api_key.as_ref()
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    /// Pool file fields the gateway does not interpret.
    pub fn extra(&self) -> &BTreeMap<String, Value> {
        &self.extra
    }

    pub fn health(&self) -> CredentialHealth {
        self.lock().clone()
    }

    pub fn status(&self) -> CredentialStatus {
        CredentialStatus {
            id: self.id.clone(),
            provider_type: self.provider_type.clone(),
            priority: self.priority,
            is_disabled: self.administratively_disabled,
            health: self.health(),
        }
    }

    pub(crate) fn is_selectable_at(&self, now: Timestamp) -> bool {
        !self.administratively_disabled && !self.lock().is_disabled_at(now)
    }

    pub(crate) fn is_configured_disabled(&self) -> bool {
        self.administratively_disabled
    }

    pub(crate) fn record_success(&self, now: Timestamp) {
        let mut health = self.lock();

        health.error_count = 0;
        health.usage_count = health.usage_count.saturating_add(1);
        health.last_used = Some(now);

        if !health.is_disabled_at(now) {
            health.disabled_until = None;
        }
    }

    /// Returns true when this failure disabled the credential.
    pub(crate) fn record_failure(&self, reason: &str, now: Timestamp, config: HealthConfig) -> bool {
        let mut health = self.lock();

        health.error_count = health.error_count.saturating_add(1);
        health.last_error = Some(reason.to_string());
        health.last_used = Some(now);

        if health.error_count < config.max_error_count {
            return false;
        }

        health.disabled_until = Some(add(now, config.cool_down));
        true
    }

    pub(crate) fn record_auth_failure(&self, reason: &str, now: Timestamp) {
        let mut health = self.lock();

        health.auth_failures = health.auth_failures.saturating_add(1);
        health.needs_refresh = true;
        health.last_error = Some(reason.to_string());
        health.last_used = Some(now);
    }

    pub(crate) fn reset(&self) {
        let mut health = self.lock();

        health.error_count = 0;
        health.disabled_until = None;
        health.auth_failures = 0;
        health.needs_refresh = false;
        health.last_error = None;
    }

    pub(crate) fn mark_refreshed(&self) {
        let mut health = self.lock();

        health.needs_refresh = false;
        health.auth_failures = 0;
    }

    fn lock(&self) -> MutexGuard<'_, CredentialHealth> {
        // Health is plain counters; a panicking holder cannot leave it inconsistent.
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn add(now: Timestamp, cool_down: Duration) -> Timestamp {
    now.checked_add(cool_down).unwrap_or(Timestamp::MAX)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use config::{CredentialDefinition, HealthConfig};
    use jiff::{SignedDuration, Timestamp};

    use super::Credential;

    fn credential() -> Credential {
        Credential::new("kiro", "k1".into(), &CredentialDefinition::default())
    }

    fn config() -> HealthConfig {
        HealthConfig {
            max_error_count: 2,
            cool_down: Duration::from_secs(60),
        }
    }

    #[test]
    fn disabled_for_cool_down_at_threshold() {
        let credential = credential();
        let now = Timestamp::UNIX_EPOCH;

        assert!(!credential.record_failure("503", now, config()));
        assert!(credential.record_failure("503", now, config()));

        let health = credential.health();
        assert_eq!(health.error_count, 2);
        assert_eq!(health.disabled_until, Some(now + SignedDuration::from_secs(60)));
        assert_eq!(health.last_error.as_deref(), Some("503"));

        assert!(!credential.is_selectable_at(now + SignedDuration::from_secs(59)));
        assert!(credential.is_selectable_at(now + SignedDuration::from_secs(60)));
    }

    #[test]
    fn success_resets_count() {
        let credential = credential();
        let now = Timestamp::UNIX_EPOCH;

        credential.record_failure("timeout", now, config());
        credential.record_success(now);

        let health = credential.health();
        assert_eq!(health.error_count, 0);
        assert_eq!(health.usage_count, 1);
    }

    #[test]
    fn auth_failures_are_counted_apart() {
        let credential = credential();
        let now = Timestamp::UNIX_EPOCH;

        credential.record_auth_failure("401", now);
        credential.record_auth_failure("401", now);

        let health = credential.health();
        assert_eq!(health.error_count, 0);
        assert_eq!(health.auth_failures, 2);
        assert!(health.needs_refresh);
        assert!(credential.is_selectable_at(now));

        credential.mark_refreshed();
        assert!(!credential.health().needs_refresh);
    }
}
