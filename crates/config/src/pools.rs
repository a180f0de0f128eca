//! Credential pool definitions, as read from the provider pools file.

use std::{collections::BTreeMap, path::Path};

use indexmap::IndexMap;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, de::Error as _};
use serde_json::Value;
use url::Url;

use crate::error::Error;

/// `providerType -> credentials`, in file order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct PoolDefinitions {
    providers: IndexMap<String, Vec<CredentialDefinition>>,
}

impl PoolDefinitions {
    /// Read and parse a JSON pool definition file.
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path).map_err(|e| Error::PoolFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_json(&content).map_err(|e| match e {
            Error::Invalid(reason) => Error::PoolFile {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Parse pool definitions from a JSON document.
    pub fn from_json(content: &str) -> crate::Result<Self> {
        let definitions: Self = serde_json::from_str(content).map_err(|e| Error::Invalid(e.to_string()))?;

        for (provider_type, credentials) in &definitions.providers {
            if credentials.is_empty() {
                log::warn!("Provider pool '{provider_type}' has no credentials");
            }
        }

        Ok(definitions)
    }

    /// Add one credential under `provider_type`, keeping insertion order.
    pub fn push(&mut self, provider_type: impl Into<String>, credential: CredentialDefinition) {
        self.providers.entry(provider_type.into()).or_default().push(credential);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[CredentialDefinition])> {
        self.providers.iter().map(|(name, creds)| (name.as_str(), creds.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.providers.values().all(Vec::is_empty)
    }
}

/// One credential entry. Fields the gateway does not interpret are kept in `extra`.
#[derive(Debug, Clone, Default)]
pub struct CredentialDefinition {
    pub id: Option<String>,
    /// Lower values are selected first.
    pub priority: i32,
    pub api_key: Option<SecretString>,
    pub base_url: Option<Url>,
    pub is_disabled: bool,
    pub extra: BTreeMap<String, Value>,
}

const ID_KEYS: &[&str] = &["id", "uuid"];
const API_KEY_KEYS: &[&str] = &[
    "apiKey",
    "api_key",
    "accessToken",
    "OPENAI_API_KEY",
    "CLAUDE_API_KEY",
    "GEMINI_API_KEY",
];
const BASE_URL_KEYS: &[&str] = &["baseUrl", "base_url", "OPENAI_BASE_URL", "CLAUDE_BASE_URL", "GEMINI_BASE_URL"];
const DISABLED_KEYS: &[&str] = &["isDisabled", "is_disabled"];

impl<'de> Deserialize<'de> for CredentialDefinition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut fields = BTreeMap::<String, Value>::deserialize(deserializer)?;

        let id = take_string(&mut fields, ID_KEYS).map_err(D::Error::custom)?;
        let api_key = take_string(&mut fields, API_KEY_KEYS)
            .map_err(D::Error::custom)?
            .map(SecretString::from);

        let base_url = take_string(&mut fields, BASE_URL_KEYS)
            .map_err(D::Error::custom)?
            .map(|raw| Url::parse(&raw).map_err(|e| D::Error::custom(format!("invalid base url '{raw}': {e}"))))
            .transpose()?;

        let priority = match fields.remove("priority") {
            None | Some(Value::Null) => 0,
            Some(value) => value
                .as_i64()
                .and_then(|p| i32::try_from(p).ok())
                .ok_or_else(|| D::Error::custom("priority must be an integer"))?,
        };

        let mut is_disabled = false;
        for key in DISABLED_KEYS {
            if let Some(value) = fields.remove(*key) {
                is_disabled = value
                    .as_bool()
                    .ok_or_else(|| D::Error::custom(format!("{key} must be a boolean")))?;
            }
        }

        Ok(Self {
            id,
            priority,
            api_key,
            base_url,
            is_disabled,
            extra: fields,
        })
    }
}

/// Removes every alias in `keys`, returning the first one present.
fn take_string(fields: &mut BTreeMap<String, Value>, keys: &[&str]) -> Result<Option<String>, String> {
    let mut found = None;

    for key in keys {
        match fields.remove(*key) {
            Some(Value::String(value)) if found.is_none() => found = Some(value),
            Some(Value::String(_)) | Some(Value::Null) | None => (),
            Some(_) => return Err(format!("{key} must be a string")),
        }
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use indoc::indoc;
    use secrecy::ExposeSecret;

    use super::PoolDefinitions;

    #[test]
    fn parses_original_pool_file_shape() {
        let json = indoc! {r#"
            {
              "openai-custom": [
                { "uuid": "a1", "OPENAI_API_KEY": "sk-1", "OPENAI_BASE_URL": "https://api.openai.com/v1", "checkModelName": "gpt-4o" },
                { "uuid": "a2", "apiKey": "sk-2", "priority": 2, "isDisabled": true }
              ],
              "gemini": []
            }
        "#};

        let pools = PoolDefinitions::from_json(json).unwrap();
        let (name, credentials) = pools.iter().next().unwrap();

        assert_eq!(name, "openai-custom");
        assert_eq!(credentials.len(), 2);
        assert_eq!(credentials[0].id.as_deref(), Some("a1"));
        assert_eq!(credentials[0].api_key.as_ref().unwrap().expose_secret(), "sk-1");
        assert_eq!(credentials[0].base_url.as_ref().unwrap().as_str(), "https://api.openai.com/v1");
        assert_eq!(credentials[0].extra["checkModelName"], "gpt-4o");
        assert_eq!(credentials[1].priority, 2);
        assert!(credentials[1].is_disabled);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"kiro": [{{"id": "k1", "accessToken": "t"}}]}}"#).unwrap();

        let pools = PoolDefinitions::load(file.path()).unwrap();
        let names: Vec<_> = pools.iter().map(|(name, _)| name).collect();

        insta::assert_debug_snapshot!(names, @r#"
        [
            "kiro",
        ]
        "#);
    }

    #[test]
    fn missing_file_reports_path() {
        let error = PoolDefinitions::load("/definitely/not/here.json").unwrap_err();
        assert!(error.to_string().contains("/definitely/not/here.json"));
    }
}
