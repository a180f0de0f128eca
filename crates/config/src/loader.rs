use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use toml::Value;

use crate::{Config, error::Error};

pub(crate) fn load<P: AsRef<Path>>(path: P) -> crate::Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let config = parse(&content)?;

    if let Some(ref pools_path) = config.llm.provider_pools_file_path
        && !config.llm.provider_pools.is_empty()
    {
        log::warn!(
            "Both provider_pools_file_path ({}) and inline provider_pools are set; the file wins",
            pools_path.display()
        );
    }

    Ok(config)
}

pub(crate) fn parse(content: &str) -> crate::Result<Config> {
    let mut raw_config: Value = toml::from_str(content)?;

    let placeholder =
        Regex::new(r"\{\{\s*env\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").map_err(|e| Error::Invalid(e.to_string()))?;

    expand_env_vars(&placeholder, &mut Vec::new(), &mut raw_config)?;

    let config = Config::deserialize(raw_config)?;
    validate(&config)?;

    Ok(config)
}

fn validate(config: &Config) -> crate::Result<()> {
    let llm = &config.llm;

    for (provider, chain) in &llm.provider_fallback_chain {
        if chain.iter().any(|fallback| fallback == provider) {
            return Err(Error::Invalid(format!(
                "provider_fallback_chain for '{provider}' lists itself as a fallback"
            )));
        }
    }

    if llm.request_base_delay > llm.request_max_delay {
        return Err(Error::Invalid(
            "request_base_delay must not exceed request_max_delay".to_string(),
        ));
    }

    Ok(())
}

fn expand_env_vars<'a>(
    placeholder: &Regex,
    path: &mut Vec<Result<&'a str, usize>>,
    value: &'a mut Value,
) -> crate::Result<()> {
    match value {
        Value::String(s) => {
            if !placeholder.is_match(s) {
                return Ok(());
            }

            let mut missing = None;

            let expanded = placeholder.replace_all(s, |caps: &regex::Captures<'_>| {
                std::env::var(&caps[1]).unwrap_or_else(|_| {
                    missing.get_or_insert_with(|| caps[1].to_string());
                    String::new()
                })
            });

            if let Some(name) = missing {
                return Err(Error::EnvVarSubstitution {
                    path: render_path(path),
                    reason: format!("environment variable {name} is not set"),
                });
            }

            *s = expanded.into_owned();
        }
        Value::Array(values) => {
            for (i, value) in values.iter_mut().enumerate() {
                path.push(Err(i));
                expand_env_vars(placeholder, path, value)?;
                path.pop();
            }
        }
        Value::Table(map) => {
            for (key, value) in map {
                path.push(Ok(key.as_str()));
                expand_env_vars(placeholder, path, value)?;
                path.pop();
            }
        }
        Value::Integer(_) | Value::Float(_) | Value::Boolean(_) | Value::Datetime(_) => (),
    }

    Ok(())
}

fn render_path(path: &[Result<&str, usize>]) -> String {
    let mut rendered = String::new();

    for segment in path {
        match segment {
            Ok(s) => {
                if !rendered.is_empty() {
                    rendered.push('.');
                }
                rendered.push_str(s);
            }
            Err(i) => rendered.push_str(&format!("[{i}]")),
        }
    }

    rendered
}
