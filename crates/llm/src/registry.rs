use std::{collections::HashMap, sync::Arc};

use crate::{
    converter::{ClaudeConverter, Converter, GeminiConverter, KiroConverter, OpenAiConverter, ResponsesConverter},
    error::{LlmError, LlmResult},
};

/// Provider type identifiers and the converter family each one speaks.
const PROVIDER_TYPES: &[(&str, Family)] = &[
    ("openai", Family::OpenAiChat),
    ("openai-custom", Family::OpenAiChat),
    ("openai-qwen-oauth", Family::OpenAiChat),
    ("openai-responses", Family::OpenAiResponses),
    ("openaiResponses-custom", Family::OpenAiResponses),
    ("gemini", Family::Gemini),
    ("gemini-cli-oauth", Family::Gemini),
    ("claude", Family::Claude),
    ("claude-custom", Family::Claude),
    ("kiro", Family::Kiro),
    ("claude-kiro-oauth", Family::Kiro),
];

#[derive(Clone, Copy)]
enum Family {
    OpenAiChat,
    OpenAiResponses,
    Gemini,
    Claude,
    Kiro,
}

/// Resolves provider type identifiers to converters. Fails closed.
#[derive(Clone)]
pub struct ConverterRegistry {
    converters: HashMap<String, Arc<dyn Converter>>,
}

impl ConverterRegistry {
    /// A registry knowing every built-in provider type.
    pub fn new() -> Self {
        let openai: Arc<dyn Converter> = Arc::new(OpenAiConverter);
        let responses: Arc<dyn Converter> = Arc::new(ResponsesConverter);
        let gemini: Arc<dyn Converter> = Arc::new(GeminiConverter);
        let claude: Arc<dyn Converter> = Arc::new(ClaudeConverter);
        let kiro: Arc<dyn Converter> = Arc::new(KiroConverter);

        let converters = PROVIDER_TYPES
            .iter()
            .map(|(name, family)| {
                let converter = match family {
                    Family::OpenAiChat => openai.clone(),
                    Family::OpenAiResponses => responses.clone(),
                    Family::Gemini => gemini.clone(),
                    Family::Claude => claude.clone(),
                    Family::Kiro => kiro.clone(),
                };

                (name.to_string(), converter)
            })
            .collect();

        Self { converters }
    }

    /// Register an additional provider type.
    pub fn register(&mut self, provider_type: impl Into<String>, converter: Arc<dyn Converter>) {
        self.converters.insert(provider_type.into(), converter);
    }

    pub fn get(&self, provider_type: &str) -> LlmResult<Arc<dyn Converter>> {
        self.converters
            .get(provider_type)
            .cloned()
            .ok_or_else(|| LlmError::UnknownProvider(provider_type.to_string()))
    }

    pub fn contains(&self, provider_type: &str) -> bool {
        self.converters.contains_key(provider_type)
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::Protocol;

    #[test]
    fn aliases_share_a_converter() {
        let registry = ConverterRegistry::new();

        assert_eq!(registry.get("openai-qwen-oauth").unwrap().protocol(), Protocol::OpenAiChat);
        assert_eq!(
            registry.get("openaiResponses-custom").unwrap().protocol(),
            Protocol::OpenAiResponses
        );
        assert_eq!(registry.get("gemini-cli-oauth").unwrap().protocol(), Protocol::Gemini);
        assert_eq!(registry.get("claude-custom").unwrap().protocol(), Protocol::Claude);
        assert_eq!(registry.get("claude-kiro-oauth").unwrap().protocol(), Protocol::Kiro);
    }

    #[test]
    fn unknown_provider_fails_closed() {
        let registry = ConverterRegistry::new();
        let error = registry.get("mistral").err().unwrap();

        assert!(matches!(error, LlmError::UnknownProvider(ref name) if name == "mistral"));
        assert_eq!(error.status_code(), axum::http::StatusCode::NOT_FOUND);
    }
}
