use config::RoutingConfig;
use indexmap::IndexSet;

/// A `(provider type, model name)` pair the router may try.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub provider_type: String,
    pub model: String,
}

impl Candidate {
    pub fn new(provider_type: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider_type: provider_type.into(),
            model: model.into(),
        }
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider_type, self.model)
    }
}

/// Ordered candidates for one dispatch.
///
/// Every provider of `[provider] + fallback_chain[provider]` is paired with every
/// model of `[model] + model_fallback_mapping[model]`, providers outermost.
/// Chains are not followed transitively and duplicates keep their first position.
pub fn candidates(routing: &RoutingConfig, provider_type: &str, model: &str) -> IndexSet<Candidate> {
    let fallback_providers = routing.provider_fallback_chain.get(provider_type).into_iter().flatten();
    let fallback_models = routing.model_fallback_mapping.get(model).into_iter().flatten();

    let providers: IndexSet<&str> = std::iter::once(provider_type)
        .chain(fallback_providers.map(String::as_str))
        .collect();

    let models: IndexSet<&str> = std::iter::once(model)
        .chain(fallback_models.map(String::as_str))
        .collect();

    providers
        .iter()
        .flat_map(|provider| models.iter().map(move |model| Candidate::new(*provider, *model)))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use config::RoutingConfig;

    use super::candidates;

    fn routing(chain: &[(&str, &[&str])], mapping: &[(&str, &[&str])]) -> RoutingConfig {
        let collect = |entries: &[(&str, &[&str])]| -> BTreeMap<String, Vec<String>> {
            entries
                .iter()
                .map(|(key, values)| (key.to_string(), values.iter().map(|v| v.to_string()).collect()))
                .collect()
        };

        RoutingConfig {
            provider_fallback_chain: collect(chain),
            model_fallback_mapping: collect(mapping),
            ..Default::default()
        }
    }

    fn rendered(routing: &RoutingConfig, provider: &str, model: &str) -> Vec<String> {
        candidates(routing, provider, model).iter().map(ToString::to_string).collect()
    }

    #[test]
    fn providers_outermost_models_innermost() {
        let routing = routing(&[("kiro", &["gemini"])], &[("gpt-4", &["gpt-4-fallback"])]);

        insta::assert_debug_snapshot!(rendered(&routing, "kiro", "gpt-4"), @r#"
        [
            "kiro/gpt-4",
            "kiro/gpt-4-fallback",
            "gemini/gpt-4",
            "gemini/gpt-4-fallback",
        ]
        "#);
    }

    #[test]
    fn no_fallbacks_yields_the_request_only() {
        let routing = routing(&[], &[]);
        assert_eq!(rendered(&routing, "claude", "sonnet"), vec!["claude/sonnet"]);
    }

    #[test]
    fn duplicates_and_self_references_collapse() {
        let routing = routing(
            &[("kiro", &["gemini", "kiro", "gemini"])],
            &[("gpt-4", &["gpt-4", "gpt-4o"])],
        );

        assert_eq!(
            rendered(&routing, "kiro", "gpt-4"),
            vec!["kiro/gpt-4", "kiro/gpt-4o", "gemini/gpt-4", "gemini/gpt-4o"]
        );
    }

    #[test]
    fn chains_are_not_transitive() {
        let routing = routing(&[("kiro", &["gemini"]), ("gemini", &["openai"])], &[]);
        assert_eq!(rendered(&routing, "kiro", "m"), vec!["kiro/m", "gemini/m"]);
    }
}
