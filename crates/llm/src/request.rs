use axum::http::HeaderMap;
use tokio_util::sync::CancellationToken;

/// Header naming the provider type that should serve a request.
const MODEL_PROVIDER_HEADER: &str = "model-provider";

/// Per-request inputs of a dispatch that do not come from the body.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Provider type whose wire format the caller speaks.
    pub caller: String,

    /// Provider type that should serve the request. Defaults to `caller`.
    pub provider: Option<String>,

    /// Overrides the body's own streaming flag, for formats that signal it in the URL.
    pub stream: Option<bool>,

    /// Cancelled when the caller goes away.
    pub cancel: CancellationToken,
}

impl DispatchContext {
    pub fn new(caller: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            provider: None,
            stream: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }

    /// The provider type the router starts from.
    pub fn serving_provider(&self) -> &str {
        self.provider.as_deref().unwrap_or(&self.caller)
    }
}

/// Build the dispatch context for an HTTP request.
///
/// The serving provider is, in order: the `/{provider}` path prefix, the
/// `model-provider` header, the configured default, the caller's own type.
pub(crate) fn extract_context(
    headers: &HeaderMap,
    caller: &str,
    path_provider: Option<String>,
    default_provider: Option<&str>,
) -> DispatchContext {
    let header_provider = headers
        .get(MODEL_PROVIDER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let provider = path_provider
        .or(header_provider)
        .or_else(|| default_provider.map(str::to_string));

    DispatchContext {
        provider,
        ..DispatchContext::new(caller)
    }
}
