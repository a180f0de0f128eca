use std::{convert::Infallible, sync::Arc};

use axum::{
    Router,
    extract::{Json, Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::{get, post},
};
use axum_serde::Sonic;
use futures::StreamExt;
use serde_json::Value;

mod converter;
mod dispatcher;
mod error;
mod http_client;
mod messages;
mod pool;
mod registry;
mod request;
mod router;
mod transport;

pub use converter::{Converter, Protocol, StreamState};
pub use dispatcher::{Dispatcher, NativeReply, NativeStream};
pub use error::{AttemptRecord, CancelReason, ConversionError, FailureClass, LlmError, LlmResult as Result};
pub use messages::unified;
pub use pool::{Credential, CredentialHealth, CredentialStatus, PoolGeneration, PoolSnapshot, ProviderPool, Unavailable};
pub use registry::ConverterRegistry;
pub use request::DispatchContext;
pub use router::{Candidate, ChunkStream, Dispatched, FallbackRouter, backoff_delay, candidates};
pub use transport::{HttpTransport, Transport, UpstreamCall, UpstreamFailure, UpstreamReply, UpstreamStream};

/// Creates an axum router for LLM endpoints, calling providers over HTTP.
pub async fn router(config: &config::Config) -> anyhow::Result<Router> {
    let transport = HttpTransport::new().map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;
    router_with_transport(config, Arc::new(transport))
}

/// Creates the LLM router on top of a custom transport.
pub fn router_with_transport(config: &config::Config, transport: Arc<dyn Transport>) -> anyhow::Result<Router> {
    let dispatcher = Dispatcher::from_config(&config.llm, transport)
        .map_err(|e| anyhow::anyhow!("Failed to initialize LLM dispatcher: {e}"))?;

    Ok(routes(Arc::new(dispatcher)))
}

/// Mounts every caller format, plain and under a `/{provider}` prefix forcing the serving provider.
pub fn routes(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/responses", post(responses))
        .route("/v1/messages", post(messages))
        .route("/v1beta/models/{model_action}", post(generate_content))
        .route("/{provider}/v1/chat/completions", post(chat_completions_via))
        .route("/{provider}/v1/responses", post(responses_via))
        .route("/{provider}/v1/messages", post(messages_via))
        .route("/{provider}/v1beta/models/{model_action}", post(generate_content_via))
        .with_state(dispatcher)
}

type Gateway = State<Arc<Dispatcher>>;

/// Pool health report.
async fn health(State(dispatcher): Gateway) -> Json<PoolSnapshot> {
    Json(dispatcher.pool().snapshot())
}

/// OpenAI Chat Completions.
async fn chat_completions(State(dispatcher): Gateway, headers: HeaderMap, Sonic(body): Sonic<Value>) -> Response {
    serve(&dispatcher, "openai", None, &headers, body, None).await
}

async fn chat_completions_via(
    State(dispatcher): Gateway,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Sonic(body): Sonic<Value>,
) -> Response {
    serve(&dispatcher, "openai", Some(provider), &headers, body, None).await
}

/// OpenAI Responses.
async fn responses(State(dispatcher): Gateway, headers: HeaderMap, Sonic(body): Sonic<Value>) -> Response {
    serve(&dispatcher, "openai-responses", None, &headers, body, None).await
}

async fn responses_via(
    State(dispatcher): Gateway,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Sonic(body): Sonic<Value>,
) -> Response {
    serve(&dispatcher, "openai-responses", Some(provider), &headers, body, None).await
}

/// Anthropic Messages.
async fn messages(State(dispatcher): Gateway, headers: HeaderMap, Sonic(body): Sonic<Value>) -> Response {
    serve(&dispatcher, "claude", None, &headers, body, None).await
}

async fn messages_via(
    State(dispatcher): Gateway,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Sonic(body): Sonic<Value>,
) -> Response {
    serve(&dispatcher, "claude", Some(provider), &headers, body, None).await
}

/// Gemini `models/{model}:generateContent` and `:streamGenerateContent`.
async fn generate_content(
    State(dispatcher): Gateway,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Sonic(body): Sonic<Value>,
) -> Response {
    gemini(&dispatcher, None, &model_action, &headers, body).await
}

async fn generate_content_via(
    State(dispatcher): Gateway,
    Path((provider, model_action)): Path<(String, String)>,
    headers: HeaderMap,
    Sonic(body): Sonic<Value>,
) -> Response {
    gemini(&dispatcher, Some(provider), &model_action, &headers, body).await
}

async fn gemini(
    dispatcher: &Dispatcher,
    provider: Option<String>,
    model_action: &str,
    headers: &HeaderMap,
    mut body: Value,
) -> Response {
    let (model, stream) = match model_action.rsplit_once(':') {
        Some((model, "generateContent")) => (model, false),
        Some((model, "streamGenerateContent")) => (model, true),
        _ => {
            let error = LlmError::Conversion(ConversionError::new(format!(
                "unsupported Gemini method '{model_action}'"
            )));

            return error_response(dispatcher, "gemini", &error);
        }
    };

    // The Gemini body carries no model; the decoder reads it from here.
    if let Value::Object(ref mut object) = body {
        object.insert("model".to_string(), Value::String(model.to_string()));
    }

    serve(dispatcher, "gemini", provider, headers, body, Some(stream)).await
}

async fn serve(
    dispatcher: &Dispatcher,
    caller: &str,
    provider: Option<String>,
    headers: &HeaderMap,
    body: Value,
    stream: Option<bool>,
) -> Response {
    let default_provider = dispatcher.default_provider();

    let mut context = request::extract_context(headers, caller, provider, default_provider.as_deref());
    context.stream = stream;

    // Cancels the dispatch, and any stream it returned, once the response is dropped.
    let cancel_on_drop = context.cancel.clone().drop_guard();

    match dispatcher.handle(body, &context).await {
        Ok(NativeReply::Complete(body)) => {
            log::debug!("{caller} request completed");
            Json(body).into_response()
        }
        Ok(NativeReply::Stream(events)) => {
            let Ok(converter) = dispatcher.converter(caller) else {
                return error_response(dispatcher, caller, &LlmError::Internal(None));
            };

            sse(converter, events, cancel_on_drop)
        }
        Err(error) => {
            log::debug!("{caller} request failed: {error}");
            error_response(dispatcher, caller, &error)
        }
    }
}

fn sse(
    converter: Arc<dyn Converter>,
    events: NativeStream,
    cancel_on_drop: tokio_util::sync::DropGuard,
) -> Response {
    let terminator = converter.stream_terminator();

    let event_stream = events.map(move |event| {
        // The stream owns the guard; dropping the response cancels the dispatch.
        let _guard = &cancel_on_drop;

        let json = sonic_rs::to_string(&event).unwrap_or_else(|e| {
            log::error!("Failed to serialize stream event: {e}");
            r#"{"error":"serialization failed"}"#.to_string()
        });

        let sse_event = match converter.event_name(&event) {
            Some(name) => Event::default().event(name).data(json),
            None => Event::default().data(json),
        };

        Ok::<_, Infallible>(sse_event)
    });

    let done = futures::stream::iter(terminator.map(|line| Ok::<_, Infallible>(Event::default().data(line))));

    Sse::new(event_stream.chain(done)).into_response()
}

/// An error in the caller's own format.
fn error_response(dispatcher: &Dispatcher, caller: &str, error: &LlmError) -> Response {
    let body = match dispatcher.converter(caller) {
        Ok(converter) => converter.error_body(error),
        Err(_) => serde_json::json!({ "error": { "message": error.client_message() } }),
    };

    (error.status_code(), Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::StreamExt;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::sse;
    use crate::converter::OpenAiConverter;

    #[tokio::test]
    async fn dropping_the_sse_response_cancels_the_dispatch() {
        let token = CancellationToken::new();
        let response = sse(
            Arc::new(OpenAiConverter),
            futures::stream::pending().boxed(),
            token.clone().drop_guard(),
        );

        assert!(!token.is_cancelled());

        drop(response);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn sse_body_ends_with_the_terminator() {
        let token = CancellationToken::new();
        let events = futures::stream::iter([json!({"id": "chatcmpl-1", "choices": []})]).boxed();

        let response = sse(Arc::new(OpenAiConverter), events, token.clone().drop_guard());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();

        assert!(body.starts_with(r#"data: {"id":"chatcmpl-1","choices":[]}"#));
        assert!(body.trim_end().ends_with("data: [DONE]"));
        assert!(token.is_cancelled());
    }
}
