use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, header::AUTHORIZATION};
use secrecy::ExposeSecret;
use serde_json::{Map, Value};

use super::{Transport, UpstreamCall, UpstreamFailure, UpstreamReply};
use crate::{converter::Protocol, http_client::default_http_client_builder, pool::Credential};

const DEFAULT_OPENAI_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_GOOGLE_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_KIRO_API_URL: &str = "https://bedrock-runtime.us-east-1.amazonaws.com";

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Longest provider error text kept in failure messages.
const MAX_ERROR_TEXT: usize = 512;

/// [`Transport`] over HTTPS, shaping URL and auth headers per protocol.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> reqwest::Result<Self> {
        let client = default_http_client_builder().build()?;
        Ok(Self { client })
    }

    fn request(&self, call: &UpstreamCall<'_>) -> RequestBuilder {
        let base = base_url(call.protocol, call.credential);
        let model = call.model;

        let url = match (call.protocol, call.stream) {
            (Protocol::OpenAiChat, _) => format!("{base}/chat/completions"),
            (Protocol::OpenAiResponses, _) => format!("{base}/responses"),
            (Protocol::Claude, _) => format!("{base}/messages"),
            (Protocol::Gemini, false) => format!("{base}/models/{model}:generateContent"),
            (Protocol::Gemini, true) => format!("{base}/models/{model}:streamGenerateContent?alt=sse"),
            (Protocol::Kiro, false) => format!("{base}/model/{model}/converse"),
            (Protocol::Kiro, true) => format!("{base}/model/{model}/converse-stream"),
        };

        let mut builder = self.client.post(url);

        let Some(key) = call.credential.api_key() else {
            log::debug!(
                "Credential '{}' of '{}' carries no api key",
                call.credential.id(),
                call.provider_type
            );
            return builder;
        };

        builder = match call.protocol {
            Protocol::OpenAiChat | Protocol::OpenAiResponses | Protocol::Kiro => {
                builder.header(AUTHORIZATION, format!("Bearer {}", key.expose_secret()))
            }
            Protocol::Claude => builder
                .header("x-api-key", key.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION),
            Protocol::Gemini => builder.header("x-goog-api-key", key.expose_secret()),
        };

        builder
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, mut call: UpstreamCall<'_>) -> Result<UpstreamReply, UpstreamFailure> {
        let body = sonic_rs::to_vec(&body_for_wire(call.protocol, call.body.take()))
            .map_err(|e| UpstreamFailure::Malformed(format!("failed to serialize request: {e}")))?;

        let response = self
            .request(&call)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(send_failure)?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            log::error!(
                "{} API error ({status}) for credential '{}': {error_text}",
                call.provider_type,
                call.credential.id()
            );

            return Err(UpstreamFailure::Status {
                status: status.as_u16(),
                message: error_message(&error_text),
            });
        }

        if !call.stream {
            let response_text = response.text().await.map_err(send_failure)?;

            let body: Value = sonic_rs::from_str(&response_text).map_err(|e| {
                log::debug!("Response parsing failed, length: {} bytes", response_text.len());
                UpstreamFailure::Malformed(e.to_string())
            })?;

            return Ok(UpstreamReply::Complete(body));
        }

        let protocol = call.protocol;
        let provider = call.provider_type.to_string();

        let events = response.bytes_stream().eventsource().filter_map(move |event| {
            let provider = provider.clone();

            async move {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("SSE parsing error in {provider} stream: {e}");
                        return Some(Err(UpstreamFailure::Network(e.to_string())));
                    }
                };

                if event.data.trim() == "[DONE]" || event.data.trim().is_empty() {
                    return None;
                }

                match sonic_rs::from_str::<Value>(&event.data) {
                    Ok(data) => Some(Ok(frame_event(protocol, &event.event, data))),
                    Err(e) => {
                        log::warn!("Failed to parse {provider} streaming event: {e}");
                        Some(Err(UpstreamFailure::Malformed(e.to_string())))
                    }
                }
            }
        });

        Ok(UpstreamReply::Stream(events.boxed()))
    }
}

fn base_url(protocol: Protocol, credential: &Credential) -> String {
    let base = match credential.base_url() {
        Some(url) => url.as_str(),
        None => match protocol {
            Protocol::OpenAiChat | Protocol::OpenAiResponses => DEFAULT_OPENAI_API_URL,
            Protocol::Claude => DEFAULT_ANTHROPIC_API_URL,
            Protocol::Gemini => DEFAULT_GOOGLE_API_URL,
            Protocol::Kiro => DEFAULT_KIRO_API_URL,
        },
    };

    base.trim_end_matches('/').to_string()
}

/// Gemini and Converse carry the model (and streaming mode) in the URL, not the body.
fn body_for_wire(protocol: Protocol, mut body: Value) -> Value {
    let keys: &[&str] = match protocol {
        Protocol::Gemini => &["model"],
        Protocol::Kiro => &["modelId", "stream"],
        _ => &[],
    };

    if let Value::Object(ref mut object) = body {
        for key in keys {
            object.remove(*key);
        }
    }

    body
}

/// Converse streams name the event in the SSE `event:` field; the decoder expects `{name: payload}`.
fn frame_event(protocol: Protocol, name: &str, data: Value) -> Value {
    if protocol != Protocol::Kiro || name.is_empty() || name == "message" {
        return data;
    }

    if data.get(name).is_some() {
        return data;
    }

    let mut framed = Map::new();
    framed.insert(name.to_string(), data);

    Value::Object(framed)
}

fn send_failure(error: reqwest::Error) -> UpstreamFailure {
    if error.is_timeout() {
        UpstreamFailure::Timeout
    } else {
        UpstreamFailure::Network(error.to_string())
    }
}

/// The provider's own error message when the body is a known error shape.
fn error_message(text: &str) -> String {
    let parsed = sonic_rs::from_str::<Value>(text).ok();

    let message = parsed.as_ref().and_then(|body| {
        body.pointer("/error/message")
            .or_else(|| body.get("message"))
            .or_else(|| body.get("Message"))
            .and_then(Value::as_str)
    });

    let message = message.unwrap_or(text);

    match message.char_indices().nth(MAX_ERROR_TEXT) {
        Some((cut, _)) => format!("{}...", &message[..cut]),
        None => message.to_string(),
    }
}
