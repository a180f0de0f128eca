//! Bidirectional translators between provider wire formats and the unified model.
//!
//! A [`Converter`] is a pure function of its input: everything a stream needs
//! to remember between events lives in the caller-owned [`StreamState`].

use serde_json::{Map, Value};

use crate::{
    error::{ConversionError, ConversionResult, LlmError},
    messages::unified::{ContentKind, RawFields, UnifiedChunk, UnifiedFinishReason, UnifiedRequest, UnifiedResponse},
};

pub(crate) mod claude;
pub(crate) mod gemini;
pub(crate) mod kiro;
pub(crate) mod openai;
pub(crate) mod responses;
mod state;
#[cfg(test)]
pub(crate) mod testing;

pub use claude::ClaudeConverter;
pub use gemini::GeminiConverter;
pub use kiro::KiroConverter;
pub use openai::OpenAiConverter;
pub use responses::ResponsesConverter;
pub use state::{BlockKind, PendingToolCall, StreamState};

/// Native wire format family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr, strum::EnumString)]
pub enum Protocol {
    #[strum(serialize = "openai")]
    OpenAiChat,
    #[strum(serialize = "openai-responses")]
    OpenAiResponses,
    #[strum(serialize = "gemini")]
    Gemini,
    #[strum(serialize = "claude")]
    Claude,
    #[strum(serialize = "kiro")]
    Kiro,
}

pub(crate) const ALL_CONTENT: &[ContentKind] = &[
    ContentKind::Text,
    ContentKind::Image,
    ContentKind::ToolCall,
    ContentKind::ToolResult,
];

/// Translates one provider's native JSON to and from the unified model.
pub trait Converter: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Content kinds this format can encode.
    fn supported_content(&self) -> &'static [ContentKind] {
        ALL_CONTENT
    }

    fn to_canonical_request(&self, native: Value) -> ConversionResult<UnifiedRequest>;

    /// Encode for this provider, using `model` in place of the requested model name.
    fn to_native_request(&self, request: &UnifiedRequest, model: &str) -> ConversionResult<Value>;

    fn to_canonical_response(&self, native: Value) -> ConversionResult<UnifiedResponse>;

    fn to_native_response(&self, response: &UnifiedResponse) -> ConversionResult<Value>;

    /// Decode one native stream event. An event may yield zero or more chunks.
    fn to_canonical_chunk(&self, native: Value, state: &mut StreamState) -> ConversionResult<Vec<UnifiedChunk>>;

    /// Called once the upstream stream ends; yields the terminal chunk if none was emitted.
    fn finish_canonical_stream(&self, state: &mut StreamState) -> Option<UnifiedChunk> {
        state.terminal_chunk()
    }

    /// Encode one unified chunk as zero or more native stream events.
    fn to_native_chunk(&self, chunk: &UnifiedChunk, state: &mut StreamState) -> ConversionResult<Vec<Value>>;

    /// Error body in this format.
    fn error_body(&self, error: &LlmError) -> Value;

    /// Error as the terminal event of a stream in this format.
    fn error_event(&self, error: &LlmError) -> Value {
        self.error_body(error)
    }

    /// SSE `event:` name for a native stream event: its `type` field, when it has one.
    fn event_name<'a>(&self, event: &'a Value) -> Option<&'a str> {
        event.get("type").and_then(Value::as_str)
    }

    /// Literal data line closing a stream, if the format has one.
    fn stream_terminator(&self) -> Option<&'static str> {
        None
    }

    /// Fails if the request holds content this format cannot encode.
    fn ensure_supported(&self, request: &UnifiedRequest) -> ConversionResult<()> {
        let supported = self.supported_content();

        match request.parts().map(|part| part.kind()).find(|kind| !supported.contains(kind)) {
            Some(kind) => Err(ConversionError::unsupported(kind, self.protocol())),
            None => Ok(()),
        }
    }
}

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    u64::try_from(jiff::Timestamp::now().as_second()).unwrap_or_default()
}

/// Look up a native finish reason, mapping anything unknown to `Error` with a warning.
pub(crate) fn map_finish_reason(
    protocol: Protocol,
    native: &str,
    table: &[(&str, UnifiedFinishReason)],
) -> UnifiedFinishReason {
    match table.iter().find(|(name, _)| *name == native) {
        Some((_, reason)) => *reason,
        None => {
            log::warn!("Unknown {protocol} finish reason '{native}', treating as error");
            UnifiedFinishReason::Error
        }
    }
}

/// Reverse lookup, first native name wins.
pub(crate) fn native_finish_reason<'a>(
    reason: UnifiedFinishReason,
    table: &[(&'a str, UnifiedFinishReason)],
    fallback: &'a str,
) -> &'a str {
    table
        .iter()
        .find(|(_, unified)| *unified == reason)
        .map(|(name, _)| *name)
        .unwrap_or(fallback)
}

/// Parse tool call arguments kept as text into a JSON object.
pub(crate) fn parse_arguments(arguments: &str) -> ConversionResult<Value> {
    if arguments.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    serde_json::from_str(arguments)
        .map_err(|e| ConversionError::new(format!("tool call arguments are not valid JSON: {e}")))
}

/// Compact JSON text for arguments carried as objects on the wire.
pub(crate) fn arguments_text(arguments: &Value) -> String {
    match arguments {
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    }
}

/// Tool output as text. Strings are taken verbatim, anything else is serialized.
pub(crate) fn output_text(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Fields of `extra` worth keeping, tagged with the protocol that produced them.
pub(crate) fn raw_fields(protocol: Protocol, extra: Map<String, Value>) -> RawFields {
    if extra.is_empty() {
        RawFields::default()
    } else {
        RawFields::new(protocol.as_ref(), extra)
    }
}

/// Raw field holding native content items with no unified counterpart.
pub(crate) const UNREPRESENTED: &str = "unrepresented_content";

/// Copy passthrough fields into an outgoing object, never overwriting encoded keys.
pub(crate) fn merge_raw(protocol: Protocol, raw: &RawFields, target: &mut Value) {
    let (Some(fields), Value::Object(object)) = (raw.from_origin(protocol.as_ref()), target) else {
        return;
    };

    for (key, value) in fields.iter().filter(|(key, _)| *key != UNREPRESENTED) {
        object.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

/// Response passthrough, with unknown content items stored under [`UNREPRESENTED`].
pub(crate) fn response_raw(protocol: Protocol, mut extra: Map<String, Value>, unrepresented: Vec<Value>) -> RawFields {
    if !unrepresented.is_empty() {
        extra.insert(UNREPRESENTED.to_string(), Value::Array(unrepresented));
    }

    raw_fields(protocol, extra)
}

/// Unknown content items kept from a response of the same protocol.
pub(crate) fn unrepresented(protocol: Protocol, raw: &RawFields) -> &[Value] {
    raw.from_origin(protocol.as_ref())
        .and_then(|fields| fields.get(UNREPRESENTED))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Terminal error chunk for a failure reported inside the stream.
pub(crate) fn stream_error(protocol: Protocol, state: &mut StreamState, detail: &Value) -> Vec<UnifiedChunk> {
    log::warn!("{protocol} stream reported an error: {detail}");

    state.finish_reason = Some(UnifiedFinishReason::Error);
    state.mark_failed();
    state.terminal_chunk().into_iter().collect()
}

/// Serialize a wire struct, mapping the (practically impossible) failure to a conversion error.
pub(crate) fn to_value<T: serde::Serialize>(value: &T) -> ConversionResult<Value> {
    serde_json::to_value(value).map_err(ConversionError::from)
}

/// Deserialize a wire struct from a native payload.
pub(crate) fn from_value<T: serde::de::DeserializeOwned>(native: Value) -> ConversionResult<T> {
    serde_json::from_value(native).map_err(ConversionError::from)
}
