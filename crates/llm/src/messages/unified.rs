//! Protocol-agnostic unified message types.
//!
//! Every converter translates its provider's wire format to and from these
//! types, so the router and pool never see provider JSON. The conversion flow is:
//!
//! ```text
//! Caller request → UnifiedRequest → provider request
//! provider response / events → UnifiedResponse / UnifiedChunk → caller response / events
//! ```
//!
//! ## Conventions
//!
//! - Content parts inside a message keep their order through every conversion.
//! - A tool result always lives in its own [`UnifiedRole::Tool`] message, one result
//!   per message, whatever grouping the provider uses on the wire.
//! - Tool call arguments are kept as JSON text, exactly as they were received.
//! - Image MIME types are normalized (lowercase, `image/jpg` → `image/jpeg`, guessed
//!   from the reference when the provider does not carry one).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod accumulate;

pub use accumulate::UnifiedResponseBuilder;

/// Unified request representation for all LLM protocols.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UnifiedRequest {
    /// Model requested by the caller, not yet resolved to a provider model name.
    pub model: String,

    /// Conversation messages, system instructions included.
    pub messages: Vec<UnifiedMessage>,

    /// Tools the model may call.
    pub tools: Option<Vec<UnifiedTool>>,

    /// How the model should use the tools.
    pub tool_choice: Option<UnifiedToolChoice>,

    /// Maximum tokens to generate.
    pub max_output_tokens: Option<u32>,

    pub temperature: Option<f32>,

    pub top_p: Option<f32>,

    /// Whether the caller wants incremental chunks.
    pub stream: bool,

    pub stop_sequences: Option<Vec<String>>,

    /// Request fields with no unified counterpart.
    pub raw: RawFields,
}

impl UnifiedRequest {
    /// Iterate over every content part of every message.
    pub fn parts(&self) -> impl Iterator<Item = &UnifiedContent> {
        self.messages.iter().flat_map(|message| message.content.iter())
    }

    /// Finds the name of the tool call a tool result answers.
    pub fn tool_name_for(&self, tool_call_id: &str) -> Option<&str> {
        self.parts().find_map(|part| match part {
            UnifiedContent::ToolCall { id, name, .. } if id == tool_call_id => Some(name.as_str()),
            _ => None,
        })
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedMessage {
    pub role: UnifiedRole,
    pub content: Vec<UnifiedContent>,
}

impl UnifiedMessage {
    pub fn new(role: UnifiedRole, content: Vec<UnifiedContent>) -> Self {
        Self { role, content }
    }

    pub fn text(role: UnifiedRole, text: impl Into<String>) -> Self {
        Self::new(role, vec![UnifiedContent::text(text)])
    }

    /// Concatenation of all text parts.
    pub fn joined_text(&self) -> String {
        self.content.iter().filter_map(UnifiedContent::as_text).collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content.iter().any(|part| matches!(part, UnifiedContent::ToolCall { .. }))
    }
}

/// Message sender role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UnifiedRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Content part of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnifiedContent {
    Text {
        text: String,
    },

    Image {
        source: UnifiedImageSource,
        /// Normalized MIME type, see [`normalize_mime_type`].
        mime_type: String,
    },

    /// Tool invocation requested by the assistant.
    ToolCall {
        id: String,
        name: String,
        /// JSON arguments as text.
        arguments: String,
    },

    /// Output of a tool, answering the tool call with the same id.
    ToolResult {
        tool_call_id: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl UnifiedContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Build an image part, normalizing the MIME type.
    pub fn image(source: UnifiedImageSource, mime_type: Option<&str>) -> Self {
        let mime_type = normalize_mime_type(mime_type, &source);
        Self::Image { source, mime_type }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Text { .. } => ContentKind::Text,
            Self::Image { .. } => ContentKind::Image,
            Self::ToolCall { .. } => ContentKind::ToolCall,
            Self::ToolResult { .. } => ContentKind::ToolResult,
        }
    }
}

/// Discriminant of [`UnifiedContent`], used by converters to declare what they can encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContentKind {
    Text,
    Image,
    ToolCall,
    ToolResult,
}

/// Where the image bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnifiedImageSource {
    /// Base64 data without any `data:` prefix.
    Base64 { data: String },
    /// Remote reference (HTTP(S) URL or provider file URI).
    Url { url: String },
}

impl UnifiedImageSource {
    /// Parse an OpenAI-style image URL, splitting `data:` URLs into MIME type and payload.
    pub fn from_data_url(url: &str) -> (Self, Option<String>) {
        if let Some(rest) = url.strip_prefix("data:")
            && let Some((meta, data)) = rest.split_once(',')
            && let Some(mime) = meta.strip_suffix(";base64")
        {
            let source = Self::Base64 { data: data.to_string() };
            return (source, Some(mime.to_string()));
        }

        (Self::Url { url: url.to_string() }, None)
    }

    /// Render as a URL, inlining base64 payloads as a `data:` URL.
    pub fn to_data_url(&self, mime_type: &str) -> String {
        match self {
            Self::Base64 { data } => format!("data:{mime_type};base64,{data}"),
            Self::Url { url } => url.clone(),
        }
    }
}

/// Normalize an image MIME type, guessing from the URL extension when absent.
pub fn normalize_mime_type(mime_type: Option<&str>, source: &UnifiedImageSource) -> String {
    let declared = mime_type.map(str::trim).filter(|m| !m.is_empty()).map(str::to_ascii_lowercase);

    let mime = declared.unwrap_or_else(|| {
        let extension = match source {
            UnifiedImageSource::Url { url } => url
                .split(['?', '#'])
                .next()
                .and_then(|path| path.rsplit_once('.'))
                .map(|(_, ext)| ext.to_ascii_lowercase()),
            UnifiedImageSource::Base64 { .. } => None,
        };

        match extension.as_deref() {
            Some("png") => "image/png",
            Some("gif") => "image/gif",
            Some("webp") => "image/webp",
            Some("heic") => "image/heic",
            _ => "image/jpeg",
        }
        .to_string()
    });

    match mime.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        _ => mime,
    }
}

/// Tool definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedTool {
    pub name: String,
    pub description: Option<String>,
    /// JSON Schema of the arguments.
    pub parameters: Value,
}

/// Tool usage policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnifiedToolChoice {
    Auto,
    None,
    /// The model must call at least one tool.
    Required,
    /// The model must call this tool.
    Tool(String),
}

/// Complete, non-streamed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedResponse {
    pub id: String,
    pub model: String,
    /// Unix timestamp in seconds.
    pub created: u64,
    pub choices: Vec<UnifiedChoice>,
    pub usage: UnifiedUsage,
    /// Provider fields with no unified counterpart.
    pub raw: RawFields,
}

impl UnifiedResponse {
    /// The first choice, which is the only one most providers return.
    pub fn first_choice(&self) -> Option<&UnifiedChoice> {
        self.choices.first()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedChoice {
    pub index: u32,
    pub message: UnifiedMessage,
    pub finish_reason: UnifiedFinishReason,
}

/// Token counters for one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnifiedUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl UnifiedUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UnifiedFinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    /// Unknown provider reason or a failure reported inside the stream.
    Error,
}

/// One incremental piece of a streamed response.
///
/// The terminal chunk of a stream carries `finish_reason` and the final `usage`;
/// every other chunk carries only a content delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedChunk {
    /// Response identifier, the same on every chunk of a stream.
    pub id: String,
    pub model: String,
    pub delta: Option<UnifiedDelta>,
    pub finish_reason: Option<UnifiedFinishReason>,
    pub usage: Option<UnifiedUsage>,
}

impl UnifiedChunk {
    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Fragment of a content part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnifiedDelta {
    /// Text to append.
    Text { text: String },

    /// A whole image produced by the model.
    Image { source: UnifiedImageSource, mime_type: String },

    /// Tool call fragment. The first fragment of a call carries `id` and `name`,
    /// later ones append to `arguments`. `index` counts tool calls in the message.
    ToolCall {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
}

/// Provider-specific fields carried through untouched.
///
/// `origin` names the converter that produced them; encoders only re-emit
/// request fields that originated from themselves.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawFields {
    pub origin: Option<String>,
    pub fields: Map<String, Value>,
}

impl RawFields {
    pub fn new(origin: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            origin: Some(origin.into()),
            fields,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The fields if they came from `origin`.
    pub fn from_origin(&self, origin: &str) -> Option<&Map<String, Value>> {
        (self.origin.as_deref() == Some(origin)).then_some(&self.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_urls_split_into_mime_and_payload() {
        let (source, mime) = UnifiedImageSource::from_data_url("data:image/PNG;base64,iVBORw0KGgo=");

        assert_eq!(source, UnifiedImageSource::Base64 { data: "iVBORw0KGgo=".into() });
        assert_eq!(mime.as_deref(), Some("image/PNG"));

        let part = UnifiedContent::image(source, mime.as_deref());
        let UnifiedContent::Image { mime_type, source } = part else {
            unreachable!()
        };

        assert_eq!(mime_type, "image/png");
        assert_eq!(source.to_data_url(&mime_type), "data:image/png;base64,iVBORw0KGgo=");
    }

    #[test]
    fn mime_type_is_guessed_from_url() {
        let source = UnifiedImageSource::Url {
            url: "https://example.com/cat.WEBP?size=large".into(),
        };

        assert_eq!(normalize_mime_type(None, &source), "image/webp");
        assert_eq!(normalize_mime_type(Some("image/jpg"), &source), "image/jpeg");
    }

    #[test]
    fn tool_name_lookup_by_call_id() {
        let request = UnifiedRequest {
            model: "m".into(),
            messages: vec![UnifiedMessage::new(
                UnifiedRole::Assistant,
                vec![UnifiedContent::ToolCall {
                    id: "call_1".into(),
                    name: "get_weather".into(),
                    arguments: "{}".into(),
                }],
            )],
            ..Default::default()
        };

        assert_eq!(request.tool_name_for("call_1"), Some("get_weather"));
        assert_eq!(request.tool_name_for("call_2"), None);
    }
}
