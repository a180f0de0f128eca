//! Fixtures and assertions shared by the converter tests.

use serde_json::{Value, json};

use super::{Converter, StreamState};
use crate::messages::unified::{
    RawFields, UnifiedChoice, UnifiedChunk, UnifiedContent, UnifiedFinishReason, UnifiedImageSource, UnifiedMessage,
    UnifiedRequest, UnifiedResponse, UnifiedRole, UnifiedTool, UnifiedToolChoice, UnifiedUsage,
};

/// A multi-turn request using text, tool calls and tool results.
pub(crate) fn text_and_tools_request() -> UnifiedRequest {
    UnifiedRequest {
        model: "gpt-4".into(),
        messages: vec![
            UnifiedMessage::text(UnifiedRole::System, "You are terse."),
            UnifiedMessage::text(UnifiedRole::User, "Weather in Paris?"),
            UnifiedMessage::new(
                UnifiedRole::Assistant,
                vec![
                    UnifiedContent::text("Checking."),
                    UnifiedContent::ToolCall {
                        id: "call_1".into(),
                        name: "get_weather".into(),
                        arguments: r#"{"city":"Paris","units":["c"]}"#.into(),
                    },
                ],
            ),
            UnifiedMessage::new(
                UnifiedRole::Tool,
                vec![UnifiedContent::ToolResult {
                    tool_call_id: "call_1".into(),
                    output: "18C and sunny".into(),
                    is_error: false,
                }],
            ),
            UnifiedMessage::text(UnifiedRole::User, "Thanks!"),
        ],
        tools: Some(vec![UnifiedTool {
            name: "get_weather".into(),
            description: Some("Current weather for a city".into()),
            parameters: json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            }),
        }]),
        tool_choice: Some(UnifiedToolChoice::Auto),
        max_output_tokens: Some(256),
        temperature: Some(0.5),
        top_p: Some(0.25),
        stream: false,
        stop_sequences: Some(vec!["END".into()]),
        raw: RawFields::default(),
    }
}

/// [`text_and_tools_request`] with an inline image in the first user turn.
pub(crate) fn rich_request() -> UnifiedRequest {
    let mut request = text_and_tools_request();

    request.messages[1].content.push(UnifiedContent::Image {
        source: UnifiedImageSource::Base64 {
            data: "iVBORw0KGgo=".into(),
        },
        mime_type: "image/png".into(),
    });

    request
}

/// Encode then decode; the unified request must survive unchanged.
pub(crate) fn assert_request_round_trip(converter: &dyn Converter, request: UnifiedRequest) {
    let native = converter.to_native_request(&request, &request.model).unwrap();
    let decoded = converter.to_canonical_request(native).unwrap();

    assert_eq!(decoded, request);
}

/// Decode a recorded stream with a fresh state, ending it the way the router does.
pub(crate) fn decode_stream(converter: &dyn Converter, events: Vec<Value>) -> Vec<UnifiedChunk> {
    let mut state = StreamState::new();
    let mut chunks = Vec::new();

    for event in events {
        chunks.extend(converter.to_canonical_chunk(event, &mut state).unwrap());
    }

    chunks.extend(converter.finish_canonical_stream(&mut state));
    chunks
}

/// Folding the decoded stream must give the decoded complete response.
pub(crate) fn assert_stream_equivalent(converter: &dyn Converter, complete: Value, events: Vec<Value>) {
    let chunks = decode_stream(converter, events);
    assert_eq!(chunks.iter().filter(|chunk| chunk.is_terminal()).count(), 1);

    let streamed: UnifiedResponse = chunks.into_iter().collect();
    let mut expected = converter.to_canonical_response(complete).unwrap();

    // Envelope timestamps and passthrough fields are not part of a stream.
    expected.created = streamed.created;
    expected.raw = streamed.raw.clone();

    assert_eq!(streamed, expected);
}

pub(crate) fn assistant_response() -> UnifiedResponse {
    UnifiedResponse {
        id: "resp_1".into(),
        model: "gpt-4".into(),
        created: 0,
        choices: vec![UnifiedChoice {
            index: 0,
            message: UnifiedMessage::new(
                UnifiedRole::Assistant,
                vec![
                    UnifiedContent::text("Let me look that up."),
                    UnifiedContent::ToolCall {
                        id: "call_9".into(),
                        name: "search".into(),
                        arguments: r#"{"query":"rust streams"}"#.into(),
                    },
                ],
            ),
            finish_reason: UnifiedFinishReason::ToolCalls,
        }],
        usage: UnifiedUsage::new(21, 9),
        raw: RawFields::default(),
    }
}

/// Stream a response through the encoder, then decode it again with the same converter.
pub(crate) fn assert_stream_encoding_round_trip(converter: &dyn Converter) {
    let response = assistant_response();

    let mut encode_state = StreamState::new();
    let mut events = Vec::new();

    for chunk in response.clone().into_chunks() {
        events.extend(converter.to_native_chunk(&chunk, &mut encode_state).unwrap());
    }

    let decoded: UnifiedResponse = decode_stream(converter, events).into_iter().collect();

    assert_eq!(decoded.choices, response.choices);
    assert_eq!(decoded.usage, response.usage);
}
