//! Kiro, the AWS-backed provider family speaking Converse-shaped JSON.

mod wire;

use serde_json::{Map, Value, json};

use crate::{
    converter::{
        BlockKind, Converter, PendingToolCall, Protocol, StreamState, arguments_text, from_value, map_finish_reason,
        merge_raw, native_finish_reason, output_text, parse_arguments, raw_fields, response_raw, stream_error,
        to_value, unix_now, unrepresented,
    },
    error::{ConversionError, ConversionResult, LlmError},
    messages::unified::{
        ContentKind, UnifiedChoice, UnifiedChunk, UnifiedContent, UnifiedDelta, UnifiedFinishReason, UnifiedMessage,
        UnifiedRequest, UnifiedResponse, UnifiedRole, UnifiedTool, UnifiedToolChoice, UnifiedUsage,
    },
};

const FINISH_REASONS: &[(&str, UnifiedFinishReason)] = &[
    ("end_turn", UnifiedFinishReason::Stop),
    ("stop_sequence", UnifiedFinishReason::Stop),
    ("max_tokens", UnifiedFinishReason::Length),
    ("tool_use", UnifiedFinishReason::ToolCalls),
    ("content_filtered", UnifiedFinishReason::ContentFilter),
    ("guardrail_intervened", UnifiedFinishReason::ContentFilter),
];

const SUPPORTED_CONTENT: &[ContentKind] = &[ContentKind::Text, ContentKind::ToolCall, ContentKind::ToolResult];

/// Converter for the Kiro provider family.
#[derive(Debug, Clone, Copy, Default)]
pub struct KiroConverter;

impl Converter for KiroConverter {
    fn protocol(&self) -> Protocol {
        Protocol::Kiro
    }

    fn supported_content(&self) -> &'static [ContentKind] {
        SUPPORTED_CONTENT
    }

    fn to_canonical_request(&self, native: Value) -> ConversionResult<UnifiedRequest> {
        let request: wire::ConverseRequest = from_value(native)?;

        let model = request
            .model_id
            .or(request.model)
            .ok_or_else(|| ConversionError::missing("modelId"))?;

        let mut messages: Vec<_> = request
            .system
            .into_iter()
            .flatten()
            .map(|block| UnifiedMessage::text(UnifiedRole::System, block.text))
            .collect();

        for message in request.messages {
            decode_message(message, &mut messages)?;
        }

        let (tools, tool_choice) = match request.tool_config {
            Some(config) => {
                let tools = config
                    .tools
                    .into_iter()
                    .map(|entry| UnifiedTool {
                        name: entry.tool_spec.name,
                        description: entry.tool_spec.description,
                        parameters: entry.tool_spec.input_schema.json,
                    })
                    .collect();

                let choice = config.tool_choice.map(|choice| match choice {
                    wire::ToolChoice::Auto(_) => UnifiedToolChoice::Auto,
                    wire::ToolChoice::Any(_) => UnifiedToolChoice::Required,
                    wire::ToolChoice::Tool { name } => UnifiedToolChoice::Tool(name),
                });

                (Some(tools), choice)
            }
            None => (None, None),
        };

        let inference = request.inference_config.unwrap_or_default();

        Ok(UnifiedRequest {
            model,
            messages,
            tools,
            tool_choice,
            max_output_tokens: inference.max_tokens,
            temperature: inference.temperature,
            top_p: inference.top_p,
            stream: request.stream.unwrap_or(false),
            stop_sequences: inference.stop_sequences,
            raw: raw_fields(self.protocol(), request.extra),
        })
    }

    fn to_native_request(&self, request: &UnifiedRequest, model: &str) -> ConversionResult<Value> {
        self.ensure_supported(request)?;

        let mut system = Vec::new();
        let mut messages: Vec<wire::Message> = Vec::with_capacity(request.messages.len());
        let mut open_tool_turn = false;

        for message in &request.messages {
            match message.role {
                UnifiedRole::System => system.push(wire::SystemBlock {
                    text: message.joined_text(),
                }),
                UnifiedRole::Assistant => {
                    open_tool_turn = false;
                    messages.push(wire::Message {
                        role: "assistant".to_string(),
                        content: encode_blocks(&message.content)?,
                    });
                }
                UnifiedRole::User | UnifiedRole::Tool => {
                    let blocks = encode_blocks(&message.content)?;

                    // Tool results and the user turn after them travel as one user message.
                    match messages.last_mut() {
                        Some(last) if open_tool_turn => last.content.extend(blocks),
                        _ => messages.push(wire::Message {
                            role: "user".to_string(),
                            content: blocks,
                        }),
                    }

                    open_tool_turn = open_tool_turn || message.role == UnifiedRole::Tool;
                }
            }
        }

        let mut body = json!({
            "modelId": model,
            "messages": to_value(&messages)?,
        });

        if !system.is_empty() {
            body["system"] = to_value(&system)?;
        }

        let inference = wire::InferenceConfig {
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop_sequences.clone(),
        };

        let inference = to_value(&inference)?;

        if inference.as_object().is_some_and(|config| !config.is_empty()) {
            body["inferenceConfig"] = inference;
        }

        if let Some(tools) = &request.tools {
            let tool_choice = match &request.tool_choice {
                None => None,
                Some(UnifiedToolChoice::Auto) => Some(wire::ToolChoice::Auto(Map::new())),
                Some(UnifiedToolChoice::Required) => Some(wire::ToolChoice::Any(Map::new())),
                Some(UnifiedToolChoice::Tool(name)) => Some(wire::ToolChoice::Tool { name: name.clone() }),
                Some(UnifiedToolChoice::None) => {
                    log::debug!("Kiro has no tool choice 'none', leaving tool choice to the model");
                    None
                }
            };

            let config = wire::ToolConfig {
                tools: tools
                    .iter()
                    .map(|tool| wire::ToolEntry {
                        tool_spec: wire::ToolSpec {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            input_schema: wire::InputSchema {
                                json: tool.parameters.clone(),
                            },
                        },
                    })
                    .collect(),
                tool_choice,
            };

            body["toolConfig"] = to_value(&config)?;
        }

        if request.stream {
            body["stream"] = json!(true);
        }

        merge_raw(self.protocol(), &request.raw, &mut body);

        Ok(body)
    }

    fn to_canonical_response(&self, native: Value) -> ConversionResult<UnifiedResponse> {
        let response: wire::ConverseResponse = from_value(native)?;

        let mut content = Vec::new();
        let mut unknown = Vec::new();

        for block in response.output.message.content {
            if let Some(text) = block.text {
                content.push(UnifiedContent::text(text));
            } else if let Some(tool_use) = block.tool_use {
                content.push(UnifiedContent::ToolCall {
                    id: tool_use.tool_use_id,
                    name: tool_use.name,
                    arguments: arguments_text(&tool_use.input),
                });
            } else if !block.extra.is_empty() {
                unknown.push(Value::Object(block.extra));
            }
        }

        let finish_reason = response
            .stop_reason
            .map(|reason| map_finish_reason(self.protocol(), &reason, FINISH_REASONS))
            .unwrap_or(UnifiedFinishReason::Stop);

        let usage = response.usage.unwrap_or_default();

        Ok(UnifiedResponse {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            // Converse responses do not name the model; the dispatcher fills it in.
            model: String::new(),
            created: unix_now(),
            choices: vec![UnifiedChoice {
                index: 0,
                message: UnifiedMessage::new(UnifiedRole::Assistant, content),
                finish_reason,
            }],
            usage: UnifiedUsage::new(usage.input_tokens, usage.output_tokens),
            raw: response_raw(self.protocol(), response.extra, unknown),
        })
    }

    fn to_native_response(&self, response: &UnifiedResponse) -> ConversionResult<Value> {
        let choice = response
            .first_choice()
            .ok_or_else(|| ConversionError::new("response has no choices"))?;

        let mut content: Vec<Value> = unrepresented(self.protocol(), &response.raw).to_vec();

        for block in encode_blocks(&choice.message.content)? {
            content.push(to_value(&block)?);
        }

        let mut body = json!({
            "output": {"message": {"role": "assistant", "content": content}},
            "stopReason": stop_reason_name(choice.finish_reason),
            "usage": wire_usage(response.usage),
        });

        merge_raw(self.protocol(), &response.raw, &mut body);

        Ok(body)
    }

    fn to_canonical_chunk(&self, native: Value, state: &mut StreamState) -> ConversionResult<Vec<UnifiedChunk>> {
        let event: wire::StreamEvent = from_value(native)?;
        let mut chunks = Vec::new();

        match event {
            wire::StreamEvent::MessageStart(_) => {
                if state.id.is_empty() {
                    state.id = format!("msg_{}", uuid::Uuid::new_v4().simple());
                }
            }
            wire::StreamEvent::ContentBlockStart(start) => {
                if let Some(tool_use) = start.start.tool_use {
                    let (ordinal, _) = state.tool_ordinal(start.content_block_index.to_string());

                    state.pending_tools.insert(ordinal, PendingToolCall::default());
                    chunks.push(state.chunk(UnifiedDelta::ToolCall {
                        index: ordinal,
                        id: Some(tool_use.tool_use_id),
                        name: Some(tool_use.name),
                        arguments: String::new(),
                    }));
                }
            }
            wire::StreamEvent::ContentBlockDelta(delta) => {
                if let Some(text) = delta.delta.text {
                    chunks.push(state.chunk(UnifiedDelta::Text { text }));
                } else if let Some(tool_use) = delta.delta.tool_use {
                    let index = delta.content_block_index;
                    let ordinal = state
                        .known_tool_ordinal(&index.to_string())
                        .ok_or_else(|| ConversionError::new(format!("toolUse delta for unknown block {index}")))?;

                    if let Some(pending) = state.pending_tools.get_mut(&ordinal) {
                        pending.arguments.push_str(&tool_use.input);
                    }

                    chunks.push(state.chunk(UnifiedDelta::ToolCall {
                        index: ordinal,
                        id: None,
                        name: None,
                        arguments: tool_use.input,
                    }));
                }
            }
            wire::StreamEvent::ContentBlockStop(stop) => {
                if let Some(ordinal) = state.known_tool_ordinal(&stop.content_block_index.to_string())
                    && let Some(pending) = state.pending_tools.shift_remove(&ordinal)
                    && pending.arguments.is_empty()
                {
                    chunks.push(state.chunk(UnifiedDelta::ToolCall {
                        index: ordinal,
                        id: None,
                        name: None,
                        arguments: "{}".to_string(),
                    }));
                }
            }
            wire::StreamEvent::MessageStop(stop) => {
                state.finish_reason = Some(map_finish_reason(self.protocol(), &stop.stop_reason, FINISH_REASONS));
            }
            wire::StreamEvent::Metadata(metadata) => {
                if let Some(usage) = metadata.usage {
                    state.usage = Some(UnifiedUsage::new(usage.input_tokens, usage.output_tokens));
                }

                chunks.extend(state.terminal_chunk());
            }
            wire::StreamEvent::Other(event) => match event.iter().find(|(name, _)| name.ends_with("Exception")) {
                Some((name, detail)) => {
                    let detail = json!({"type": name, "detail": detail});
                    chunks.extend(stream_error(self.protocol(), state, &detail));
                }
                None => log::debug!("Skipping unknown Kiro stream event: {event:?}"),
            },
        }

        Ok(chunks)
    }

    fn to_native_chunk(&self, chunk: &UnifiedChunk, state: &mut StreamState) -> ConversionResult<Vec<Value>> {
        let mut events = Vec::new();

        if !state.started {
            state.started = true;
            events.push(json!({"messageStart": {"role": "assistant"}}));
        }

        match &chunk.delta {
            Some(UnifiedDelta::Text { text }) => {
                let index = match state.open_block {
                    Some(block) if block.kind == BlockKind::Text => block.index,
                    _ => {
                        close_block(state, &mut events);
                        state.allocate_block(BlockKind::Text).index
                    }
                };

                events.push(json!({
                    "contentBlockDelta": {"contentBlockIndex": index, "delta": {"text": text}},
                }));
            }
            Some(UnifiedDelta::ToolCall {
                index: ordinal,
                id,
                name,
                arguments,
            }) => {
                let index = match state.open_block {
                    Some(block) if block.kind == BlockKind::Tool(*ordinal) => block.index,
                    _ => {
                        close_block(state, &mut events);
                        let block = state.allocate_block(BlockKind::Tool(*ordinal));

                        events.push(json!({
                            "contentBlockStart": {
                                "contentBlockIndex": block.index,
                                "start": {"toolUse": {
                                    "toolUseId": id.clone().unwrap_or_default(),
                                    "name": name.clone().unwrap_or_default(),
                                }},
                            },
                        }));

                        block.index
                    }
                };

                if !arguments.is_empty() {
                    events.push(json!({
                        "contentBlockDelta": {"contentBlockIndex": index, "delta": {"toolUse": {"input": arguments}}},
                    }));
                }
            }
            Some(UnifiedDelta::Image { .. }) => {
                return Err(ConversionError::unsupported(ContentKind::Image, self.protocol()));
            }
            None => (),
        }

        if let Some(reason) = chunk.finish_reason {
            close_block(state, &mut events);

            events.push(json!({"messageStop": {"stopReason": stop_reason_name(reason)}}));
            events.push(json!({
                "metadata": {
                    "usage": wire_usage(chunk.usage.unwrap_or_default()),
                    "metrics": {"latencyMs": 0},
                },
            }));
        }

        Ok(events)
    }

    fn error_body(&self, error: &LlmError) -> Value {
        let (exception, _) = exception_names(error);

        json!({
            "__type": exception,
            "message": error.client_message(),
        })
    }

    fn error_event(&self, error: &LlmError) -> Value {
        let (_, event) = exception_names(error);
        let mut body = Map::new();

        body.insert(event.to_string(), json!({"message": error.client_message()}));

        Value::Object(body)
    }
}

/// Exception type and the matching stream event name.
fn exception_names(error: &LlmError) -> (&'static str, &'static str) {
    match error.status_code().as_u16() {
        400 => ("ValidationException", "validationException"),
        401 | 403 => ("AccessDeniedException", "accessDeniedException"),
        404 => ("ResourceNotFoundException", "resourceNotFoundException"),
        408 => ("ModelTimeoutException", "modelTimeoutException"),
        429 => ("ThrottlingException", "throttlingException"),
        503 => ("ServiceUnavailableException", "serviceUnavailableException"),
        _ => ("InternalServerException", "internalServerException"),
    }
}

fn close_block(state: &mut StreamState, events: &mut Vec<Value>) {
    if let Some(block) = state.close_block() {
        events.push(json!({"contentBlockStop": {"contentBlockIndex": block.index}}));
    }
}

fn stop_reason_name(reason: UnifiedFinishReason) -> &'static str {
    native_finish_reason(reason, FINISH_REASONS, "end_turn")
}

fn wire_usage(usage: UnifiedUsage) -> wire::TokenUsage {
    wire::TokenUsage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens(),
    }
}

fn decode_message(message: wire::Message, messages: &mut Vec<UnifiedMessage>) -> ConversionResult<()> {
    let role = match message.role.as_str() {
        "user" => UnifiedRole::User,
        "assistant" => UnifiedRole::Assistant,
        other => return Err(ConversionError::new(format!("unknown message role '{other}'"))),
    };

    let mut content = Vec::with_capacity(message.content.len());

    for block in message.content {
        if let Some(text) = block.text {
            content.push(UnifiedContent::text(text));
        } else if let Some(tool_use) = block.tool_use {
            content.push(UnifiedContent::ToolCall {
                id: tool_use.tool_use_id,
                name: tool_use.name,
                arguments: arguments_text(&tool_use.input),
            });
        } else if let Some(result) = block.tool_result {
            if !content.is_empty() {
                messages.push(UnifiedMessage::new(role, std::mem::take(&mut content)));
            }

            let output = result
                .content
                .iter()
                .map(|block| match (&block.text, &block.json) {
                    (Some(text), _) => text.clone(),
                    (None, Some(json)) => output_text(json),
                    (None, None) => String::new(),
                })
                .collect::<String>();

            messages.push(UnifiedMessage::new(
                UnifiedRole::Tool,
                vec![UnifiedContent::ToolResult {
                    tool_call_id: result.tool_use_id,
                    output,
                    is_error: result.status == Some(wire::ToolResultStatus::Error),
                }],
            ));
        } else if block.extra.contains_key("image") {
            return Err(ConversionError::unsupported(ContentKind::Image, Protocol::Kiro));
        } else if block.extra.contains_key("reasoningContent") {
            log::debug!("Dropping reasoning block from request history");
        } else {
            let keys: Vec<_> = block.extra.keys().map(String::as_str).collect();
            return Err(ConversionError::new(format!("unknown content block {keys:?}")));
        }
    }

    if !content.is_empty() {
        messages.push(UnifiedMessage::new(role, content));
    }

    Ok(())
}

fn encode_blocks(content: &[UnifiedContent]) -> ConversionResult<Vec<wire::ContentBlock>> {
    content
        .iter()
        .map(|part| {
            Ok(match part {
                UnifiedContent::Text { text } => wire::ContentBlock {
                    text: Some(text.clone()),
                    ..Default::default()
                },
                UnifiedContent::ToolCall { id, name, arguments } => wire::ContentBlock {
                    tool_use: Some(wire::ToolUse {
                        tool_use_id: id.clone(),
                        name: name.clone(),
                        input: parse_arguments(arguments)?,
                    }),
                    ..Default::default()
                },
                UnifiedContent::ToolResult {
                    tool_call_id,
                    output,
                    is_error,
                } => wire::ContentBlock {
                    tool_result: Some(wire::ToolResult {
                        tool_use_id: tool_call_id.clone(),
                        content: vec![wire::ToolResultBlock {
                            text: Some(output.clone()),
                            json: None,
                        }],
                        status: Some(if *is_error {
                            wire::ToolResultStatus::Error
                        } else {
                            wire::ToolResultStatus::Success
                        }),
                    }),
                    ..Default::default()
                },
                UnifiedContent::Image { .. } => {
                    return Err(ConversionError::unsupported(ContentKind::Image, Protocol::Kiro));
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::converter::testing;

    #[test]
    fn request_round_trip() {
        testing::assert_request_round_trip(&KiroConverter, testing::text_and_tools_request());
    }

    #[test]
    fn images_are_rejected() {
        let error = KiroConverter
            .to_native_request(&testing::rich_request(), "claude-sonnet-4")
            .unwrap_err();

        insta::assert_snapshot!(error, @"image content is not supported by the kiro format");
    }

    #[test]
    fn encodes_converse_shape() {
        let native = KiroConverter
            .to_native_request(&testing::text_and_tools_request(), "claude-sonnet-4")
            .unwrap();

        insta::assert_json_snapshot!(native["messages"][2], @r#"
        {
          "role": "user",
          "content": [
            {
              "toolResult": {
                "toolUseId": "call_1",
                "content": [
                  {
                    "text": "18C and sunny"
                  }
                ],
                "status": "success"
              }
            },
            {
              "text": "Thanks!"
            }
          ]
        }
        "#);

        assert_eq!(native["modelId"], "claude-sonnet-4");
        assert_eq!(native["toolConfig"]["toolChoice"], json!({"auto": {}}));
        assert_eq!(native["inferenceConfig"]["maxTokens"], 256);
    }

    #[test]
    fn json_tool_results_become_text() {
        let request = KiroConverter
            .to_canonical_request(json!({
                "modelId": "claude-sonnet-4",
                "messages": [
                    {"role": "user", "content": [{"toolResult": {
                        "toolUseId": "t1",
                        "content": [{"json": {"ok": true}}],
                        "status": "error"
                    }}]}
                ]
            }))
            .unwrap();

        assert_eq!(
            request.messages[0].content[0],
            UnifiedContent::ToolResult {
                tool_call_id: "t1".into(),
                output: r#"{"ok":true}"#.into(),
                is_error: true,
            }
        );
    }

    #[test]
    fn stream_matches_complete_response() {
        let complete = json!({
            "output": {"message": {"role": "assistant", "content": [
                {"text": "Looking it up."},
                {"toolUse": {"toolUseId": "tu_1", "name": "lookup", "input": {"q": "rust"}}}
            ]}},
            "stopReason": "tool_use",
            "usage": {"inputTokens": 40, "outputTokens": 10, "totalTokens": 50},
            "metrics": {"latencyMs": 812}
        });

        let events = vec![
            json!({"messageStart": {"role": "assistant"}}),
            json!({"contentBlockDelta": {"contentBlockIndex": 0, "delta": {"text": "Looking "}}}),
            json!({"contentBlockDelta": {"contentBlockIndex": 0, "delta": {"text": "it up."}}}),
            json!({"contentBlockStop": {"contentBlockIndex": 0}}),
            json!({"contentBlockStart": {"contentBlockIndex": 1, "start": {"toolUse": {"toolUseId": "tu_1", "name": "lookup"}}}}),
            json!({"contentBlockDelta": {"contentBlockIndex": 1, "delta": {"toolUse": {"input": "{\"q\":"}}}}),
            json!({"contentBlockDelta": {"contentBlockIndex": 1, "delta": {"toolUse": {"input": "\"rust\"}"}}}}),
            json!({"contentBlockStop": {"contentBlockIndex": 1}}),
            json!({"messageStop": {"stopReason": "tool_use"}}),
            json!({"metadata": {"usage": {"inputTokens": 40, "outputTokens": 10, "totalTokens": 50}, "metrics": {"latencyMs": 812}}}),
        ];

        // Converse has no response id, so ids are generated on both sides.
        let streamed: UnifiedResponse = testing::decode_stream(&KiroConverter, events).into_iter().collect();
        let expected = KiroConverter.to_canonical_response(complete).unwrap();

        assert_eq!(streamed.choices, expected.choices);
        assert_eq!(streamed.usage, expected.usage);
        assert!(streamed.id.starts_with("msg_"));
    }

    #[test]
    fn encoded_stream_decodes_back() {
        testing::assert_stream_encoding_round_trip(&KiroConverter);
    }

    #[test]
    fn exception_event_ends_stream_with_error() {
        let mut state = StreamState::new();

        let chunks = KiroConverter
            .to_canonical_chunk(
                json!({"throttlingException": {"message": "Too many requests"}}),
                &mut state,
            )
            .unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].finish_reason, Some(UnifiedFinishReason::Error));
        assert!(state.is_failed());
        assert!(KiroConverter.finish_canonical_stream(&mut state).is_none());
    }

    #[test]
    fn error_event_uses_exception_names() {
        let error = LlmError::Upstream {
            status: 429,
            message: "slow down".into(),
            retryable: true,
        };

        insta::assert_json_snapshot!(KiroConverter.error_event(&error), @r#"
        {
          "throttlingException": {
            "message": "Provider API error (429): slow down"
          }
        }
        "#);
    }
}
