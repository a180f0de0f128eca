//! Anthropic Claude Messages (`/v1/messages`).

mod wire;

use serde_json::{Value, json};

use crate::{
    converter::{
        BlockKind, Converter, PendingToolCall, Protocol, StreamState, arguments_text, from_value, map_finish_reason,
        merge_raw, parse_arguments, raw_fields, response_raw, stream_error, to_value, unrepresented,
    },
    error::{ConversionError, ConversionResult, LlmError},
    messages::unified::{
        UnifiedChoice, UnifiedChunk, UnifiedContent, UnifiedDelta, UnifiedFinishReason, UnifiedImageSource,
        UnifiedMessage, UnifiedRequest, UnifiedResponse, UnifiedRole, UnifiedTool, UnifiedToolChoice, UnifiedUsage,
    },
};

const FINISH_REASONS: &[(&str, UnifiedFinishReason)] = &[
    ("end_turn", UnifiedFinishReason::Stop),
    ("stop_sequence", UnifiedFinishReason::Stop),
    ("max_tokens", UnifiedFinishReason::Length),
    ("tool_use", UnifiedFinishReason::ToolCalls),
    ("refusal", UnifiedFinishReason::ContentFilter),
];

/// Used when the caller's format has no token limit and Claude requires one.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Converter for the Anthropic Messages API.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaudeConverter;

impl Converter for ClaudeConverter {
    fn protocol(&self) -> Protocol {
        Protocol::Claude
    }

    fn to_canonical_request(&self, native: Value) -> ConversionResult<UnifiedRequest> {
        let request: wire::MessagesRequest = from_value(native)?;
        let mut messages = Vec::with_capacity(request.messages.len() + 1);

        match request.system {
            Some(wire::SystemPrompt::Text(text)) => messages.push(UnifiedMessage::text(UnifiedRole::System, text)),
            Some(wire::SystemPrompt::Blocks(blocks)) => messages.extend(
                blocks
                    .into_iter()
                    .map(|block| UnifiedMessage::text(UnifiedRole::System, block.text)),
            ),
            None => (),
        }

        for message in request.messages {
            decode_message(message, &mut messages)?;
        }

        let tools = request.tools.map(|tools| {
            tools
                .into_iter()
                .map(|tool| UnifiedTool {
                    name: tool.name,
                    description: tool.description,
                    parameters: tool.input_schema,
                })
                .collect()
        });

        let tool_choice = request.tool_choice.map(|choice| match choice {
            wire::ToolChoice::Auto => UnifiedToolChoice::Auto,
            wire::ToolChoice::Any => UnifiedToolChoice::Required,
            wire::ToolChoice::None => UnifiedToolChoice::None,
            wire::ToolChoice::Tool { name } => UnifiedToolChoice::Tool(name),
        });

        Ok(UnifiedRequest {
            model: request.model,
            messages,
            tools,
            tool_choice,
            max_output_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stream: request.stream.unwrap_or(false),
            stop_sequences: request.stop_sequences,
            raw: raw_fields(self.protocol(), request.extra),
        })
    }

    fn to_native_request(&self, request: &UnifiedRequest, model: &str) -> ConversionResult<Value> {
        self.ensure_supported(request)?;

        let mut system = Vec::new();
        let mut messages: Vec<Value> = Vec::with_capacity(request.messages.len());
        // Whether the last encoded message is a user turn opened by tool results.
        let mut open_tool_turn = false;

        for message in &request.messages {
            match message.role {
                UnifiedRole::System => system.push(message.joined_text()),
                UnifiedRole::Assistant => {
                    open_tool_turn = false;
                    messages.push(json!({"role": "assistant", "content": encode_content(&message.content)?}));
                }
                UnifiedRole::User | UnifiedRole::Tool => {
                    let blocks = message
                        .content
                        .iter()
                        .map(encode_block)
                        .collect::<ConversionResult<Vec<_>>>()?;

                    // Tool results and the user turn that follows them form one Claude user message.
                    if open_tool_turn
                        && let Some(Value::Array(content)) = messages.last_mut().and_then(|last| last.get_mut("content"))
                    {
                        for block in blocks {
                            content.push(to_value(&block)?);
                        }
                    } else if message.role == UnifiedRole::User {
                        messages.push(json!({"role": "user", "content": encode_content(&message.content)?}));
                    } else {
                        messages.push(json!({"role": "user", "content": to_value(&blocks)?}));
                    }

                    open_tool_turn = message.role == UnifiedRole::Tool || open_tool_turn;
                }
            }
        }

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });

        match system.as_slice() {
            [] => (),
            [text] => body["system"] = json!(text),
            texts => {
                let blocks: Vec<_> = texts.iter().map(|text| json!({"type": "text", "text": text})).collect();
                body["system"] = Value::Array(blocks);
            }
        }

        if let Some(tools) = &request.tools {
            let tools: Vec<_> = tools
                .iter()
                .map(|tool| wire::Tool {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.parameters.clone(),
                })
                .collect();

            body["tools"] = to_value(&tools)?;
        }

        if let Some(choice) = &request.tool_choice {
            let choice = match choice {
                UnifiedToolChoice::Auto => wire::ToolChoice::Auto,
                UnifiedToolChoice::None => wire::ToolChoice::None,
                UnifiedToolChoice::Required => wire::ToolChoice::Any,
                UnifiedToolChoice::Tool(name) => wire::ToolChoice::Tool { name: name.clone() },
            };

            body["tool_choice"] = to_value(&choice)?;
        }

        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }

        if let Some(stop) = &request.stop_sequences {
            body["stop_sequences"] = json!(stop);
        }

        if request.stream {
            body["stream"] = json!(true);
        }

        merge_raw(self.protocol(), &request.raw, &mut body);

        Ok(body)
    }

    fn to_canonical_response(&self, native: Value) -> ConversionResult<UnifiedResponse> {
        let response: wire::MessagesResponse = from_value(native)?;

        let mut content = Vec::with_capacity(response.content.len());
        let mut unknown = Vec::new();

        for block in response.content {
            match block {
                wire::ResponseBlock::Text { text } => content.push(UnifiedContent::text(text)),
                wire::ResponseBlock::ToolUse { id, name, input } => content.push(UnifiedContent::ToolCall {
                    id,
                    name,
                    arguments: arguments_text(&input),
                }),
                wire::ResponseBlock::Unknown(block) => unknown.push(block),
            }
        }

        let finish_reason = response
            .stop_reason
            .map(|reason| map_finish_reason(self.protocol(), &reason, FINISH_REASONS))
            .unwrap_or(UnifiedFinishReason::Stop);

        let mut extra = response.extra;

        if let Some(sequence) = response.stop_sequence {
            extra.insert("stop_sequence".to_string(), json!(sequence));
        }

        Ok(UnifiedResponse {
            id: response.id,
            model: response.model,
            created: crate::converter::unix_now(),
            choices: vec![UnifiedChoice {
                index: 0,
                message: UnifiedMessage::new(UnifiedRole::Assistant, content),
                finish_reason,
            }],
            usage: UnifiedUsage::new(
                response.usage.input_tokens.unwrap_or_default(),
                response.usage.output_tokens.unwrap_or_default(),
            ),
            raw: response_raw(self.protocol(), extra, unknown),
        })
    }

    fn to_native_response(&self, response: &UnifiedResponse) -> ConversionResult<Value> {
        let choice = response
            .first_choice()
            .ok_or_else(|| ConversionError::new("response has no choices"))?;

        // Thinking and other unrepresented blocks came first in the original response.
        let mut content: Vec<Value> = unrepresented(self.protocol(), &response.raw).to_vec();

        for part in &choice.message.content {
            content.push(match part {
                UnifiedContent::Text { text } => json!({"type": "text", "text": text}),
                UnifiedContent::ToolCall { id, name, arguments } => {
                    json!({"type": "tool_use", "id": id, "name": name, "input": parse_arguments(arguments)?})
                }
                UnifiedContent::Image { .. } => {
                    return Err(ConversionError::unsupported("assistant image", self.protocol()));
                }
                UnifiedContent::ToolResult { .. } => {
                    return Err(ConversionError::new("tool results cannot appear in model output"));
                }
            });
        }

        let mut body = json!({
            "id": response.id,
            "type": "message",
            "role": "assistant",
            "model": response.model,
            "content": content,
            "stop_reason": stop_reason_name(choice.finish_reason),
            "stop_sequence": null,
            "usage": {
                "input_tokens": response.usage.prompt_tokens,
                "output_tokens": response.usage.completion_tokens,
            },
        });

        if let Some(sequence) = response
            .raw
            .from_origin(self.protocol().as_ref())
            .and_then(|raw| raw.get("stop_sequence"))
        {
            body["stop_sequence"] = sequence.clone();
        }

        merge_raw(self.protocol(), &response.raw, &mut body);

        Ok(body)
    }

    fn to_canonical_chunk(&self, native: Value, state: &mut StreamState) -> ConversionResult<Vec<UnifiedChunk>> {
        let event: wire::StreamEvent = from_value(native)?;
        let mut chunks = Vec::new();

        match event {
            wire::StreamEvent::MessageStart { message } => {
                state.observe_envelope(Some(&message.id), Some(&message.model));
                state.usage = Some(UnifiedUsage::new(
                    message.usage.input_tokens.unwrap_or_default(),
                    message.usage.output_tokens.unwrap_or_default(),
                ));
            }
            wire::StreamEvent::ContentBlockStart { index, content_block } => {
                match content_block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        let text = content_block.get("text").and_then(Value::as_str).unwrap_or_default();

                        if !text.is_empty() {
                            chunks.push(state.chunk(UnifiedDelta::Text { text: text.to_string() }));
                        }
                    }
                    Some("tool_use") => {
                        let (ordinal, _) = state.tool_ordinal(index.to_string());
                        let field = |name: &str| content_block.get(name).and_then(Value::as_str).map(str::to_string);

                        state.pending_tools.insert(ordinal, PendingToolCall::default());
                        chunks.push(state.chunk(UnifiedDelta::ToolCall {
                            index: ordinal,
                            id: field("id"),
                            name: field("name"),
                            arguments: String::new(),
                        }));
                    }
                    other => log::debug!("Skipping Claude content block of type {other:?}"),
                }
            }
            wire::StreamEvent::ContentBlockDelta { index, delta } => {
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = delta.get("text").and_then(Value::as_str).unwrap_or_default();
                        chunks.push(state.chunk(UnifiedDelta::Text { text: text.to_string() }));
                    }
                    Some("input_json_delta") => {
                        let ordinal = state
                            .known_tool_ordinal(&index.to_string())
                            .ok_or_else(|| ConversionError::new(format!("input_json_delta for unknown block {index}")))?;

                        let fragment = delta.get("partial_json").and_then(Value::as_str).unwrap_or_default();

                        if let Some(pending) = state.pending_tools.get_mut(&ordinal) {
                            pending.arguments.push_str(fragment);
                        }

                        if !fragment.is_empty() {
                            chunks.push(state.chunk(UnifiedDelta::ToolCall {
                                index: ordinal,
                                id: None,
                                name: None,
                                arguments: fragment.to_string(),
                            }));
                        }
                    }
                    other => log::debug!("Skipping Claude delta of type {other:?}"),
                }
            }
            wire::StreamEvent::ContentBlockStop { index } => {
                // A tool call streamed without input still has empty object arguments.
                if let Some(ordinal) = state.known_tool_ordinal(&index.to_string())
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
            wire::StreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    state.finish_reason = Some(map_finish_reason(self.protocol(), &reason, FINISH_REASONS));
                }

                if let Some(usage) = usage {
                    let current = state.usage.unwrap_or_default();

                    state.usage = Some(UnifiedUsage::new(
                        usage.input_tokens.unwrap_or(current.prompt_tokens),
                        usage.output_tokens.unwrap_or(current.completion_tokens),
                    ));
                }
            }
            wire::StreamEvent::MessageStop => chunks.extend(state.terminal_chunk()),
            wire::StreamEvent::Error { error } => chunks.extend(stream_error(self.protocol(), state, &error)),
            wire::StreamEvent::Ping => (),
            wire::StreamEvent::Unknown(event) => log::debug!("Skipping unknown Claude stream event: {event}"),
        }

        Ok(chunks)
    }

    fn to_native_chunk(&self, chunk: &UnifiedChunk, state: &mut StreamState) -> ConversionResult<Vec<Value>> {
        state.observe_envelope(Some(&chunk.id), Some(&chunk.model));

        let mut events = Vec::new();

        if !state.started {
            state.started = true;

            events.push(json!({
                "type": "message_start",
                "message": {
                    "id": state.id,
                    "type": "message",
                    "role": "assistant",
                    "model": state.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                },
            }));
        }

        match &chunk.delta {
            Some(UnifiedDelta::Text { text }) => {
                let index = match state.open_block {
                    Some(block) if block.kind == BlockKind::Text => block.index,
                    _ => {
                        close_block(state, &mut events);
                        let block = state.allocate_block(BlockKind::Text);

                        events.push(json!({
                            "type": "content_block_start",
                            "index": block.index,
                            "content_block": {"type": "text", "text": ""},
                        }));

                        block.index
                    }
                };

                events.push(json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "text_delta", "text": text},
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
                            "type": "content_block_start",
                            "index": block.index,
                            "content_block": {
                                "type": "tool_use",
                                "id": id.clone().unwrap_or_default(),
                                "name": name.clone().unwrap_or_default(),
                                "input": {},
                            },
                        }));

                        block.index
                    }
                };

                if !arguments.is_empty() {
                    events.push(json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "input_json_delta", "partial_json": arguments},
                    }));
                }
            }
            Some(UnifiedDelta::Image { .. }) => {
                return Err(ConversionError::unsupported("assistant image", self.protocol()));
            }
            None => (),
        }

        if let Some(reason) = chunk.finish_reason {
            close_block(state, &mut events);

            let usage = chunk.usage.unwrap_or_default();

            events.push(json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason_name(reason), "stop_sequence": null},
                "usage": {"input_tokens": usage.prompt_tokens, "output_tokens": usage.completion_tokens},
            }));

            events.push(json!({"type": "message_stop"}));
        }

        Ok(events)
    }

    fn error_body(&self, error: &LlmError) -> Value {
        let kind = match error.status_code().as_u16() {
            400 => "invalid_request_error",
            401 => "authentication_error",
            403 => "permission_error",
            404 => "not_found_error",
            429 => "rate_limit_error",
            503 => "overloaded_error",
            _ => "api_error",
        };

        json!({
            "type": "error",
            "error": {"type": kind, "message": error.client_message()},
        })
    }
}

fn close_block(state: &mut StreamState, events: &mut Vec<Value>) {
    if let Some(block) = state.close_block() {
        events.push(json!({"type": "content_block_stop", "index": block.index}));
    }
}

fn stop_reason_name(reason: UnifiedFinishReason) -> &'static str {
    match reason {
        UnifiedFinishReason::Stop | UnifiedFinishReason::Error => "end_turn",
        UnifiedFinishReason::Length => "max_tokens",
        UnifiedFinishReason::ToolCalls => "tool_use",
        UnifiedFinishReason::ContentFilter => "refusal",
    }
}

fn decode_message(message: wire::InputMessage, messages: &mut Vec<UnifiedMessage>) -> ConversionResult<()> {
    let role = match message.role {
        wire::Role::User => UnifiedRole::User,
        wire::Role::Assistant => UnifiedRole::Assistant,
    };

    let blocks = match message.content {
        wire::MessageContent::Text(text) => {
            messages.push(UnifiedMessage::text(role, text));
            return Ok(());
        }
        wire::MessageContent::Blocks(blocks) => blocks,
    };

    let mut content = Vec::with_capacity(blocks.len());

    for block in blocks {
        match block {
            wire::ContentBlock::ToolResult {
                tool_use_id,
                content: result,
                is_error,
            } => {
                if role != UnifiedRole::User {
                    return Err(ConversionError::new("tool_result blocks are only allowed in user messages"));
                }

                // Each tool result becomes its own tool message, keeping block order.
                if !content.is_empty() {
                    messages.push(UnifiedMessage::new(role, std::mem::take(&mut content)));
                }

                messages.push(UnifiedMessage::new(
                    UnifiedRole::Tool,
                    vec![UnifiedContent::ToolResult {
                        tool_call_id: tool_use_id,
                        output: tool_result_text(result)?,
                        is_error,
                    }],
                ));
            }
            wire::ContentBlock::Text { text } => content.push(UnifiedContent::text(text)),
            wire::ContentBlock::Image { source } => content.push(decode_image(source)),
            wire::ContentBlock::ToolUse { id, name, input } => {
                if role != UnifiedRole::Assistant {
                    return Err(ConversionError::new("tool_use blocks are only allowed in assistant messages"));
                }

                content.push(UnifiedContent::ToolCall {
                    id,
                    name,
                    arguments: arguments_text(&input),
                });
            }
            wire::ContentBlock::Thinking { .. } | wire::ContentBlock::RedactedThinking { .. } => {
                log::debug!("Dropping thinking block from request history");
            }
        }
    }

    if !content.is_empty() {
        messages.push(UnifiedMessage::new(role, content));
    }

    Ok(())
}

fn decode_image(source: wire::ImageSource) -> UnifiedContent {
    match source {
        wire::ImageSource::Base64 { media_type, data } => {
            UnifiedContent::image(UnifiedImageSource::Base64 { data }, Some(&media_type))
        }
        wire::ImageSource::Url { url } => UnifiedContent::image(UnifiedImageSource::Url { url }, None),
    }
}

fn tool_result_text(content: Option<wire::ToolResultContent>) -> ConversionResult<String> {
    match content {
        None => Ok(String::new()),
        Some(wire::ToolResultContent::Text(text)) => Ok(text),
        Some(wire::ToolResultContent::Blocks(blocks)) => blocks
            .into_iter()
            .map(|block| match block {
                wire::ContentBlock::Text { text } => Ok(text),
                _ => Err(ConversionError::new("tool_result content may only hold text blocks")),
            })
            .collect(),
    }
}

fn encode_block(part: &UnifiedContent) -> ConversionResult<wire::ContentBlock> {
    Ok(match part {
        UnifiedContent::Text { text } => wire::ContentBlock::Text { text: text.clone() },
        UnifiedContent::Image { source, mime_type } => wire::ContentBlock::Image {
            source: match source {
                UnifiedImageSource::Base64 { data } => wire::ImageSource::Base64 {
                    media_type: mime_type.clone(),
                    data: data.clone(),
                },
                UnifiedImageSource::Url { url } => wire::ImageSource::Url { url: url.clone() },
            },
        },
        UnifiedContent::ToolCall { id, name, arguments } => wire::ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: parse_arguments(arguments)?,
        },
        UnifiedContent::ToolResult {
            tool_call_id,
            output,
            is_error,
        } => wire::ContentBlock::ToolResult {
            tool_use_id: tool_call_id.clone(),
            content: Some(wire::ToolResultContent::Text(output.clone())),
            is_error: *is_error,
        },
    })
}

/// A single text part is sent as a plain string, anything else as blocks.
fn encode_content(content: &[UnifiedContent]) -> ConversionResult<Value> {
    match content {
        [UnifiedContent::Text { text }] => Ok(json!(text)),
        parts => {
            let blocks = parts.iter().map(encode_block).collect::<ConversionResult<Vec<_>>>()?;
            to_value(&blocks)
        }
    }
}
