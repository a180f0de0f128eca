//! OpenAI Chat Completions (`/v1/chat/completions`).

mod wire;

use serde_json::{Value, json};

use crate::{
    converter::{
        Converter, Protocol, StreamState, from_value, map_finish_reason, merge_raw, raw_fields, stream_error, to_value,
    },
    error::{ConversionError, ConversionResult, LlmError},
    messages::unified::{
        UnifiedChoice, UnifiedChunk, UnifiedContent, UnifiedDelta, UnifiedFinishReason, UnifiedImageSource,
        UnifiedMessage, UnifiedRequest, UnifiedResponse, UnifiedRole, UnifiedTool, UnifiedToolChoice, UnifiedUsage,
    },
};

const FINISH_REASONS: &[(&str, UnifiedFinishReason)] = &[
    ("stop", UnifiedFinishReason::Stop),
    ("length", UnifiedFinishReason::Length),
    ("tool_calls", UnifiedFinishReason::ToolCalls),
    ("function_call", UnifiedFinishReason::ToolCalls),
    ("content_filter", UnifiedFinishReason::ContentFilter),
];

/// Converter for the OpenAI Chat Completions format and its compatible providers.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiConverter;

impl Converter for OpenAiConverter {
    fn protocol(&self) -> Protocol {
        Protocol::OpenAiChat
    }

    fn to_canonical_request(&self, native: Value) -> ConversionResult<UnifiedRequest> {
        let request: wire::ChatCompletionRequest = from_value(native)?;

        let messages = request
            .messages
            .into_iter()
            .map(decode_message)
            .collect::<ConversionResult<Vec<_>>>()?;

        let tools = request.tools.map(|tools| {
            tools
                .into_iter()
                .map(|tool| UnifiedTool {
                    name: tool.function.name,
                    description: tool.function.description,
                    parameters: tool.function.parameters.unwrap_or_else(empty_schema),
                })
                .collect()
        });

        Ok(UnifiedRequest {
            model: request.model,
            messages,
            tools,
            tool_choice: request.tool_choice.map(decode_tool_choice).transpose()?,
            max_output_tokens: request.max_completion_tokens.or(request.max_tokens),
            temperature: request.temperature,
            top_p: request.top_p,
            stream: request.stream.unwrap_or(false),
            stop_sequences: request.stop.map(Vec::from),
            raw: raw_fields(self.protocol(), request.extra),
        })
    }

    fn to_native_request(&self, request: &UnifiedRequest, model: &str) -> ConversionResult<Value> {
        self.ensure_supported(request)?;

        let mut messages = Vec::with_capacity(request.messages.len());

        for message in &request.messages {
            encode_message(message, &mut messages)?;
        }

        let mut body = json!({
            "model": model,
            "messages": messages,
        });

        if let Some(tools) = &request.tools {
            let tools: Vec<_> = tools
                .iter()
                .map(|tool| wire::Tool {
                    kind: wire::function_type(),
                    function: wire::FunctionDefinition {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: Some(tool.parameters.clone()),
                    },
                })
                .collect();

            body["tools"] = to_value(&tools)?;
        }

        if let Some(choice) = &request.tool_choice {
            body["tool_choice"] = match choice {
                UnifiedToolChoice::Auto => json!("auto"),
                UnifiedToolChoice::None => json!("none"),
                UnifiedToolChoice::Required => json!("required"),
                UnifiedToolChoice::Tool(name) => json!({"type": "function", "function": {"name": name}}),
            };
        }

        if let Some(max_tokens) = request.max_output_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }

        if let Some(stop) = &request.stop_sequences {
            body["stop"] = json!(stop);
        }

        if request.stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }

        merge_raw(self.protocol(), &request.raw, &mut body);

        Ok(body)
    }

    fn to_canonical_response(&self, native: Value) -> ConversionResult<UnifiedResponse> {
        let completion: wire::ChatCompletion = from_value(native)?;

        let choices = completion
            .choices
            .into_iter()
            .map(|choice| {
                let mut content = Vec::new();

                if let Some(text) = choice.message.content.filter(|text| !text.is_empty()) {
                    content.push(UnifiedContent::text(text));
                }

                content.extend(choice.message.tool_calls.into_iter().flatten().map(decode_tool_call));

                let finish_reason = choice
                    .finish_reason
                    .map(|reason| map_finish_reason(Protocol::OpenAiChat, &reason, FINISH_REASONS))
                    .unwrap_or(UnifiedFinishReason::Stop);

                UnifiedChoice {
                    index: choice.index,
                    message: UnifiedMessage::new(UnifiedRole::Assistant, content),
                    finish_reason,
                }
            })
            .collect();

        let usage = completion.usage.unwrap_or_default();

        Ok(UnifiedResponse {
            id: completion.id,
            model: completion.model,
            created: completion.created,
            choices,
            usage: UnifiedUsage::new(usage.prompt_tokens, usage.completion_tokens),
            raw: raw_fields(self.protocol(), completion.extra),
        })
    }

    fn to_native_response(&self, response: &UnifiedResponse) -> ConversionResult<Value> {
        let choices = response
            .choices
            .iter()
            .map(|choice| {
                let (content, tool_calls) = encode_assistant_parts(&choice.message.content)?;

                // Content is null only for a pure tool call turn.
                let content = match (content, &tool_calls) {
                    (None, None) => Some(String::new()),
                    (content, _) => content,
                };

                Ok(wire::Choice {
                    index: choice.index,
                    message: wire::ResponseMessage {
                        role: "assistant".to_string(),
                        content,
                        tool_calls,
                    },
                    finish_reason: Some(finish_reason_name(choice.finish_reason).to_string()),
                })
            })
            .collect::<ConversionResult<Vec<_>>>()?;

        let completion = wire::ChatCompletion {
            id: response.id.clone(),
            object: "chat.completion".to_string(),
            created: response.created,
            model: response.model.clone(),
            choices,
            usage: Some(wire_usage(response.usage)),
            extra: Default::default(),
        };

        let mut body = to_value(&completion)?;
        merge_raw(self.protocol(), &response.raw, &mut body);

        Ok(body)
    }

    fn to_canonical_chunk(&self, native: Value, state: &mut StreamState) -> ConversionResult<Vec<UnifiedChunk>> {
        if let Some(error) = native.get("error") {
            return Ok(stream_error(self.protocol(), state, error));
        }

        let chunk: wire::ChatCompletionChunk = from_value(native)?;
        state.observe_envelope(chunk.id.as_deref(), chunk.model.as_deref());

        let mut chunks = Vec::new();

        for choice in chunk.choices.into_iter().filter(|choice| choice.index == 0) {
            if let Some(text) = choice.delta.content.filter(|text| !text.is_empty()) {
                chunks.push(state.chunk(UnifiedDelta::Text { text }));
            }

            for call in choice.delta.tool_calls.into_iter().flatten() {
                let (index, _) = state.tool_ordinal(call.index.to_string());
                let (name, arguments) = match call.function {
                    Some(function) => (function.name, function.arguments.unwrap_or_default()),
                    None => (None, String::new()),
                };

                chunks.push(state.chunk(UnifiedDelta::ToolCall {
                    index,
                    id: call.id,
                    name,
                    arguments,
                }));
            }

            if let Some(reason) = choice.finish_reason {
                state.finish_reason = Some(map_finish_reason(self.protocol(), &reason, FINISH_REASONS));
            }
        }

        if let Some(usage) = chunk.usage {
            state.usage = Some(UnifiedUsage::new(usage.prompt_tokens, usage.completion_tokens));
        }

        // Usage arrives after the finish reason when requested, so the terminal
        // chunk waits for both or for the end of the stream.
        if state.finish_reason.is_some() && state.usage.is_some() {
            chunks.extend(state.terminal_chunk());
        }

        Ok(chunks)
    }

    fn to_native_chunk(&self, chunk: &UnifiedChunk, state: &mut StreamState) -> ConversionResult<Vec<Value>> {
        state.observe_envelope(Some(&chunk.id), Some(&chunk.model));

        let mut events = Vec::with_capacity(1);

        if let Some(delta) = &chunk.delta {
            let mut delta = match delta {
                UnifiedDelta::Text { text } => json!({"content": text}),
                UnifiedDelta::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    let mut call = json!({"index": index, "function": {"arguments": arguments}});

                    if let Some(id) = id {
                        call["id"] = json!(id);
                        call["type"] = json!("function");
                    }

                    if let Some(name) = name {
                        call["function"]["name"] = json!(name);
                    }

                    json!({"tool_calls": [call]})
                }
                UnifiedDelta::Image { .. } => return Err(ConversionError::unsupported("assistant image", self.protocol())),
            };

            if !state.started {
                delta["role"] = json!("assistant");
                state.started = true;
            }

            events.push(chunk_envelope(state, delta, Value::Null, None));
        }

        if let Some(reason) = chunk.finish_reason {
            let delta = if state.started {
                json!({})
            } else {
                state.started = true;
                json!({"role": "assistant"})
            };

            let usage = chunk.usage.map(wire_usage);
            events.push(chunk_envelope(state, delta, json!(finish_reason_name(reason)), usage));
        }

        Ok(events)
    }

    fn error_body(&self, error: &LlmError) -> Value {
        json!({
            "error": {
                "message": error.client_message(),
                "type": error.error_type(),
                "code": error.status_code().as_u16(),
            }
        })
    }

    fn stream_terminator(&self) -> Option<&'static str> {
        Some("[DONE]")
    }
}

fn chunk_envelope(state: &StreamState, delta: Value, finish_reason: Value, usage: Option<wire::Usage>) -> Value {
    let mut event = json!({
        "id": state.id,
        "object": "chat.completion.chunk",
        "created": state.created,
        "model": state.model,
        "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
    });

    if let Some(usage) = usage {
        event["usage"] = json!({
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens,
        });
    }

    event
}

fn finish_reason_name(reason: UnifiedFinishReason) -> &'static str {
    match reason {
        UnifiedFinishReason::Stop => "stop",
        UnifiedFinishReason::Length => "length",
        UnifiedFinishReason::ToolCalls => "tool_calls",
        UnifiedFinishReason::ContentFilter => "content_filter",
        // No native equivalent; callers see a normal stop and the error body, if any.
        UnifiedFinishReason::Error => "stop",
    }
}

fn wire_usage(usage: UnifiedUsage) -> wire::Usage {
    wire::Usage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens(),
    }
}

fn empty_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

fn decode_role(role: &str) -> ConversionResult<UnifiedRole> {
    match role {
        "system" | "developer" => Ok(UnifiedRole::System),
        "user" => Ok(UnifiedRole::User),
        "assistant" => Ok(UnifiedRole::Assistant),
        "tool" => Ok(UnifiedRole::Tool),
        other => Err(ConversionError::new(format!("unsupported message role '{other}'"))),
    }
}

fn decode_message(message: wire::ChatMessage) -> ConversionResult<UnifiedMessage> {
    let role = decode_role(&message.role)?;

    if role == UnifiedRole::Tool {
        let tool_call_id = message.tool_call_id.ok_or_else(|| ConversionError::missing("tool_call_id"))?;
        let output = message.content.map(content_text).unwrap_or_default();

        return Ok(UnifiedMessage::new(
            role,
            vec![UnifiedContent::ToolResult {
                tool_call_id,
                output,
                is_error: false,
            }],
        ));
    }

    let has_tool_calls = message.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty());

    let mut content = match message.content {
        None => Vec::new(),
        Some(wire::MessageContent::Text(text)) if text.is_empty() && has_tool_calls => Vec::new(),
        Some(wire::MessageContent::Text(text)) => vec![UnifiedContent::text(text)],
        Some(wire::MessageContent::Parts(parts)) => parts.into_iter().map(decode_part).collect(),
    };

    if has_tool_calls && role != UnifiedRole::Assistant {
        return Err(ConversionError::new("only assistant messages may carry tool_calls"));
    }

    content.extend(message.tool_calls.into_iter().flatten().map(decode_tool_call));

    Ok(UnifiedMessage::new(role, content))
}

fn decode_part(part: wire::ContentPart) -> UnifiedContent {
    match part {
        wire::ContentPart::Text { text } => UnifiedContent::text(text),
        wire::ContentPart::ImageUrl { image_url } => {
            let (source, mime_type) = UnifiedImageSource::from_data_url(&image_url.url);
            UnifiedContent::image(source, mime_type.as_deref())
        }
    }
}

fn decode_tool_call(call: wire::ToolCall) -> UnifiedContent {
    UnifiedContent::ToolCall {
        id: call.id,
        name: call.function.name,
        arguments: call.function.arguments,
    }
}

fn decode_tool_choice(choice: Value) -> ConversionResult<UnifiedToolChoice> {
    match &choice {
        Value::String(mode) => match mode.as_str() {
            "auto" => Ok(UnifiedToolChoice::Auto),
            "none" => Ok(UnifiedToolChoice::None),
            "required" => Ok(UnifiedToolChoice::Required),
            other => Err(ConversionError::new(format!("unsupported tool_choice '{other}'"))),
        },
        Value::Object(_) => choice
            .pointer("/function/name")
            .and_then(Value::as_str)
            .map(|name| UnifiedToolChoice::Tool(name.to_string()))
            .ok_or_else(|| ConversionError::missing("tool_choice.function.name")),
        _ => Err(ConversionError::new("tool_choice must be a string or an object")),
    }
}

fn content_text(content: wire::MessageContent) -> String {
    match content {
        wire::MessageContent::Text(text) => text,
        wire::MessageContent::Parts(parts) => parts
            .into_iter()
            .filter_map(|part| match part {
                wire::ContentPart::Text { text } => Some(text),
                wire::ContentPart::ImageUrl { .. } => None,
            })
            .collect(),
    }
}

/// Text and tool calls of an assistant message. Text parts are concatenated.
fn encode_assistant_parts(content: &[UnifiedContent]) -> ConversionResult<(Option<String>, Option<Vec<wire::ToolCall>>)> {
    let mut text: Option<String> = None;
    let mut tool_calls = Vec::new();

    for part in content {
        match part {
            UnifiedContent::Text { text: part } => text.get_or_insert_with(String::new).push_str(part),
            UnifiedContent::ToolCall { id, name, arguments } => tool_calls.push(wire::ToolCall {
                id: id.clone(),
                kind: wire::function_type(),
                function: wire::FunctionCall {
                    name: name.clone(),
                    arguments: arguments.clone(),
                },
            }),
            UnifiedContent::Image { .. } => {
                return Err(ConversionError::unsupported("assistant image", Protocol::OpenAiChat));
            }
            UnifiedContent::ToolResult { .. } => {
                return Err(ConversionError::new("tool results must be sent in tool messages"));
            }
        }
    }

    Ok((text, Some(tool_calls).filter(|calls| !calls.is_empty())))
}

fn encode_message(message: &UnifiedMessage, out: &mut Vec<Value>) -> ConversionResult<()> {
    match message.role {
        UnifiedRole::System => out.push(json!({"role": "system", "content": message.joined_text()})),
        UnifiedRole::Assistant => {
            let (content, tool_calls) = encode_assistant_parts(&message.content)?;
            let mut encoded = json!({"role": "assistant", "content": content});

            if let Some(tool_calls) = tool_calls {
                encoded["tool_calls"] = to_value(&tool_calls)?;
            }

            out.push(encoded);
        }
        UnifiedRole::User => {
            let content = match message.content.as_slice() {
                [UnifiedContent::Text { text }] => wire::MessageContent::Text(text.clone()),
                parts => wire::MessageContent::Parts(
                    parts
                        .iter()
                        .map(|part| match part {
                            UnifiedContent::Text { text } => Ok(wire::ContentPart::Text { text: text.clone() }),
                            UnifiedContent::Image { source, mime_type } => Ok(wire::ContentPart::ImageUrl {
                                image_url: wire::ImageUrl {
                                    url: source.to_data_url(mime_type),
                                    detail: None,
                                },
                            }),
                            _ => Err(ConversionError::new("user messages may only hold text and images")),
                        })
                        .collect::<ConversionResult<_>>()?,
                ),
            };

            out.push(json!({"role": "user", "content": to_value(&content)?}));
        }
        UnifiedRole::Tool => {
            for part in &message.content {
                let UnifiedContent::ToolResult {
                    tool_call_id, output, ..
                } = part
                else {
                    return Err(ConversionError::new("tool messages may only hold tool results"));
                };

                out.push(json!({"role": "tool", "tool_call_id": tool_call_id, "content": output}));
            }
        }
    }

    Ok(())
}
