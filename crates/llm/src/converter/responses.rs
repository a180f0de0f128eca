//! OpenAI Responses (`/v1/responses`).

mod wire;

use serde_json::{Value, json};

use crate::{
    converter::{
        BlockKind, Converter, PendingToolCall, Protocol, StreamState, from_value, merge_raw, output_text, raw_fields,
        response_raw, stream_error, to_value, unix_now, unrepresented,
    },
    error::{ConversionError, ConversionResult, LlmError},
    messages::unified::{
        UnifiedChoice, UnifiedChunk, UnifiedContent, UnifiedDelta, UnifiedFinishReason, UnifiedImageSource,
        UnifiedMessage, UnifiedRequest, UnifiedResponse, UnifiedRole, UnifiedTool, UnifiedToolChoice, UnifiedUsage,
    },
};

/// Raw key for built-in tools (`web_search`, `file_search`, ...).
const BUILTIN_TOOLS: &str = "tools";

/// Converter for the OpenAI Responses API.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponsesConverter;

impl Converter for ResponsesConverter {
    fn protocol(&self) -> Protocol {
        Protocol::OpenAiResponses
    }

    fn to_canonical_request(&self, native: Value) -> ConversionResult<UnifiedRequest> {
        let request: wire::CreateResponseRequest = from_value(native)?;
        let mut messages = Vec::new();

        if let Some(instructions) = request.instructions {
            messages.push(UnifiedMessage::text(UnifiedRole::System, instructions));
        }

        match request.input {
            wire::Input::Text(text) => messages.push(UnifiedMessage::text(UnifiedRole::User, text)),
            wire::Input::Items(items) => {
                for item in items {
                    decode_item(item, &mut messages)?;
                }
            }
        }

        let mut extra = request.extra;
        let mut tools = Vec::new();
        let mut builtin = Vec::new();

        for tool in request.tools.into_iter().flatten() {
            if tool.get("type").and_then(Value::as_str) == Some("function") {
                let tool: wire::FunctionTool = from_value(tool)?;

                tools.push(UnifiedTool {
                    name: tool.name,
                    description: tool.description,
                    parameters: tool.parameters.unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                });
            } else {
                builtin.push(tool);
            }
        }

        if !builtin.is_empty() {
            extra.insert(BUILTIN_TOOLS.to_string(), Value::Array(builtin));
        }

        Ok(UnifiedRequest {
            model: request.model,
            messages,
            tools: (!tools.is_empty()).then_some(tools),
            tool_choice: request.tool_choice.map(decode_tool_choice).transpose()?,
            max_output_tokens: request.max_output_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stream: request.stream.unwrap_or(false),
            stop_sequences: None,
            raw: raw_fields(self.protocol(), extra),
        })
    }

    fn to_native_request(&self, request: &UnifiedRequest, model: &str) -> ConversionResult<Value> {
        self.ensure_supported(request)?;

        let mut messages = request.messages.iter().peekable();
        let instructions = messages
            .next_if(|message| message.role == UnifiedRole::System)
            .map(UnifiedMessage::joined_text);

        let mut input = Vec::with_capacity(request.messages.len());

        for message in messages {
            encode_message(message, &mut input)?;
        }

        let mut body = json!({
            "model": model,
            "input": input,
        });

        if let Some(instructions) = instructions {
            body["instructions"] = json!(instructions);
        }

        let builtin_tools = request
            .raw
            .from_origin(self.protocol().as_ref())
            .and_then(|raw| raw.get(BUILTIN_TOOLS))
            .and_then(Value::as_array);

        if request.tools.is_some() || builtin_tools.is_some() {
            let mut tools = Vec::new();

            for tool in request.tools.iter().flatten() {
                tools.push(to_value(&wire::FunctionTool {
                    kind: "function".to_string(),
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: Some(tool.parameters.clone()),
                })?);
            }

            tools.extend(builtin_tools.into_iter().flatten().cloned());
            body["tools"] = Value::Array(tools);
        }

        if let Some(choice) = &request.tool_choice {
            body["tool_choice"] = match choice {
                UnifiedToolChoice::Auto => json!("auto"),
                UnifiedToolChoice::None => json!("none"),
                UnifiedToolChoice::Required => json!("required"),
                UnifiedToolChoice::Tool(name) => json!({"type": "function", "name": name}),
            };
        }

        if let Some(max) = request.max_output_tokens {
            body["max_output_tokens"] = json!(max);
        }

        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }

        if request.stop_sequences.is_some() {
            log::debug!("Responses API has no stop sequences, dropping them");
        }

        if request.stream {
            body["stream"] = json!(true);
        }

        merge_raw(self.protocol(), &request.raw, &mut body);

        Ok(body)
    }

    fn to_canonical_response(&self, native: Value) -> ConversionResult<UnifiedResponse> {
        let response: wire::ResponseObject = from_value(native)?;

        let mut content = Vec::new();
        let mut unknown = Vec::new();

        for item in response.output {
            match item {
                wire::OutputItem::Message { content: parts } => {
                    for part in parts {
                        match part {
                            wire::OutputContent::OutputText { text } => content.push(UnifiedContent::text(text)),
                            wire::OutputContent::Refusal { refusal } => content.push(UnifiedContent::text(refusal)),
                            wire::OutputContent::Unknown(part) => {
                                log::debug!("Skipping unknown Responses message content: {part}");
                            }
                        }
                    }
                }
                wire::OutputItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                } => content.push(UnifiedContent::ToolCall {
                    id: call_id,
                    name,
                    arguments,
                }),
                wire::OutputItem::Unknown(item) => unknown.push(item),
            }
        }

        let has_tool_calls = content
            .iter()
            .any(|part| matches!(part, UnifiedContent::ToolCall { .. }));

        let finish_reason = finish_reason(
            response.status.as_deref(),
            response.incomplete_details.as_ref(),
            has_tool_calls,
        );

        let usage = response.usage.unwrap_or_default();

        Ok(UnifiedResponse {
            id: response.id,
            model: response.model,
            created: response.created_at.unwrap_or_else(unix_now),
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

        let mut output: Vec<Value> = unrepresented(self.protocol(), &response.raw).to_vec();
        output.extend(encode_output(&response.id, &choice.message.content)?);

        let mut body = response_object(
            &response.id,
            &response.model,
            response.created,
            choice.finish_reason,
            output,
            response.usage,
        );

        merge_raw(self.protocol(), &response.raw, &mut body);

        Ok(body)
    }

    fn to_canonical_chunk(&self, native: Value, state: &mut StreamState) -> ConversionResult<Vec<UnifiedChunk>> {
        let event: wire::StreamEvent = from_value(native)?;
        let mut chunks = Vec::new();

        match event {
            wire::StreamEvent::Created { response } => {
                state.observe_envelope(Some(&response.id), response.model.as_deref());
            }
            wire::StreamEvent::OutputItemAdded { output_index, item } => {
                if item.get("type").and_then(Value::as_str) == Some("function_call") {
                    let (ordinal, _) = state.tool_ordinal(output_index.to_string());
                    let field = |name: &str| item.get(name).and_then(Value::as_str).map(str::to_string);
                    let arguments = field("arguments").unwrap_or_default();

                    state.pending_tools.insert(
                        ordinal,
                        PendingToolCall {
                            arguments: arguments.clone(),
                            ..Default::default()
                        },
                    );

                    chunks.push(state.chunk(UnifiedDelta::ToolCall {
                        index: ordinal,
                        id: field("call_id"),
                        name: field("name"),
                        arguments,
                    }));
                }
            }
            wire::StreamEvent::OutputTextDelta { delta } => {
                chunks.push(state.chunk(UnifiedDelta::Text { text: delta }));
            }
            wire::StreamEvent::FunctionCallArgumentsDelta { output_index, delta } => {
                let ordinal = state
                    .known_tool_ordinal(&output_index.to_string())
                    .ok_or_else(|| ConversionError::new(format!("arguments delta for unknown output {output_index}")))?;

                if let Some(pending) = state.pending_tools.get_mut(&ordinal) {
                    pending.arguments.push_str(&delta);
                }

                chunks.push(state.chunk(UnifiedDelta::ToolCall {
                    index: ordinal,
                    id: None,
                    name: None,
                    arguments: delta,
                }));
            }
            wire::StreamEvent::OutputItemDone { output_index, item } => {
                // Arguments that only arrive with the finished item.
                if let Some(ordinal) = state.known_tool_ordinal(&output_index.to_string())
                    && let Some(pending) = state.pending_tools.shift_remove(&ordinal)
                    && pending.arguments.is_empty()
                    && let Some(arguments) = item.get("arguments").and_then(Value::as_str)
                    && !arguments.is_empty()
                {
                    chunks.push(state.chunk(UnifiedDelta::ToolCall {
                        index: ordinal,
                        id: None,
                        name: None,
                        arguments: arguments.to_string(),
                    }));
                }
            }
            wire::StreamEvent::Finished { response } => {
                state.observe_envelope(Some(&response.id), response.model.as_deref());
                state.finish_reason = Some(finish_reason(
                    response.status.as_deref(),
                    response.incomplete_details.as_ref(),
                    state.saw_tool_call,
                ));

                if let Some(usage) = response.usage {
                    state.usage = Some(UnifiedUsage::new(usage.input_tokens, usage.output_tokens));
                }

                chunks.extend(state.terminal_chunk());
            }
            wire::StreamEvent::Error { detail } => {
                chunks.extend(stream_error(self.protocol(), state, &Value::Object(detail)));
            }
            wire::StreamEvent::Other(event) => {
                log::debug!(
                    "Skipping Responses stream event {}",
                    event.get("type").and_then(Value::as_str).unwrap_or("<untyped>")
                );
            }
        }

        Ok(chunks)
    }

    fn to_native_chunk(&self, chunk: &UnifiedChunk, state: &mut StreamState) -> ConversionResult<Vec<Value>> {
        state.observe_envelope(Some(&chunk.id), Some(&chunk.model));
        state.transcript.push(chunk);

        let mut events = Vec::new();

        if !state.started {
            state.started = true;

            events.push(json!({
                "type": "response.created",
                "response": {
                    "id": state.id,
                    "object": "response",
                    "created_at": state.created,
                    "model": state.model,
                    "status": "in_progress",
                    "output": [],
                },
            }));
        }

        match &chunk.delta {
            Some(UnifiedDelta::Text { text }) => {
                let index = match state.open_block {
                    Some(block) if block.kind == BlockKind::Text => block.index,
                    _ => {
                        close_text_item(state, &mut events);
                        let block = state.allocate_block(BlockKind::Text);

                        events.push(json!({
                            "type": "response.output_item.added",
                            "output_index": block.index,
                            "item": {
                                "type": "message",
                                "id": item_id("msg", &state.id, block.index),
                                "role": "assistant",
                                "status": "in_progress",
                                "content": [],
                            },
                        }));

                        block.index
                    }
                };

                events.push(json!({
                    "type": "response.output_text.delta",
                    "item_id": item_id("msg", &state.id, index),
                    "output_index": index,
                    "content_index": 0,
                    "delta": text,
                }));
            }
            Some(UnifiedDelta::ToolCall {
                index: ordinal,
                id,
                name,
                arguments,
            }) => {
                let index = match state.tool_block(*ordinal) {
                    Some(index) => index,
                    None => {
                        close_text_item(state, &mut events);
                        let block = state.allocate_block(BlockKind::Tool(*ordinal));

                        events.push(json!({
                            "type": "response.output_item.added",
                            "output_index": block.index,
                            "item": {
                                "type": "function_call",
                                "id": item_id("fc", &state.id, block.index),
                                "call_id": id.clone().unwrap_or_default(),
                                "name": name.clone().unwrap_or_default(),
                                "arguments": "",
                                "status": "in_progress",
                            },
                        }));

                        block.index
                    }
                };

                if !arguments.is_empty() {
                    events.push(json!({
                        "type": "response.function_call_arguments.delta",
                        "item_id": item_id("fc", &state.id, index),
                        "output_index": index,
                        "delta": arguments,
                    }));
                }
            }
            Some(UnifiedDelta::Image { .. }) => {
                return Err(ConversionError::unsupported("assistant image", self.protocol()));
            }
            None => (),
        }

        if let Some(reason) = chunk.finish_reason {
            close_text_item(state, &mut events);

            let output = encode_output(&state.id, state.transcript.content())?;

            for (index, item) in output.iter().enumerate() {
                if item["type"] == "function_call" {
                    events.push(json!({
                        "type": "response.output_item.done",
                        "output_index": index,
                        "item": item,
                    }));
                }
            }

            let response = response_object(
                &state.id,
                &state.model,
                state.created,
                reason,
                output,
                chunk.usage.unwrap_or_default(),
            );

            let kind = match response["status"].as_str() {
                Some("incomplete") => "response.incomplete",
                Some("failed") => "response.failed",
                _ => "response.completed",
            };

            events.push(json!({"type": kind, "response": response}));
        }

        Ok(events)
    }

    fn error_body(&self, error: &LlmError) -> Value {
        json!({
            "error": {
                "message": error.client_message(),
                "type": error.error_type(),
                "code": error.status_code().as_u16(),
            },
        })
    }

    fn error_event(&self, error: &LlmError) -> Value {
        json!({
            "type": "error",
            "code": error.error_type(),
            "message": error.client_message(),
            "param": null,
        })
    }
}

fn item_id(prefix: &str, response_id: &str, index: u32) -> String {
    let response_id = response_id.strip_prefix("resp_").unwrap_or(response_id);
    format!("{prefix}_{response_id}_{index}")
}

/// Emits `output_item.done` for the open text item, if any.
fn close_text_item(state: &mut StreamState, events: &mut Vec<Value>) {
    let Some(block) = state.close_block() else {
        return;
    };

    if block.kind != BlockKind::Text {
        return;
    }

    let text = state
        .transcript
        .content()
        .get(block.index as usize)
        .and_then(UnifiedContent::as_text)
        .unwrap_or_default();

    events.push(json!({
        "type": "response.output_item.done",
        "output_index": block.index,
        "item": message_item(&item_id("msg", &state.id, block.index), text),
    }));
}

fn message_item(id: &str, text: &str) -> Value {
    json!({
        "type": "message",
        "id": id,
        "role": "assistant",
        "status": "completed",
        "content": [{"type": "output_text", "text": text, "annotations": []}],
    })
}

/// Output items for assistant content; each part becomes one item.
fn encode_output(response_id: &str, content: &[UnifiedContent]) -> ConversionResult<Vec<Value>> {
    let mut output = Vec::with_capacity(content.len());

    for (index, part) in (0u32..).zip(content) {
        output.push(match part {
            UnifiedContent::Text { text } => message_item(&item_id("msg", response_id, index), text),
            UnifiedContent::ToolCall { id, name, arguments } => json!({
                "type": "function_call",
                "id": item_id("fc", response_id, index),
                "call_id": id,
                "name": name,
                "arguments": arguments,
                "status": "completed",
            }),
            UnifiedContent::Image { .. } => {
                return Err(ConversionError::unsupported("assistant image", Protocol::OpenAiResponses));
            }
            UnifiedContent::ToolResult { .. } => {
                return Err(ConversionError::new("tool results cannot appear in model output"));
            }
        });
    }

    Ok(output)
}

fn response_object(
    id: &str,
    model: &str,
    created: u64,
    reason: UnifiedFinishReason,
    output: Vec<Value>,
    usage: UnifiedUsage,
) -> Value {
    let mut response = json!({
        "id": id,
        "object": "response",
        "created_at": created,
        "model": model,
        "status": "completed",
        "output": output,
        "usage": {
            "input_tokens": usage.prompt_tokens,
            "output_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens(),
        },
    });

    match reason {
        UnifiedFinishReason::Stop | UnifiedFinishReason::ToolCalls => (),
        UnifiedFinishReason::Length => {
            response["status"] = json!("incomplete");
            response["incomplete_details"] = json!({"reason": "max_output_tokens"});
        }
        UnifiedFinishReason::ContentFilter => {
            response["status"] = json!("incomplete");
            response["incomplete_details"] = json!({"reason": "content_filter"});
        }
        UnifiedFinishReason::Error => {
            response["status"] = json!("failed");
            response["error"] = json!({"code": "server_error", "message": "The upstream response failed"});
        }
    }

    response
}

fn finish_reason(
    status: Option<&str>,
    incomplete: Option<&wire::IncompleteDetails>,
    has_tool_calls: bool,
) -> UnifiedFinishReason {
    match status {
        None | Some("completed") if has_tool_calls => UnifiedFinishReason::ToolCalls,
        None | Some("completed") => UnifiedFinishReason::Stop,
        Some("incomplete") => match incomplete.and_then(|details| details.reason.as_deref()) {
            Some("content_filter") => UnifiedFinishReason::ContentFilter,
            _ => UnifiedFinishReason::Length,
        },
        Some(other) => {
            if other != "failed" {
                log::warn!("Unknown openai-responses status '{other}', treating as error");
            }

            UnifiedFinishReason::Error
        }
    }
}

fn decode_tool_choice(choice: Value) -> ConversionResult<UnifiedToolChoice> {
    match &choice {
        Value::String(mode) => match mode.as_str() {
            "auto" => Ok(UnifiedToolChoice::Auto),
            "none" => Ok(UnifiedToolChoice::None),
            "required" => Ok(UnifiedToolChoice::Required),
            other => Err(ConversionError::new(format!("unknown tool_choice '{other}'"))),
        },
        Value::Object(object) => object
            .get("name")
            .and_then(Value::as_str)
            .map(|name| UnifiedToolChoice::Tool(name.to_string()))
            .ok_or_else(|| ConversionError::missing("tool_choice.name")),
        _ => Err(ConversionError::new("tool_choice must be a string or an object")),
    }
}

fn decode_role(role: &str) -> ConversionResult<UnifiedRole> {
    match role {
        "user" => Ok(UnifiedRole::User),
        "assistant" => Ok(UnifiedRole::Assistant),
        "system" | "developer" => Ok(UnifiedRole::System),
        other => Err(ConversionError::new(format!("unknown message role '{other}'"))),
    }
}

fn decode_item(mut item: Value, messages: &mut Vec<UnifiedMessage>) -> ConversionResult<()> {
    if let Value::Object(object) = &mut item
        && !object.contains_key("type")
        && object.contains_key("role")
    {
        object.insert("type".to_string(), json!("message"));
    }

    match from_value::<wire::InputItem>(item)? {
        wire::InputItem::Message { role, content } => {
            let role = decode_role(&role)?;

            let content = match content {
                wire::MessageContent::Text(text) => vec![UnifiedContent::text(text)],
                wire::MessageContent::Parts(parts) => parts
                    .into_iter()
                    .map(decode_part)
                    .collect::<ConversionResult<Vec<_>>>()?,
            };

            messages.push(UnifiedMessage::new(role, content));
        }
        wire::InputItem::FunctionCall {
            call_id,
            name,
            arguments,
        } => {
            let call = UnifiedContent::ToolCall {
                id: call_id,
                name,
                arguments,
            };

            // Calls following assistant output belong to the same assistant turn.
            match messages.last_mut() {
                Some(last) if last.role == UnifiedRole::Assistant => last.content.push(call),
                _ => messages.push(UnifiedMessage::new(UnifiedRole::Assistant, vec![call])),
            }
        }
        wire::InputItem::FunctionCallOutput { call_id, output } => {
            messages.push(UnifiedMessage::new(
                UnifiedRole::Tool,
                vec![UnifiedContent::ToolResult {
                    tool_call_id: call_id,
                    output: output_text(&output),
                    is_error: false,
                }],
            ));
        }
        wire::InputItem::Reasoning { .. } => log::debug!("Dropping reasoning item from request history"),
    }

    Ok(())
}

fn decode_part(part: wire::ContentPart) -> ConversionResult<UnifiedContent> {
    match part {
        wire::ContentPart::InputText { text } | wire::ContentPart::OutputText { text } => {
            Ok(UnifiedContent::text(text))
        }
        wire::ContentPart::Refusal { refusal } => Ok(UnifiedContent::text(refusal)),
        wire::ContentPart::InputImage { image_url, .. } => {
            let url = image_url.ok_or_else(|| ConversionError::missing("image_url"))?;

            Ok(if url.starts_with("data:") {
                let (source, mime_type) = UnifiedImageSource::from_data_url(&url);
                UnifiedContent::image(source, mime_type.as_deref())
            } else {
                UnifiedContent::image(UnifiedImageSource::Url { url }, None)
            })
        }
    }
}

fn encode_part(part: &UnifiedContent, role: UnifiedRole) -> ConversionResult<wire::ContentPart> {
    match part {
        UnifiedContent::Text { text } if role == UnifiedRole::Assistant => {
            Ok(wire::ContentPart::OutputText { text: text.clone() })
        }
        UnifiedContent::Text { text } => Ok(wire::ContentPart::InputText { text: text.clone() }),
        UnifiedContent::Image { source, mime_type } => Ok(wire::ContentPart::InputImage {
            image_url: Some(match source {
                UnifiedImageSource::Url { url } => url.clone(),
                UnifiedImageSource::Base64 { .. } => source.to_data_url(mime_type),
            }),
            detail: None,
        }),
        UnifiedContent::ToolCall { .. } | UnifiedContent::ToolResult { .. } => Err(ConversionError::new(format!(
            "{} content cannot appear inside a {role} message item",
            part.kind()
        ))),
    }
}

fn message_input(role: UnifiedRole, parts: Vec<wire::ContentPart>) -> ConversionResult<Value> {
    to_value(&wire::InputItem::Message {
        role: role.to_string(),
        content: wire::MessageContent::Parts(parts),
    })
}

/// Append the input items for one message, keeping the order of its parts.
fn encode_message(message: &UnifiedMessage, input: &mut Vec<Value>) -> ConversionResult<()> {
    let mut parts = Vec::new();

    for part in &message.content {
        match part {
            UnifiedContent::ToolCall { id, name, arguments } => {
                if !parts.is_empty() {
                    input.push(message_input(message.role, std::mem::take(&mut parts))?);
                }

                input.push(to_value(&wire::InputItem::FunctionCall {
                    call_id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                })?);
            }
            UnifiedContent::ToolResult {
                tool_call_id, output, ..
            } => {
                if !parts.is_empty() {
                    input.push(message_input(message.role, std::mem::take(&mut parts))?);
                }

                input.push(to_value(&wire::InputItem::FunctionCallOutput {
                    call_id: tool_call_id.clone(),
                    output: json!(output),
                })?);
            }
            other => parts.push(encode_part(other, message.role)?),
        }
    }

    if !parts.is_empty() {
        input.push(message_input(message.role, parts)?);
    }

    Ok(())
}
