//! Google Gemini `generateContent` and `streamGenerateContent`.

mod wire;

use serde_json::{Map, Value, json};

use crate::{
    converter::{
        Converter, PendingToolCall, Protocol, StreamState, arguments_text, from_value, map_finish_reason, merge_raw,
        parse_arguments, raw_fields, response_raw, stream_error, to_value, unrepresented,
    },
    error::{ConversionError, ConversionResult, LlmError},
    messages::unified::{
        UnifiedChoice, UnifiedChunk, UnifiedContent, UnifiedDelta, UnifiedFinishReason, UnifiedImageSource,
        UnifiedMessage, UnifiedRequest, UnifiedResponse, UnifiedRole, UnifiedTool, UnifiedToolChoice, UnifiedUsage,
        normalize_mime_type,
    },
};

const FINISH_REASONS: &[(&str, UnifiedFinishReason)] = &[
    ("STOP", UnifiedFinishReason::Stop),
    ("MAX_TOKENS", UnifiedFinishReason::Length),
    ("SAFETY", UnifiedFinishReason::ContentFilter),
    ("RECITATION", UnifiedFinishReason::ContentFilter),
    ("BLOCKLIST", UnifiedFinishReason::ContentFilter),
    ("PROHIBITED_CONTENT", UnifiedFinishReason::ContentFilter),
    ("SPII", UnifiedFinishReason::ContentFilter),
];

/// Raw key for built-in tools (`googleSearch`, ...) that have no unified form.
const BUILTIN_TOOLS: &str = "tools";
/// Raw key for generation settings with no unified counterpart (`topK`, `thinkingConfig`, ...).
const GENERATION_CONFIG: &str = "generationConfig";

/// Converter for the Gemini API.
///
/// Gemini carries the model in the URL. Decoding expects the HTTP layer to
/// inject it as a top-level `model` field, and encoding emits one for the
/// transport to strip.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiConverter;

impl Converter for GeminiConverter {
    fn protocol(&self) -> Protocol {
        Protocol::Gemini
    }

    fn to_canonical_request(&self, native: Value) -> ConversionResult<UnifiedRequest> {
        let request: wire::GenerateContentRequest = from_value(native)?;
        let model = request.model.ok_or_else(|| ConversionError::missing("model"))?;

        let mut messages = Vec::with_capacity(request.contents.len() + 1);

        if let Some(system) = request.system_instruction {
            for part in system.parts {
                let text = part
                    .text
                    .ok_or_else(|| ConversionError::new("systemInstruction may only hold text parts"))?;

                messages.push(UnifiedMessage::text(UnifiedRole::System, text));
            }
        }

        let single_turn = request.contents.len() == 1;
        let mut calls = CallIds::default();

        for content in request.contents {
            let role = match content.role.as_deref() {
                Some("user") => UnifiedRole::User,
                Some("model") => UnifiedRole::Assistant,
                None if single_turn => UnifiedRole::User,
                None => return Err(ConversionError::missing("contents[].role")),
                Some(other) => return Err(ConversionError::new(format!("unsupported content role '{other}'"))),
            };

            decode_turn(role, content.parts, &mut calls, &mut messages)?;
        }

        let mut extra = request.extra;
        let mut tools = Vec::new();
        let mut builtin_tools = Vec::new();

        for tool in request.tools.into_iter().flatten() {
            if !tool.extra.is_empty() {
                builtin_tools.push(Value::Object(tool.extra));
            }

            tools.extend(
                tool.function_declarations
                    .into_iter()
                    .flatten()
                    .map(|declaration| UnifiedTool {
                        name: declaration.name,
                        description: declaration.description,
                        parameters: declaration.parameters.unwrap_or_else(|| json!({"type": "object"})),
                    }),
            );
        }

        if !builtin_tools.is_empty() {
            extra.insert(BUILTIN_TOOLS.to_string(), Value::Array(builtin_tools));
        }

        let tool_choice = request
            .tool_config
            .and_then(|config| config.function_calling_config)
            .map(|config| match config.mode {
                wire::FunctionCallingMode::Auto | wire::FunctionCallingMode::Validated => UnifiedToolChoice::Auto,
                wire::FunctionCallingMode::None => UnifiedToolChoice::None,
                wire::FunctionCallingMode::Any => match config.allowed_function_names.as_deref() {
                    Some([name]) => UnifiedToolChoice::Tool(name.clone()),
                    _ => UnifiedToolChoice::Required,
                },
            });

        let generation = request.generation_config.unwrap_or_default();

        if !generation.extra.is_empty() {
            extra.insert(GENERATION_CONFIG.to_string(), Value::Object(generation.extra));
        }

        Ok(UnifiedRequest {
            model,
            messages,
            tools: Some(tools).filter(|tools| !tools.is_empty()),
            tool_choice,
            max_output_tokens: generation.max_output_tokens,
            temperature: generation.temperature,
            top_p: generation.top_p,
            stream: false,
            stop_sequences: generation.stop_sequences,
            raw: raw_fields(self.protocol(), extra),
        })
    }

    fn to_native_request(&self, request: &UnifiedRequest, model: &str) -> ConversionResult<Value> {
        self.ensure_supported(request)?;

        let mut system_parts = Vec::new();
        let mut contents: Vec<wire::Content> = Vec::with_capacity(request.messages.len());

        for message in &request.messages {
            match message.role {
                UnifiedRole::System => system_parts.push(wire::Part {
                    text: Some(message.joined_text()),
                    ..Default::default()
                }),
                UnifiedRole::User | UnifiedRole::Assistant => {
                    let role = if message.role == UnifiedRole::User { "user" } else { "model" };

                    let parts = message
                        .content
                        .iter()
                        .map(|part| encode_part(part, request))
                        .collect::<ConversionResult<Vec<_>>>()?;

                    contents.push(wire::Content {
                        role: Some(role.to_string()),
                        parts,
                    });
                }
                UnifiedRole::Tool => {
                    let parts = message
                        .content
                        .iter()
                        .map(|part| encode_part(part, request))
                        .collect::<ConversionResult<Vec<_>>>()?;

                    // Consecutive tool results share one user turn.
                    match contents.last_mut() {
                        Some(last)
                            if last.role.as_deref() == Some("user")
                                && last.parts.iter().all(|part| part.function_response.is_some()) =>
                        {
                            last.parts.extend(parts)
                        }
                        _ => contents.push(wire::Content {
                            role: Some("user".to_string()),
                            parts,
                        }),
                    }
                }
            }
        }

        let mut body = json!({
            "model": model,
            "contents": to_value(&contents)?,
        });

        if !system_parts.is_empty() {
            body["systemInstruction"] = to_value(&wire::Content {
                role: None,
                parts: system_parts,
            })?;
        }

        let raw = request.raw.from_origin(self.protocol().as_ref());
        let builtin_tools = raw.and_then(|raw| raw.get(BUILTIN_TOOLS)).and_then(Value::as_array);

        if request.tools.is_some() || builtin_tools.is_some() {
            let mut tools = Vec::new();

            if let Some(declared) = &request.tools {
                let declarations: Vec<_> = declared
                    .iter()
                    .map(|tool| wire::FunctionDeclaration {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: Some(strip_unsupported_schema_fields(tool.parameters.clone())),
                    })
                    .collect();

                tools.push(json!({"functionDeclarations": to_value(&declarations)?}));
            }

            tools.extend(builtin_tools.into_iter().flatten().cloned());
            body["tools"] = Value::Array(tools);
        }

        if let Some(choice) = &request.tool_choice {
            let config = match choice {
                UnifiedToolChoice::Auto => wire::FunctionCallingConfig {
                    mode: wire::FunctionCallingMode::Auto,
                    allowed_function_names: None,
                },
                UnifiedToolChoice::None => wire::FunctionCallingConfig {
                    mode: wire::FunctionCallingMode::None,
                    allowed_function_names: None,
                },
                UnifiedToolChoice::Required => wire::FunctionCallingConfig {
                    mode: wire::FunctionCallingMode::Any,
                    allowed_function_names: None,
                },
                UnifiedToolChoice::Tool(name) => wire::FunctionCallingConfig {
                    mode: wire::FunctionCallingMode::Any,
                    allowed_function_names: Some(vec![name.clone()]),
                },
            };

            body["toolConfig"] = to_value(&wire::ToolConfig {
                function_calling_config: Some(config),
            })?;
        }

        let generation = wire::GenerationConfig {
            max_output_tokens: request.max_output_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop_sequences.clone(),
            extra: raw
                .and_then(|raw| raw.get(GENERATION_CONFIG))
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        };

        let generation = to_value(&generation)?;

        if generation.as_object().is_some_and(|config| !config.is_empty()) {
            body["generationConfig"] = generation;
        }

        merge_raw(self.protocol(), &request.raw, &mut body);

        Ok(body)
    }

    fn to_canonical_response(&self, native: Value) -> ConversionResult<UnifiedResponse> {
        let response: wire::GenerateContentResponse = from_value(native)?;
        let mut unrepresented_parts = Vec::new();

        let choices = response
            .candidates
            .into_iter()
            .map(|candidate| {
                let mut ordinal = 0;
                let mut content = Vec::with_capacity(candidate.content.parts.len());

                for part in candidate.content.parts {
                    if part.thought == Some(true) {
                        unrepresented_parts.push(to_value(&part)?);
                        continue;
                    }

                    content.push(decode_output_part(part, &mut ordinal)?);
                }

                let finish_reason = finish_reason(candidate.finish_reason.as_deref(), ordinal > 0);
                let message = UnifiedMessage::new(UnifiedRole::Assistant, content);

                Ok(UnifiedChoice {
                    index: candidate.index,
                    message,
                    finish_reason,
                })
            })
            .collect::<ConversionResult<Vec<_>>>()?;

        let usage = response.usage_metadata.unwrap_or_default();

        Ok(UnifiedResponse {
            id: response
                .response_id
                .unwrap_or_else(|| format!("gemini-{}", uuid::Uuid::new_v4().simple())),
            model: response.model_version.unwrap_or_default(),
            created: crate::converter::unix_now(),
            choices,
            usage: UnifiedUsage::new(usage.prompt_token_count, usage.candidates_token_count),
            raw: response_raw(self.protocol(), response.extra, unrepresented_parts),
        })
    }

    fn to_native_response(&self, response: &UnifiedResponse) -> ConversionResult<Value> {
        let mut candidates = response
            .choices
            .iter()
            .map(|choice| {
                let parts = choice
                    .message
                    .content
                    .iter()
                    .map(encode_output_part)
                    .collect::<ConversionResult<Vec<_>>>()?;

                Ok(wire::Candidate {
                    content: wire::Content {
                        role: Some("model".to_string()),
                        parts,
                    },
                    finish_reason: Some(finish_reason_name(choice.finish_reason).to_string()),
                    index: choice.index,
                })
            })
            .collect::<ConversionResult<Vec<_>>>()?;

        let thoughts = unrepresented(self.protocol(), &response.raw);

        if let Some(first) = candidates.first_mut()
            && !thoughts.is_empty()
        {
            let parts = thoughts
                .iter()
                .cloned()
                .map(crate::converter::from_value::<wire::Part>)
                .collect::<ConversionResult<Vec<_>>>()?;

            first.content.parts.splice(0..0, parts);
        }

        let body = wire::GenerateContentResponse {
            candidates,
            usage_metadata: Some(wire_usage(response.usage)),
            model_version: Some(response.model.clone()),
            response_id: Some(response.id.clone()),
            extra: Map::new(),
        };

        let mut body = to_value(&body)?;
        merge_raw(self.protocol(), &response.raw, &mut body);

        Ok(body)
    }

    fn to_canonical_chunk(&self, native: Value, state: &mut StreamState) -> ConversionResult<Vec<UnifiedChunk>> {
        if let Some(error) = native.get("error") {
            return Ok(stream_error(self.protocol(), state, error));
        }

        let event: wire::GenerateContentResponse = from_value(native)?;
        state.observe_envelope(event.response_id.as_deref(), event.model_version.as_deref());

        let mut chunks = Vec::new();

        if let Some(usage) = event.usage_metadata {
            state.usage = Some(UnifiedUsage::new(usage.prompt_token_count, usage.candidates_token_count));
        }

        let Some(candidate) = event.candidates.into_iter().find(|candidate| candidate.index == 0) else {
            return Ok(chunks);
        };

        for part in candidate.content.parts {
            if part.thought == Some(true) {
                log::debug!("Skipping Gemini thought part in stream");
                continue;
            }

            let delta = if let Some(text) = part.text {
                UnifiedDelta::Text { text }
            } else if let Some(call) = part.function_call {
                let index = state.new_tool_ordinal();

                UnifiedDelta::ToolCall {
                    index,
                    id: Some(call.id.unwrap_or_else(|| synthesized_call_id(&call.name, index))),
                    name: Some(call.name),
                    arguments: arguments_text(&call.args),
                }
            } else if let Some(blob) = part.inline_data {
                let source = UnifiedImageSource::Base64 { data: blob.data };
                let mime_type = normalize_mime_type(Some(blob.mime_type.as_str()), &source);

                UnifiedDelta::Image { source, mime_type }
            } else {
                return Err(ConversionError::new("unsupported part in Gemini stream"));
            };

            chunks.push(state.chunk(delta));
        }

        if let Some(reason) = candidate.finish_reason {
            state.finish_reason = Some(finish_reason(Some(&reason), state.saw_tool_call));
            chunks.extend(state.terminal_chunk());
        }

        Ok(chunks)
    }

    fn to_native_chunk(&self, chunk: &UnifiedChunk, state: &mut StreamState) -> ConversionResult<Vec<Value>> {
        state.observe_envelope(Some(&chunk.id), Some(&chunk.model));

        let mut parts = Vec::new();

        match &chunk.delta {
            Some(UnifiedDelta::ToolCall {
                index,
                id,
                name,
                arguments,
            }) => {
                // Gemini sends whole function calls; hold fragments until the call is complete.
                let pending = state.pending_tools.entry(*index).or_default();

                if let Some(id) = id {
                    pending.id.clone_from(id);
                }

                if let Some(name) = name {
                    pending.name.clone_from(name);
                }

                pending.arguments.push_str(arguments);
            }
            Some(UnifiedDelta::Text { text }) => {
                flush_pending_tools(state, &mut parts)?;
                parts.push(json!({"text": text}));
            }
            Some(UnifiedDelta::Image { source, mime_type }) => {
                flush_pending_tools(state, &mut parts)?;
                parts.push(to_value(&image_part(source, mime_type))?);
            }
            None => (),
        }

        let finish_reason = chunk.finish_reason.map(finish_reason_name);

        if finish_reason.is_some() {
            flush_pending_tools(state, &mut parts)?;
        }

        if parts.is_empty() && finish_reason.is_none() {
            return Ok(Vec::new());
        }

        let mut candidate = json!({
            "content": {"role": "model", "parts": parts},
            "index": 0,
        });

        if let Some(reason) = finish_reason {
            candidate["finishReason"] = json!(reason);
        }

        let mut event = json!({
            "candidates": [candidate],
            "modelVersion": state.model,
            "responseId": state.id,
        });

        if let Some(usage) = chunk.usage {
            event["usageMetadata"] = to_value(&wire_usage(usage))?;
        }

        Ok(vec![event])
    }

    fn error_body(&self, error: &LlmError) -> Value {
        let status = match error.status_code().as_u16() {
            400 => "INVALID_ARGUMENT",
            401 => "UNAUTHENTICATED",
            404 => "NOT_FOUND",
            408 => "DEADLINE_EXCEEDED",
            429 => "RESOURCE_EXHAUSTED",
            503 => "UNAVAILABLE",
            500 => "INTERNAL",
            _ => "UNKNOWN",
        };

        json!({
            "error": {
                "code": error.status_code().as_u16(),
                "message": error.client_message(),
                "status": status,
            }
        })
    }
}

/// Recursively removes JSON Schema fields the Gemini API rejects.
///
/// Key order is kept.
fn strip_unsupported_schema_fields(mut schema: Value) -> Value {
    let Some(object) = schema.as_object_mut() else {
        return schema;
    };

    for key in ["additionalProperties", "$schema", "default"] {
        object.shift_remove(key);
    }

    // Gemini only supports "enum" and "date-time" string formats.
    let is_string = object.get("type").and_then(Value::as_str) == Some("string");
    let format = object.get("format").and_then(Value::as_str);

    if is_string && format.is_some_and(|format| format != "enum" && format != "date-time") {
        object.shift_remove("format");
    }

    for key in ["properties", "$defs", "definitions"] {
        if let Some(Value::Object(schemas)) = object.get_mut(key) {
            for nested in schemas.values_mut() {
                *nested = strip_unsupported_schema_fields(nested.take());
            }
        }
    }

    for key in ["items", "not", "anyOf", "oneOf", "allOf"] {
        match object.get_mut(key) {
            Some(Value::Array(schemas)) => {
                for nested in schemas.iter_mut() {
                    *nested = strip_unsupported_schema_fields(nested.take());
                }
            }
            Some(nested) => *nested = strip_unsupported_schema_fields(nested.take()),
            None => (),
        }
    }

    schema
}

fn finish_reason(native: Option<&str>, has_tool_calls: bool) -> UnifiedFinishReason {
    match native.map(|reason| map_finish_reason(Protocol::Gemini, reason, FINISH_REASONS)) {
        Some(UnifiedFinishReason::Stop) | None if has_tool_calls => UnifiedFinishReason::ToolCalls,
        Some(reason) => reason,
        None => UnifiedFinishReason::Stop,
    }
}

fn finish_reason_name(reason: UnifiedFinishReason) -> &'static str {
    match reason {
        UnifiedFinishReason::Stop | UnifiedFinishReason::ToolCalls => "STOP",
        UnifiedFinishReason::Length => "MAX_TOKENS",
        UnifiedFinishReason::ContentFilter => "SAFETY",
        UnifiedFinishReason::Error => "OTHER",
    }
}

fn wire_usage(usage: UnifiedUsage) -> wire::UsageMetadata {
    wire::UsageMetadata {
        prompt_token_count: usage.prompt_tokens,
        candidates_token_count: usage.completion_tokens,
        total_token_count: usage.total_tokens(),
    }
}

fn synthesized_call_id(name: &str, ordinal: u32) -> String {
    format!("{name}-{ordinal}")
}

/// Pairs function calls and responses that arrive without ids.
#[derive(Debug, Default)]
struct CallIds {
    /// `(id, name, answered)` in request order.
    calls: Vec<(String, String, bool)>,
}

impl CallIds {
    fn call(&mut self, id: Option<String>, name: &str) -> String {
        let ordinal = u32::try_from(self.calls.len()).unwrap_or(u32::MAX);
        let id = id.unwrap_or_else(|| synthesized_call_id(name, ordinal));

        self.calls.push((id.clone(), name.to_string(), false));
        id
    }

    fn response(&mut self, id: Option<String>, name: &str) -> String {
        let slot = match &id {
            Some(id) => self.calls.iter_mut().find(|(call_id, _, _)| call_id == id),
            None => self
                .calls
                .iter_mut()
                .find(|(_, call_name, answered)| call_name == name && !answered),
        };

        match (slot, id) {
            (Some(slot), _) => {
                slot.2 = true;
                slot.0.clone()
            }
            (None, Some(id)) => id,
            (None, None) => {
                let ordinal = u32::try_from(self.calls.len()).unwrap_or(u32::MAX);
                synthesized_call_id(name, ordinal)
            }
        }
    }
}

fn decode_turn(
    role: UnifiedRole,
    parts: Vec<wire::Part>,
    calls: &mut CallIds,
    messages: &mut Vec<UnifiedMessage>,
) -> ConversionResult<()> {
    let mut content = Vec::with_capacity(parts.len());

    for part in parts {
        if part.thought == Some(true) {
            log::debug!("Dropping Gemini thought part from request history");
            continue;
        }

        if let Some(response) = part.function_response {
            if role != UnifiedRole::User {
                return Err(ConversionError::new("functionResponse is only allowed in user turns"));
            }

            if !content.is_empty() {
                messages.push(UnifiedMessage::new(role, std::mem::take(&mut content)));
            }

            let tool_call_id = calls.response(response.id, &response.name);
            let output = match response.response {
                Value::Object(mut object) if object.len() == 1 && object.get("content").is_some_and(Value::is_string) => {
                    object.remove("content").map(|content| output_string(&content)).unwrap_or_default()
                }
                other => crate::converter::output_text(&other),
            };

            messages.push(UnifiedMessage::new(
                UnifiedRole::Tool,
                vec![UnifiedContent::ToolResult {
                    tool_call_id,
                    output,
                    is_error: false,
                }],
            ));

            continue;
        }

        if let Some(call) = part.function_call {
            if role != UnifiedRole::Assistant {
                return Err(ConversionError::new("functionCall is only allowed in model turns"));
            }

            content.push(UnifiedContent::ToolCall {
                id: calls.call(call.id, &call.name),
                name: call.name,
                arguments: arguments_text(&call.args),
            });

            continue;
        }

        content.push(decode_media_part(part)?);
    }

    if !content.is_empty() {
        messages.push(UnifiedMessage::new(role, content));
    }

    Ok(())
}

fn output_string(value: &Value) -> String {
    value.as_str().map(str::to_string).unwrap_or_default()
}

/// Text and image parts.
fn decode_media_part(part: wire::Part) -> ConversionResult<UnifiedContent> {
    if let Some(text) = part.text {
        return Ok(UnifiedContent::text(text));
    }

    if let Some(blob) = part.inline_data {
        return Ok(UnifiedContent::image(
            UnifiedImageSource::Base64 { data: blob.data },
            Some(blob.mime_type.as_str()),
        ));
    }

    if let Some(file) = part.file_data {
        return Ok(UnifiedContent::image(
            UnifiedImageSource::Url { url: file.file_uri },
            file.mime_type.as_deref(),
        ));
    }

    Err(ConversionError::new("part has no supported data field"))
}

fn decode_output_part(part: wire::Part, ordinal: &mut u32) -> ConversionResult<UnifiedContent> {
    match part.function_call {
        Some(call) => {
            let id = call.id.unwrap_or_else(|| synthesized_call_id(&call.name, *ordinal));
            *ordinal += 1;

            Ok(UnifiedContent::ToolCall {
                id,
                name: call.name,
                arguments: arguments_text(&call.args),
            })
        }
        None => decode_media_part(part),
    }
}

fn image_part(source: &UnifiedImageSource, mime_type: &str) -> wire::Part {
    match source {
        UnifiedImageSource::Base64 { data } => wire::Part {
            inline_data: Some(wire::Blob {
                mime_type: mime_type.to_string(),
                data: data.clone(),
            }),
            ..Default::default()
        },
        UnifiedImageSource::Url { url } => wire::Part {
            file_data: Some(wire::FileData {
                mime_type: Some(mime_type.to_string()),
                file_uri: url.clone(),
            }),
            ..Default::default()
        },
    }
}

fn encode_output_part(part: &UnifiedContent) -> ConversionResult<wire::Part> {
    match part {
        UnifiedContent::Text { text } => Ok(wire::Part {
            text: Some(text.clone()),
            ..Default::default()
        }),
        UnifiedContent::Image { source, mime_type } => Ok(image_part(source, mime_type)),
        UnifiedContent::ToolCall { id, name, arguments } => Ok(wire::Part {
            function_call: Some(wire::FunctionCall {
                id: Some(id.clone()),
                name: name.clone(),
                args: parse_arguments(arguments)?,
            }),
            ..Default::default()
        }),
        UnifiedContent::ToolResult { .. } => Err(ConversionError::new("tool results cannot appear in model output")),
    }
}

fn encode_part(part: &UnifiedContent, request: &UnifiedRequest) -> ConversionResult<wire::Part> {
    match part {
        UnifiedContent::ToolResult {
            tool_call_id, output, ..
        } => {
            let name = request
                .tool_name_for(tool_call_id)
                .ok_or_else(|| ConversionError::new(format!("no tool call with id '{tool_call_id}' precedes its result")))?;

            Ok(wire::Part {
                function_response: Some(wire::FunctionResponse {
                    id: Some(tool_call_id.clone()),
                    name: name.to_string(),
                    response: json!({"content": output}),
                }),
                ..Default::default()
            })
        }
        other => encode_output_part(other),
    }
}

fn flush_pending_tools(state: &mut StreamState, parts: &mut Vec<Value>) -> ConversionResult<()> {
    for (_, PendingToolCall { id, name, arguments }) in state.pending_tools.drain(..) {
        parts.push(json!({
            "functionCall": {"id": id, "name": name, "args": parse_arguments(&arguments)?}
        }));
    }

    Ok(())
}
