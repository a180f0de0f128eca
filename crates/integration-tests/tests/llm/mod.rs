mod fallback;
mod health;
mod serving;
mod streaming;

use futures::StreamExt;
use llm::{DispatchContext, Dispatcher, NativeReply};
use serde_json::{Value, json};

fn chat_request(stream: bool) -> Value {
    json!({
        "model": "gpt-4",
        "messages": [
            {"role": "system", "content": "Be brief."},
            {"role": "user", "content": "Hi"}
        ],
        "stream": stream
    })
}

fn openai_completion(text: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "created": 1,
        "model": "gpt-4-0613",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
    })
}

fn openai_chunk(text: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "model": "gpt-4-0613",
        "choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]
    })
}

fn openai_finish_chunk() -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "model": "gpt-4-0613",
        "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
    })
}

fn claude_message(text: &str) -> Value {
    json!({
        "id": "msg_1",
        "type": "message",
        "role": "assistant",
        "model": "claude-3-opus",
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 3, "output_tokens": 2}
    })
}

fn gemini_response(text: &str) -> Value {
    json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": text}]},
            "finishReason": "STOP",
            "index": 0
        }],
        "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 1, "totalTokenCount": 5},
        "responseId": "gem-1"
    })
}

/// Dispatch a non-streaming request and return the native answer.
async fn complete(dispatcher: &Dispatcher, body: Value, context: &DispatchContext) -> llm::Result<Value> {
    match dispatcher.handle(body, context).await? {
        NativeReply::Complete(body) => Ok(body),
        NativeReply::Stream(_) => unreachable!("asked for a complete reply"),
    }
}

/// Dispatch a streaming request and collect every native event.
async fn stream(dispatcher: &Dispatcher, body: Value, context: &DispatchContext) -> llm::Result<Vec<Value>> {
    match dispatcher.handle(body, context).await? {
        NativeReply::Stream(events) => Ok(events.collect().await),
        NativeReply::Complete(_) => unreachable!("asked for a stream"),
    }
}

/// Concatenated `delta.content` of OpenAI chunks.
fn streamed_text(events: &[Value]) -> String {
    events
        .iter()
        .filter_map(|event| event["choices"][0]["delta"]["content"].as_str())
        .collect()
}
