use indoc::indoc;
use integration_tests::{ScriptedTransport, Step, TestServer, dispatcher};
use llm::DispatchContext;
use serde_json::json;

use super::{chat_request, claude_message, complete, gemini_response, openai_chunk, openai_finish_chunk};

const POOLS: &str = indoc! {r#"
    [llm]
    request_base_delay = 0

    [[llm.provider_pools.openai]]
    id = "o1"

    [[llm.provider_pools.gemini]]
    id = "g1"

    [[llm.provider_pools.claude]]
    id = "c1"
"#};

#[tokio::test]
async fn openai_caller_served_by_gemini() {
    let transport = ScriptedTransport::new();
    transport.always("g1", Step::Complete(gemini_response("Bonjour")));

    let dispatcher = dispatcher(POOLS, transport.clone());
    let context = DispatchContext::new("openai").with_provider("gemini");

    let body = complete(&dispatcher, chat_request(false), &context).await.unwrap();

    insta::assert_json_snapshot!(body, { ".created" => "[created]" }, @r#"
    {
      "id": "gem-1",
      "object": "chat.completion",
      "created": "[created]",
      "model": "gpt-4",
      "choices": [
        {
          "index": 0,
          "message": {
            "role": "assistant",
            "content": "Bonjour"
          },
          "finish_reason": "stop"
        }
      ],
      "usage": {
        "prompt_tokens": 4,
        "completion_tokens": 1,
        "total_tokens": 5
      }
    }
    "#);

    let call = &transport.calls()[0];
    assert_eq!(call.provider_type, "gemini");
    assert_eq!(call.body["contents"][0]["role"], "user");
    assert_eq!(call.body["contents"][0]["parts"][0]["text"], "Hi");
    assert_eq!(call.body["systemInstruction"]["parts"][0]["text"], "Be brief.");
}

#[tokio::test]
async fn model_provider_header_selects_the_serving_provider() {
    let transport = ScriptedTransport::new();
    transport.always("c1", Step::Complete(claude_message("Hi from Claude")));

    let server = TestServer::start(POOLS, transport.clone()).await;
    let (status, body) = server
        .post("/v1/chat/completions", &chat_request(false), &[("model-provider", "claude")])
        .await;

    assert_eq!(status, 200);
    assert_eq!(body["choices"][0]["message"]["content"], "Hi from Claude");
    assert_eq!(transport.call_log(), ["claude/gpt-4@c1"]);
}

#[tokio::test]
async fn path_prefix_beats_the_header() {
    let transport = ScriptedTransport::new();
    transport.always("g1", Step::Complete(gemini_response("Hallo")));

    let server = TestServer::start(POOLS, transport.clone()).await;
    let (status, body) = server
        .post("/gemini/v1/chat/completions", &chat_request(false), &[("model-provider", "claude")])
        .await;

    assert_eq!(status, 200);
    assert_eq!(body["choices"][0]["message"]["content"], "Hallo");
    assert_eq!(transport.call_log(), ["gemini/gpt-4@g1"]);
}

#[tokio::test]
async fn gemini_caller_reads_the_model_from_the_path() {
    let transport = ScriptedTransport::new();
    transport.always("g1", Step::Complete(gemini_response("Salut")));

    let server = TestServer::start(POOLS, transport.clone()).await;
    let request = json!({"contents": [{"role": "user", "parts": [{"text": "Hi"}]}]});

    let (status, body) = server
        .post("/v1beta/models/gemini-1.5-pro:generateContent", &request, &[])
        .await;

    assert_eq!(status, 200);
    assert_eq!(body["candidates"][0]["content"]["parts"][0]["text"], "Salut");
    assert_eq!(transport.call_log(), ["gemini/gemini-1.5-pro@g1"]);
}

#[tokio::test]
async fn unknown_provider_is_answered_in_the_callers_format() {
    let server = TestServer::start(POOLS, ScriptedTransport::new()).await;

    let (status, body) = server
        .post("/v1/chat/completions", &chat_request(false), &[("model-provider", "nope")])
        .await;

    assert_eq!(status, 404);
    insta::assert_json_snapshot!(body, @r#"
    {
      "error": {
        "message": "Provider 'nope' not found",
        "type": "not_found_error",
        "code": 404
      }
    }
    "#);
}

#[tokio::test]
async fn openai_stream_is_served_as_sse() {
    let transport = ScriptedTransport::new();
    transport.always("o1", Step::events([openai_chunk("Hi"), openai_finish_chunk()]));

    let server = TestServer::start(POOLS, transport).await;
    let events = server.post_stream("/v1/chat/completions", &chat_request(true)).await;

    let (_, done) = events.last().unwrap();
    assert_eq!(done, "[DONE]");

    let first: serde_json::Value = serde_json::from_str(&events[0].1).unwrap();
    assert_eq!(first["choices"][0]["delta"]["content"], "Hi");
    assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
}

#[tokio::test]
async fn health_reports_every_credential() {
    let transport = ScriptedTransport::new();
    transport.always("o1", Step::Complete(super::openai_completion("ok")));

    let server = TestServer::start(POOLS, transport).await;
    server.post("/v1/chat/completions", &chat_request(false), &[]).await;

    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);

    assert_eq!(body["generation"], 0);
    assert_eq!(body["credentials"].as_array().unwrap().len(), 3);

    let openai = body["credentials"]
        .as_array()
        .unwrap()
        .iter()
        .find(|credential| credential["id"] == "o1")
        .unwrap();

    insta::assert_json_snapshot!(openai, { ".lastUsed" => "[timestamp]" }, @r#"
    {
      "id": "o1",
      "providerType": "openai",
      "priority": 0,
      "isDisabled": false,
      "errorCount": 0,
      "disabledUntil": null,
      "authFailures": 0,
      "needsRefresh": false,
      "usageCount": 1,
      "lastUsed": "[timestamp]",
      "lastError": null
    }
    "#);
}
