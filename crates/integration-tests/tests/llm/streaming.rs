use indoc::indoc;
use integration_tests::{ScriptedTransport, Step, dispatcher};
use llm::{DispatchContext, UpstreamFailure};
use serde_json::json;

use super::{chat_request, openai_chunk, openai_completion, openai_finish_chunk, stream, streamed_text};

const TWO_CREDENTIALS: &str = indoc! {r#"
    [llm]
    request_base_delay = 0
    request_max_delay = 0

    [[llm.provider_pools.openai]]
    id = "o1"

    [[llm.provider_pools.openai]]
    id = "o2"
"#};

#[tokio::test]
async fn chunks_are_forwarded_in_order() {
    let transport = ScriptedTransport::new();
    transport.always(
        "o1",
        Step::events([openai_chunk("Hel"), openai_chunk("lo"), openai_finish_chunk()]),
    );

    let dispatcher = dispatcher(TWO_CREDENTIALS, transport.clone());
    let events = stream(&dispatcher, chat_request(true), &DispatchContext::new("openai"))
        .await
        .unwrap();

    assert_eq!(streamed_text(&events), "Hello");

    let last = events.last().unwrap();
    assert_eq!(last["choices"][0]["finish_reason"], "stop");
    assert_eq!(last["model"], "gpt-4");
    assert_eq!(last["usage"]["total_tokens"], 5);

    assert!(transport.calls()[0].stream);
}

#[tokio::test]
async fn failure_after_output_ends_the_stream_without_retry() {
    let transport = ScriptedTransport::new();
    transport
        .always(
            "o1",
            Step::events([
                openai_chunk("Hel"),
                openai_chunk("lo"),
                json!({"error": {"message": "upstream exploded", "type": "server_error"}}),
            ]),
        )
        .always("o2", Step::events([openai_chunk("never"), openai_finish_chunk()]));

    let dispatcher = dispatcher(TWO_CREDENTIALS, transport.clone());
    let events = stream(&dispatcher, chat_request(true), &DispatchContext::new("openai"))
        .await
        .unwrap();

    assert_eq!(streamed_text(&events), "Hello");

    insta::assert_json_snapshot!(events.last().unwrap(), @r#"
    {
      "error": {
        "message": "Provider API error (502): provider reported an error inside the stream",
        "type": "api_error",
        "code": 502
      }
    }
    "#);

    assert_eq!(transport.call_log(), ["openai/gpt-4@o1"]);

    let health = dispatcher.pool().generation().credential("o1").unwrap().health();
    assert_eq!(health.error_count, 1);
}

#[tokio::test]
async fn broken_connection_mid_stream_is_reported_once() {
    let transport = ScriptedTransport::new();
    transport.always(
        "o1",
        Step::Stream(vec![
            Ok(openai_chunk("partial")),
            Err(UpstreamFailure::Network("connection reset".into())),
            Ok(openai_chunk("ignored")),
        ]),
    );

    let dispatcher = dispatcher(TWO_CREDENTIALS, transport.clone());
    let events = stream(&dispatcher, chat_request(true), &DispatchContext::new("openai"))
        .await
        .unwrap();

    assert_eq!(events.len(), 2);
    assert_eq!(streamed_text(&events), "partial");
    assert_eq!(events[1]["error"]["code"], 502);
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test]
async fn failure_before_the_first_chunk_falls_back() {
    let transport = ScriptedTransport::new();
    transport
        .always("o1", Step::events([json!({"error": {"message": "overloaded"}})]))
        .always("o2", Step::events([openai_chunk("fine"), openai_finish_chunk()]));

    let dispatcher = dispatcher(TWO_CREDENTIALS, transport.clone());
    let events = stream(&dispatcher, chat_request(true), &DispatchContext::new("openai"))
        .await
        .unwrap();

    assert_eq!(streamed_text(&events), "fine");
    assert_eq!(transport.call_log(), ["openai/gpt-4@o1", "openai/gpt-4@o2"]);
}

#[tokio::test]
async fn complete_reply_is_re_streamed_for_a_streaming_caller() {
    let transport = ScriptedTransport::new();
    transport.always("o1", Step::Complete(openai_completion("all at once")));

    let dispatcher = dispatcher(TWO_CREDENTIALS, transport);
    let events = stream(&dispatcher, chat_request(true), &DispatchContext::new("openai"))
        .await
        .unwrap();

    assert_eq!(streamed_text(&events), "all at once");
    assert_eq!(events.last().unwrap()["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn streamed_reply_is_collected_for_a_non_streaming_caller() {
    let transport = ScriptedTransport::new();
    transport.always(
        "o1",
        Step::events([openai_chunk("Hel"), openai_chunk("lo"), openai_finish_chunk()]),
    );

    let dispatcher = dispatcher(TWO_CREDENTIALS, transport);
    let body = super::complete(&dispatcher, chat_request(false), &DispatchContext::new("openai"))
        .await
        .unwrap();

    assert_eq!(body["choices"][0]["message"]["content"], "Hello");
    assert_eq!(body["usage"]["completion_tokens"], 2);
}

#[tokio::test]
async fn unrecognized_finish_reason_is_streamed_like_it_is_answered() {
    let finish = json!({
        "id": "chatcmpl-1",
        "model": "gpt-4",
        "choices": [{"index": 0, "delta": {}, "finish_reason": "weird_new_reason"}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
    });

    let transport = ScriptedTransport::new();
    transport
        .always("o1", Step::events([openai_chunk("Hello"), finish]))
        .always("o2", Step::events([openai_chunk("never"), openai_finish_chunk()]));

    let dispatcher = dispatcher(TWO_CREDENTIALS, transport.clone());
    let events = stream(&dispatcher, chat_request(true), &DispatchContext::new("openai"))
        .await
        .unwrap();

    assert_eq!(streamed_text(&events), "Hello");
    assert!(events.iter().all(|event| event.get("error").is_none()));
    assert_eq!(transport.call_log(), ["openai/gpt-4@o1"]);

    let health = dispatcher.pool().generation().credential("o1").unwrap().health();
    assert_eq!(health.error_count, 0);
    assert_eq!(health.usage_count, 1);
}
