use indoc::indoc;
use integration_tests::{ScriptedTransport, Step, dispatcher};
use llm::{DispatchContext, FailureClass, LlmError};

use super::{chat_request, claude_message, complete, openai_completion};

#[tokio::test]
async fn providers_are_tried_before_their_fallbacks_and_models_within_each() {
    let config = indoc! {r#"
        [llm]
        request_max_retries = 5
        request_base_delay = 0
        request_max_delay = 0

        [llm.provider_fallback_chain]
        openai = ["claude"]

        [llm.model_fallback_mapping]
        gpt-4 = ["claude-3-opus"]

        [[llm.provider_pools.openai]]
        id = "o1"

        [[llm.provider_pools.claude]]
        id = "c1"
    "#};

    let transport = ScriptedTransport::new();
    transport
        .always("o1", Step::status(503, "overloaded"))
        .always("c1", Step::Complete(claude_message("Hello from Claude")));

    let dispatcher = dispatcher(config, transport.clone());
    let body = complete(&dispatcher, chat_request(false), &DispatchContext::new("openai"))
        .await
        .unwrap();

    insta::assert_json_snapshot!(transport.call_log(), @r#"
    [
      "openai/gpt-4@o1",
      "openai/claude-3-opus@o1",
      "claude/gpt-4@c1"
    ]
    "#);

    // Answered in the caller's format, under the model it asked for.
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "gpt-4");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello from Claude");
}

#[tokio::test]
async fn each_credential_is_attempted_at_most_once_per_candidate() {
    let config = indoc! {r#"
        [llm]
        request_max_retries = 10
        request_base_delay = 0
        request_max_delay = 0
        max_error_count = 10

        [[llm.provider_pools.openai]]
        id = "o1"

        [[llm.provider_pools.openai]]
        id = "o2"
    "#};

    let transport = ScriptedTransport::new();
    transport
        .always("o1", Step::status(500, "internal"))
        .always("o2", Step::status(502, "bad gateway"));

    let dispatcher = dispatcher(config, transport.clone());
    let error = complete(&dispatcher, chat_request(false), &DispatchContext::new("openai"))
        .await
        .unwrap_err();

    assert!(matches!(error, LlmError::PoolExhausted { .. }));
    assert_eq!(transport.call_log(), ["openai/gpt-4@o1", "openai/gpt-4@o2"]);

    let attempted: Vec<_> = error
        .attempts()
        .iter()
        .filter(|record| record.was_attempted())
        .filter_map(|record| record.credential_id.as_deref())
        .collect();

    assert_eq!(attempted, ["o1", "o2"]);
    assert!(
        error
            .attempts()
            .iter()
            .all(|record| record.classification == FailureClass::Retryable)
    );
}

#[tokio::test]
async fn retry_budget_caps_upstream_calls() {
    let config = indoc! {r#"
        [llm]
        request_max_retries = 2
        request_base_delay = 0
        request_max_delay = 0

        [[llm.provider_pools.openai]]
        id = "o1"

        [[llm.provider_pools.openai]]
        id = "o2"

        [[llm.provider_pools.openai]]
        id = "o3"
    "#};

    let transport = ScriptedTransport::new();
    transport
        .always("o1", Step::status(429, "rate limited"))
        .always("o2", Step::status(429, "rate limited"))
        .always("o3", Step::Complete(openai_completion("never reached")));

    let dispatcher = dispatcher(config, transport.clone());
    let error = complete(&dispatcher, chat_request(false), &DispatchContext::new("openai"))
        .await
        .unwrap_err();

    assert!(matches!(error, LlmError::PoolExhausted { .. }));
    assert_eq!(transport.calls().len(), 2);
}

#[tokio::test]
async fn client_errors_are_returned_without_falling_back() {
    let config = indoc! {r#"
        [llm]
        request_base_delay = 0

        [llm.provider_fallback_chain]
        openai = ["claude"]

        [[llm.provider_pools.openai]]
        id = "o1"

        [[llm.provider_pools.claude]]
        id = "c1"
    "#};

    let transport = ScriptedTransport::new();
    transport
        .always("o1", Step::status(400, "messages.0.content: invalid"))
        .always("c1", Step::Complete(claude_message("never reached")));

    let dispatcher = dispatcher(config, transport.clone());
    let error = complete(&dispatcher, chat_request(false), &DispatchContext::new("openai"))
        .await
        .unwrap_err();

    insta::assert_snapshot!(error.client_message(), @"Provider API error (400): status 400: messages.0.content: invalid");
    assert_eq!(error.status_code().as_u16(), 400);
    assert_eq!(transport.call_log(), ["openai/gpt-4@o1"]);
}

#[tokio::test]
async fn rejected_credential_is_skipped_for_the_rest_of_the_dispatch() {
    let config = indoc! {r#"
        [llm]
        request_max_retries = 5
        request_base_delay = 0
        request_max_delay = 0

        [llm.model_fallback_mapping]
        gpt-4 = ["gpt-4o"]

        [[llm.provider_pools.openai]]
        id = "expired"

        [[llm.provider_pools.openai]]
        id = "busy"
    "#};

    let transport = ScriptedTransport::new();
    transport
        .always("expired", Step::status(401, "invalid api key"))
        .push("busy", Step::status(503, "overloaded"))
        .push("busy", Step::Complete(openai_completion("ok")));

    let dispatcher = dispatcher(config, transport.clone());
    let body = complete(&dispatcher, chat_request(false), &DispatchContext::new("openai"))
        .await
        .unwrap();

    assert_eq!(body["choices"][0]["message"]["content"], "ok");

    // The rejected key is not offered again for the fallback model.
    assert_eq!(
        transport.call_log(),
        ["openai/gpt-4@expired", "openai/gpt-4@busy", "openai/gpt-4o@busy"]
    );

    let health = dispatcher.pool().generation().credential("expired").unwrap().health();
    assert!(health.needs_refresh);
    assert_eq!(health.error_count, 0);
}
