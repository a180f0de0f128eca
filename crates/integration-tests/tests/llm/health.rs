use std::sync::Arc;

use indoc::indoc;
use integration_tests::{ScriptedTransport, Step, dispatcher};
use llm::{DispatchContext, LlmError};

use super::{chat_request, complete, openai_completion};

#[tokio::test]
async fn credential_is_disabled_after_max_error_count_failures() {
    let config = indoc! {r#"
        [llm]
        max_error_count = 3
        request_max_retries = 1
        cool_down = 60000

        [[llm.provider_pools.openai]]
        id = "flaky"
        priority = 0

        [[llm.provider_pools.openai]]
        id = "standby"
        priority = 1
    "#};

    let transport = ScriptedTransport::new();
    transport
        .always("flaky", Step::status(503, "overloaded"))
        .always("standby", Step::Complete(openai_completion("ok")));

    let dispatcher = dispatcher(config, transport.clone());
    let context = DispatchContext::new("openai");

    for _ in 0..3 {
        let error = complete(&dispatcher, chat_request(false), &context).await.unwrap_err();
        assert!(matches!(error, LlmError::PoolExhausted { .. }));
    }

    let body = complete(&dispatcher, chat_request(false), &context).await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "ok");

    assert_eq!(
        transport.call_log(),
        [
            "openai/gpt-4@flaky",
            "openai/gpt-4@flaky",
            "openai/gpt-4@flaky",
            "openai/gpt-4@standby"
        ]
    );

    let snapshot = dispatcher.pool().snapshot();
    let flaky = snapshot.credentials.iter().find(|c| c.id == "flaky").unwrap();

    assert!(!flaky.is_disabled, "only the pool file disables a credential for good");
    assert_eq!(flaky.health.error_count, 3);
    assert!(flaky.health.disabled_until.is_some());
}

#[tokio::test]
async fn all_disabled_pool_is_reported_as_exhausted() {
    let config = indoc! {r#"
        [[llm.provider_pools.openai]]
        id = "off"
        isDisabled = true
    "#};

    let transport = ScriptedTransport::new();
    let dispatcher = dispatcher(config, transport.clone());

    let error = complete(&dispatcher, chat_request(false), &DispatchContext::new("openai"))
        .await
        .unwrap_err();

    insta::assert_json_snapshot!(error.attempts(), @r#"
    [
      {
        "provider_type": "openai",
        "model": "gpt-4",
        "credential_id": null,
        "classification": "unavailable",
        "message": "all credentials disabled or excluded"
      }
    ]
    "#);

    assert!(transport.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatches_lose_no_health_updates() {
    let config = indoc! {r#"
        [llm]
        max_error_count = 1000
        request_max_retries = 1

        [[llm.provider_pools.openai]]
        id = "good"

        [[llm.provider_pools.claude]]
        id = "bad"
    "#};

    let transport = ScriptedTransport::new();
    transport
        .always("good", Step::Complete(openai_completion("ok")))
        .always("bad", Step::status(503, "overloaded"));

    let dispatcher = Arc::new(dispatcher(config, transport.clone()));

    let handles: Vec<_> = (0..200)
        .map(|i| {
            let dispatcher = dispatcher.clone();

            tokio::spawn(async move {
                let context = if i % 2 == 0 {
                    DispatchContext::new("openai")
                } else {
                    DispatchContext::new("openai").with_provider("claude")
                };

                dispatcher.handle(chat_request(false), &context).await.is_ok()
            })
        })
        .collect();

    let mut succeeded = 0;

    for handle in handles {
        if handle.await.unwrap() {
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 100);

    let generation = dispatcher.pool().generation();
    assert_eq!(generation.credential("good").unwrap().health().usage_count, 100);
    assert_eq!(generation.credential("bad").unwrap().health().error_count, 100);
    assert_eq!(transport.calls().len(), 200);
}
