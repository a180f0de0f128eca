//! The fallback router: one logical call, tried across credentials, models and providers.

use std::{
    collections::HashSet,
    sync::{Arc, PoisonError, RwLock},
};

use config::RoutingConfig;
use futures::{StreamExt, stream::BoxStream};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    converter::Converter,
    error::{AttemptRecord, CancelReason, ConversionError, FailureClass, LlmError, LlmResult},
    messages::unified::{UnifiedChunk, UnifiedRequest, UnifiedResponse},
    pool::{Credential, PoolGeneration, ProviderPool, Unavailable},
    registry::ConverterRegistry,
    transport::{Transport, UpstreamCall, UpstreamFailure, UpstreamReply},
};

mod backoff;
mod candidates;
mod guard;
mod stream;

pub use backoff::backoff_delay;
pub use candidates::{Candidate, candidates};

use guard::Guard;
use stream::Forwarder;

/// Unified chunks in arrival order. A mid-stream failure is the last item.
pub type ChunkStream = BoxStream<'static, LlmResult<UnifiedChunk>>;

/// Result of a successful dispatch.
pub enum Dispatched {
    Complete(UnifiedResponse),
    Stream(ChunkStream),
}

impl std::fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete(response) => f.debug_tuple("Complete").field(response).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

pub struct FallbackRouter {
    registry: Arc<ConverterRegistry>,
    pool: Arc<ProviderPool>,
    transport: Arc<dyn Transport>,
    routing: RwLock<Arc<RoutingConfig>>,
}

impl FallbackRouter {
    pub fn new(
        registry: Arc<ConverterRegistry>,
        pool: Arc<ProviderPool>,
        transport: Arc<dyn Transport>,
        routing: RoutingConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            transport,
            routing: RwLock::new(Arc::new(routing)),
        }
    }

    pub fn pool(&self) -> &Arc<ProviderPool> {
        &self.pool
    }

    /// Routing settings for dispatches starting from now on.
    pub fn routing(&self) -> Arc<RoutingConfig> {
        self.routing.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn reload_routing(&self, routing: RoutingConfig) {
        *self.routing.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(routing);
    }

    /// Serve `request` from `provider_type` or one of its fallbacks.
    ///
    /// Routing settings and the pool generation are captured once, at the start.
    pub async fn dispatch(
        &self,
        request: &UnifiedRequest,
        provider_type: &str,
        cancel: CancellationToken,
    ) -> LlmResult<Dispatched> {
        // Fatal for the requested provider, skipped for fallbacks.
        self.registry.get(provider_type)?;

        let routing = self.routing();
        let generation = self.pool.generation();
        let guard = Guard::new(cancel, routing.request_timeout);

        let mut records = Vec::new();
        let mut rejected: HashSet<String> = HashSet::new();
        let mut attempts = 0;
        let mut pending_delay = None;
        let mut encode_error = None;

        'candidates: for candidate in candidates(&routing, provider_type, &request.model) {
            let converter = match self.registry.get(&candidate.provider_type) {
                Ok(converter) => converter,
                Err(e) => {
                    log::error!("Skipping fallback {candidate}: {e}");
                    records.push(record(&candidate, None, FailureClass::Unsupported, e.to_string()));
                    continue;
                }
            };

            let body = match encode(converter.as_ref(), request, &candidate.model) {
                Ok(body) => body,
                Err(e) => {
                    log::warn!("Skipping {candidate}: {e}");
                    records.push(record(&candidate, None, FailureClass::Unsupported, e.to_string()));
                    encode_error.get_or_insert(e);
                    continue;
                }
            };

            let mut tried: HashSet<String> = HashSet::new();

            loop {
                if attempts >= routing.max_attempts {
                    log::warn!("Retry budget of {} attempts spent at {candidate}", routing.max_attempts);
                    break 'candidates;
                }

                let exclude: HashSet<String> = rejected.union(&tried).cloned().collect();

                let credential = match generation.select(&candidate.provider_type, &exclude) {
                    Ok(credential) => credential,
                    Err(reason) => {
                        if tried.is_empty() {
                            log_unavailable(&generation, &candidate, reason);
                            records.push(record(&candidate, None, FailureClass::Unavailable, reason.to_string()));
                        }

                        continue 'candidates;
                    }
                };

                if let Some(delay) = pending_delay.take() {
                    guard.run(tokio::time::sleep(delay)).await.map_err(LlmError::Cancelled)?;
                }

                attempts += 1;
                tried.insert(credential.id().to_string());

                log::debug!(
                    "Attempt {attempts} for {candidate} with credential '{}'",
                    credential.id()
                );

                let attempt = Attempt {
                    converter: &converter,
                    candidate: &candidate,
                    credential: &credential,
                    generation: &generation,
                    guard: &guard,
                };

                let failure = match self.attempt(attempt, body.clone(), request.stream).await {
                    Ok(dispatched) => return Ok(dispatched),
                    Err(AttemptError::Cancelled(reason)) => {
                        log::debug!("Dispatch for {candidate} cancelled: {reason}");
                        return Err(LlmError::Cancelled(reason));
                    }
                    Err(AttemptError::Failed(failure)) => failure,
                };

                log::warn!(
                    "Attempt {attempts} for {candidate} with credential '{}' failed ({}): {}",
                    credential.id(),
                    failure.class,
                    failure.message
                );

                records.push(record(
                    &candidate,
                    Some(credential.id()),
                    failure.class,
                    failure.message.clone(),
                ));

                note_failure(&generation, &credential, &failure);

                match failure.class {
                    FailureClass::NonRetryable => return Err(failure.into_error()),
                    FailureClass::Auth => {
                        rejected.insert(credential.id().to_string());
                    }
                    _ => pending_delay = Some(backoff_delay(attempts, routing.base_delay, routing.max_delay)),
                }
            }
        }

        // Nothing was ever sent and nothing was merely unavailable: the request itself cannot be served.
        let only_unencodable = records.iter().all(|r| r.classification == FailureClass::Unsupported);

        if let (Some(e), true) = (encode_error, only_unencodable) {
            return Err(LlmError::Conversion(e));
        }

        log::error!(
            "All candidates for {provider_type}/{} failed after {attempts} attempts",
            request.model
        );

        Err(LlmError::PoolExhausted { attempts: records })
    }

    async fn attempt(&self, attempt: Attempt<'_>, body: Value, stream: bool) -> Result<Dispatched, AttemptError> {
        let Attempt {
            converter,
            candidate,
            credential,
            generation,
            guard,
        } = attempt;

        let call = UpstreamCall {
            provider_type: &candidate.provider_type,
            protocol: converter.protocol(),
            model: &candidate.model,
            body,
            stream,
            credential,
        };

        let reply = guard
            .run(self.transport.call(call))
            .await
            .map_err(AttemptError::Cancelled)?
            .map_err(|failure| AttemptError::Failed(AttemptFailure::upstream(failure)))?;

        let forwarder = |events| {
            Forwarder::new(
                events,
                converter.clone(),
                guard.clone(),
                candidate.clone(),
                credential.clone(),
                generation.clone(),
            )
        };

        let dispatched = match (reply, stream) {
            (UpstreamReply::Complete(native), false) => Dispatched::Complete(decode_response(converter, native)?),
            (UpstreamReply::Stream(events), false) => Dispatched::Complete(forwarder(events).collect().await?),
            (UpstreamReply::Stream(events), true) => {
                let mut forwarder = forwarder(events);
                forwarder.prime().await?;

                Dispatched::Stream(forwarder.into_stream())
            }
            (UpstreamReply::Complete(native), true) => {
                let chunks = decode_response(converter, native)?.into_chunks();
                Dispatched::Stream(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
            }
        };

        generation.record_success(credential.id());

        Ok(dispatched)
    }
}

struct Attempt<'a> {
    converter: &'a Arc<dyn Converter>,
    candidate: &'a Candidate,
    credential: &'a Arc<Credential>,
    generation: &'a Arc<PoolGeneration>,
    guard: &'a Guard,
}

pub(crate) enum AttemptError {
    /// Not attributable to the provider; ends the dispatch without touching health.
    Cancelled(CancelReason),
    Failed(AttemptFailure),
}

impl From<AttemptFailure> for AttemptError {
    fn from(failure: AttemptFailure) -> Self {
        Self::Failed(failure)
    }
}

/// A classified attempt failure.
pub(crate) struct AttemptFailure {
    class: FailureClass,
    status: u16,
    message: String,
    /// Whether the failure may count against the credential.
    provider_attributable: bool,
}

impl AttemptFailure {
    fn upstream(failure: UpstreamFailure) -> Self {
        Self {
            class: failure.classify(),
            status: failure.status(),
            message: failure.to_string(),
            provider_attributable: true,
        }
    }

    /// The provider answered with something its converter cannot read.
    fn conversion(error: ConversionError) -> Self {
        Self {
            class: FailureClass::Retryable,
            status: 502,
            message: format!("unreadable provider response: {error}"),
            provider_attributable: false,
        }
    }

    /// The provider reported an error event inside the stream.
    fn in_stream() -> Self {
        Self {
            class: FailureClass::Retryable,
            status: 502,
            message: "provider reported an error inside the stream".to_string(),
            provider_attributable: true,
        }
    }

    fn empty_stream() -> Self {
        Self {
            class: FailureClass::Retryable,
            status: 502,
            message: "stream ended before any output".to_string(),
            provider_attributable: true,
        }
    }

    fn into_error(self) -> LlmError {
        match self.class {
            FailureClass::Auth => LlmError::Auth(self.message),
            class => LlmError::Upstream {
                status: self.status,
                message: self.message,
                retryable: class == FailureClass::Retryable,
            },
        }
    }
}

/// Apply a failure to the credential's health.
fn note_failure(generation: &PoolGeneration, credential: &Credential, failure: &AttemptFailure) {
    match failure.class {
        FailureClass::Auth => generation.record_auth_failure(credential.id(), &failure.message),
        class if failure.provider_attributable => {
            generation.record_failure(credential.id(), class == FailureClass::Retryable, &failure.message)
        }
        _ => (),
    }
}

fn encode(converter: &dyn Converter, request: &UnifiedRequest, model: &str) -> Result<Value, ConversionError> {
    converter.ensure_supported(request)?;
    converter.to_native_request(request, model)
}

fn decode_response(converter: &Arc<dyn Converter>, native: Value) -> Result<UnifiedResponse, AttemptFailure> {
    converter.to_canonical_response(native).map_err(AttemptFailure::conversion)
}

fn record(candidate: &Candidate, credential_id: Option<&str>, class: FailureClass, message: String) -> AttemptRecord {
    AttemptRecord {
        provider_type: candidate.provider_type.clone(),
        model: candidate.model.clone(),
        credential_id: credential_id.map(str::to_string),
        classification: class,
        message,
    }
}

fn log_unavailable(generation: &PoolGeneration, candidate: &Candidate, reason: Unavailable) {
    match reason {
        Unavailable::NotConfigured => {
            log::warn!("No credentials configured for '{}', skipping {candidate}", candidate.provider_type)
        }
        Unavailable::Exhausted => {
            let (total, configured_off) = generation.census(&candidate.provider_type);

            log::warn!(
                "All {total} credentials of '{}' are disabled or excluded ({configured_off} disabled in the pool file), skipping {candidate}",
                candidate.provider_type
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use config::{HealthConfig, PoolDefinitions, RoutingConfig};
    use futures::StreamExt;
    use serde_json::{Value, json};
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::{Dispatched, FallbackRouter};
    use crate::{
        converter::{Converter, OpenAiConverter, testing},
        error::{CancelReason, FailureClass, LlmError},
        messages::unified::{UnifiedFinishReason, UnifiedResponse},
        pool::ProviderPool,
        registry::ConverterRegistry,
        transport::{Transport, UpstreamCall, UpstreamFailure, UpstreamReply},
    };

    type Handler = dyn Fn(&UpstreamCall<'_>) -> Result<UpstreamReply, UpstreamFailure> + Send + Sync;

    /// Answers from a closure and records `(provider, model, credential)` of every call.
    struct FnTransport {
        handler: Box<Handler>,
        calls: Mutex<Vec<(String, String, String)>>,
    }

    impl FnTransport {
        fn new(handler: impl Fn(&UpstreamCall<'_>) -> Result<UpstreamReply, UpstreamFailure> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                handler: Box::new(handler),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for FnTransport {
        async fn call(&self, call: UpstreamCall<'_>) -> Result<UpstreamReply, UpstreamFailure> {
            self.calls.lock().unwrap().push((
                call.provider_type.to_string(),
                call.model.to_string(),
                call.credential.id().to_string(),
            ));

            (self.handler)(&call)
        }
    }

    fn openai_reply() -> Value {
        OpenAiConverter.to_native_response(&testing::assistant_response()).unwrap()
    }

    fn status(status: u16, message: &str) -> UpstreamFailure {
        UpstreamFailure::Status {
            status,
            message: message.into(),
        }
    }

    fn immediate() -> RoutingConfig {
        RoutingConfig {
            max_attempts: 5,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            request_timeout: None,
            ..Default::default()
        }
    }

    fn router(pools: &str, chain: &[(&str, &str)], transport: Arc<FnTransport>) -> FallbackRouter {
        let mut routing = immediate();

        for (from, to) in chain {
            routing
                .provider_fallback_chain
                .entry(from.to_string())
                .or_default()
                .push(to.to_string());
        }

        router_with(pools, routing, transport)
    }

    fn router_with(pools: &str, routing: RoutingConfig, transport: Arc<FnTransport>) -> FallbackRouter {
        let definitions = PoolDefinitions::from_json(pools).unwrap();
        let pool = Arc::new(ProviderPool::new(&definitions, HealthConfig::default()));

        FallbackRouter::new(Arc::new(ConverterRegistry::new()), pool, transport, routing)
    }

    /// OpenAI stream events: one text delta, then a finish with an unrecognized reason.
    fn unknown_finish_events() -> UpstreamReply {
        let events = vec![
            Ok(json!({
                "id": "chatcmpl-9",
                "model": "gpt-4",
                "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hello"}}]
            })),
            Ok(json!({
                "id": "chatcmpl-9",
                "model": "gpt-4",
                "choices": [{"index": 0, "delta": {}, "finish_reason": "weird_new_reason"}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
            })),
        ];

        UpstreamReply::Stream(futures::stream::iter(events).boxed())
    }

    /// One text delta, then nothing ever again.
    fn stalled_events() -> UpstreamReply {
        let first = json!({
            "id": "chatcmpl-9",
            "model": "gpt-4",
            "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hel"}}]
        });

        UpstreamReply::Stream(
            futures::stream::iter([Ok(first)])
                .chain(futures::stream::pending())
                .boxed(),
        )
    }

    #[tokio::test]
    async fn auth_rejection_moves_to_the_next_credential() {
        let transport = FnTransport::new(|call| match call.credential.id() {
            "a1" => Err(status(401, "token expired")),
            _ => Ok(UpstreamReply::Complete(openai_reply())),
        });

        let router = router(r#"{"openai": [{"id": "a1"}, {"id": "a2"}]}"#, &[], transport.clone());
        let request = testing::text_and_tools_request();

        let dispatched = router.dispatch(&request, "openai", CancellationToken::new()).await.unwrap();
        assert!(matches!(dispatched, Dispatched::Complete(ref r) if r.id == "resp_1"));

        let generation = router.pool().generation();
        let rejected = generation.credential("a1").unwrap().health();
        assert_eq!(rejected.error_count, 0);
        assert_eq!(rejected.auth_failures, 1);
        assert!(rejected.needs_refresh);

        assert_eq!(generation.credential("a2").unwrap().health().usage_count, 1);
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn non_retryable_failure_ends_the_dispatch() {
        let transport = FnTransport::new(|_| Err(status(400, "messages: field required")));
        let router = router(
            r#"{"openai": [{"id": "a1"}], "claude": [{"id": "c1"}]}"#,
            &[("openai", "claude")],
            transport.clone(),
        );

        let error = router
            .dispatch(&testing::text_and_tools_request(), "openai", CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(error, LlmError::Upstream { status: 400, retryable: false, .. }));
        assert_eq!(transport.calls().len(), 1);

        let health = router.pool().generation().credential("a1").unwrap().health();
        assert_eq!(health.error_count, 0);
    }

    #[tokio::test]
    async fn retryable_failures_fall_back_across_providers() {
        let transport = FnTransport::new(|call| match call.provider_type {
            "openai" => Err(status(503, "overloaded")),
            _ => Ok(UpstreamReply::Complete(
                crate::converter::ClaudeConverter
                    .to_native_response(&testing::assistant_response())
                    .unwrap(),
            )),
        });

        let router = router(
            r#"{"openai": [{"id": "a1"}], "claude": [{"id": "c1"}]}"#,
            &[("openai", "claude")],
            transport.clone(),
        );

        let dispatched = router
            .dispatch(&testing::text_and_tools_request(), "openai", CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(dispatched, Dispatched::Complete(_)));
        assert_eq!(
            transport.calls(),
            vec![
                ("openai".into(), "gpt-4".into(), "a1".into()),
                ("claude".into(), "gpt-4".into(), "c1".into()),
            ]
        );

        let health = router.pool().generation().credential("a1").unwrap().health();
        assert_eq!(health.error_count, 1);
    }

    #[tokio::test]
    async fn cancelled_dispatch_leaves_health_alone() {
        let transport = FnTransport::new(|_| Err(status(503, "unreachable")));
        let router = router(r#"{"openai": [{"id": "a1"}]}"#, &[], transport);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = router
            .dispatch(&testing::text_and_tools_request(), "openai", cancel)
            .await
            .unwrap_err();

        assert!(matches!(error, LlmError::Cancelled(_)));
        assert_eq!(router.pool().generation().credential("a1").unwrap().health().error_count, 0);
    }

    #[tokio::test]
    async fn unknown_initial_provider_is_fatal() {
        let transport = FnTransport::new(|_| Err(status(503, "unreachable")));
        let router = router(r#"{}"#, &[], transport.clone());

        let error = router
            .dispatch(&testing::text_and_tools_request(), "mistral", CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(error, LlmError::UnknownProvider(_)));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_fallback_provider_is_skipped() {
        let transport = FnTransport::new(|_| Ok(UpstreamReply::Complete(openai_reply())));
        let router = router(
            r#"{"openai": [{"id": "a1", "isDisabled": true}, {"id": "a2"}]}"#,
            &[("kiro", "mistral"), ("kiro", "openai")],
            transport.clone(),
        );

        let dispatched = router
            .dispatch(&testing::text_and_tools_request(), "kiro", CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(dispatched, Dispatched::Complete(_)));
        assert_eq!(transport.calls(), vec![("openai".into(), "gpt-4".into(), "a2".into())]);
    }

    #[tokio::test]
    async fn content_no_candidate_can_encode_is_a_conversion_error() {
        let transport = FnTransport::new(|_| Ok(UpstreamReply::Complete(openai_reply())));
        let router = router(r#"{"kiro": [{"id": "k1"}]}"#, &[], transport.clone());

        let error = router
            .dispatch(&testing::rich_request(), "kiro", CancellationToken::new())
            .await
            .unwrap_err();

        insta::assert_snapshot!(error, @"Invalid request: image content is not supported by the kiro format");
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn exhaustion_lists_unavailable_candidates() {
        let transport = FnTransport::new(|_| Err(status(429, "slow down")));
        let router = router(
            r#"{"openai": [{"id": "a1"}], "gemini": []}"#,
            &[("openai", "gemini")],
            transport,
        );

        let error = router
            .dispatch(&testing::text_and_tools_request(), "openai", CancellationToken::new())
            .await
            .unwrap_err();

        let classes: Vec<_> = error.attempts().iter().map(|a| a.classification).collect();
        assert_eq!(classes, vec![FailureClass::Retryable, FailureClass::Unavailable]);
        assert_eq!(error.status_code(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn complete_reply_is_streamed_when_a_stream_was_asked_for() {
        let transport = FnTransport::new(|_| Ok(UpstreamReply::Complete(openai_reply())));
        let router = router(r#"{"openai": [{"id": "a1"}]}"#, &[], transport);

        let mut request = testing::text_and_tools_request();
        request.stream = true;

        let Dispatched::Stream(stream) = router.dispatch(&request, "openai", CancellationToken::new()).await.unwrap()
        else {
            unreachable!("expected a stream");
        };

        let chunks: Vec<_> = stream.map(Result::unwrap).collect().await;
        let response: UnifiedResponse = chunks.into_iter().collect();

        assert_eq!(
            response.choices[0].message,
            testing::assistant_response().choices[0].message
        );
    }

    #[tokio::test]
    async fn unknown_streamed_finish_reason_is_collected_as_a_reply() {
        let transport = FnTransport::new(|_| Ok(unknown_finish_events()));
        let router = router(r#"{"openai": [{"id": "a1"}, {"id": "a2"}]}"#, &[], transport.clone());

        let dispatched = router
            .dispatch(&testing::text_and_tools_request(), "openai", CancellationToken::new())
            .await
            .unwrap();

        let Dispatched::Complete(response) = dispatched else {
            unreachable!("expected a complete reply");
        };

        assert_eq!(response.choices[0].finish_reason, UnifiedFinishReason::Error);
        assert_eq!(transport.calls().len(), 1);

        let health = router.pool().generation().credential("a1").unwrap().health();
        assert_eq!(health.error_count, 0);
        assert_eq!(health.usage_count, 1);
    }

    #[tokio::test]
    async fn unknown_streamed_finish_reason_ends_the_stream_normally() {
        let transport = FnTransport::new(|_| Ok(unknown_finish_events()));
        let router = router(r#"{"openai": [{"id": "a1"}, {"id": "a2"}]}"#, &[], transport.clone());

        let mut request = testing::text_and_tools_request();
        request.stream = true;

        let Dispatched::Stream(stream) = router.dispatch(&request, "openai", CancellationToken::new()).await.unwrap()
        else {
            unreachable!("expected a stream");
        };

        let chunks: Vec<_> = stream.collect().await;
        assert!(chunks.iter().all(Result::is_ok));

        let terminal = chunks.last().unwrap().as_ref().unwrap();
        assert_eq!(terminal.finish_reason, Some(UnifiedFinishReason::Error));

        assert_eq!(transport.calls().len(), 1);
        assert_eq!(router.pool().generation().credential("a1").unwrap().health().error_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_back_off_exponentially_up_to_the_cap() {
        let sent = Arc::new(Mutex::new(Vec::new()));

        let transport = {
            let sent = sent.clone();

            FnTransport::new(move |call| {
                sent.lock().unwrap().push(Instant::now());

                match call.credential.id() {
                    "a4" => Ok(UpstreamReply::Complete(openai_reply())),
                    _ => Err(status(503, "overloaded")),
                }
            })
        };

        let routing = RoutingConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            ..immediate()
        };

        let router = router_with(
            r#"{"openai": [{"id": "a1"}, {"id": "a2"}, {"id": "a3"}, {"id": "a4"}]}"#,
            routing,
            transport,
        );

        let dispatched = router
            .dispatch(&testing::text_and_tools_request(), "openai", CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(dispatched, Dispatched::Complete(_)));

        let sent = sent.lock().unwrap();
        let gaps: Vec<_> = sent.windows(2).map(|pair| (pair[1] - pair[0]).as_millis()).collect();

        assert_eq!(gaps.len(), 3);

        for (gap, expected) in gaps.iter().zip([100, 200, 250]) {
            assert!((expected..expected + 5).contains(gap), "waited {gap}ms, expected {expected}ms");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_wait_after_auth_rejection_or_before_giving_up() {
        let transport = FnTransport::new(|call| match call.credential.id() {
            "a1" | "a2" => Err(status(401, "token expired")),
            _ => Err(status(503, "overloaded")),
        });

        let routing = RoutingConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
            ..immediate()
        };

        let router = router_with(
            r#"{"openai": [{"id": "a1"}, {"id": "a2"}, {"id": "a3"}]}"#,
            routing,
            transport.clone(),
        );

        let started = Instant::now();

        let error = router
            .dispatch(&testing::text_and_tools_request(), "openai", CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(error, LlmError::PoolExhausted { .. }));
        assert_eq!(transport.calls().len(), 3);
        assert!(started.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_ends_an_in_flight_dispatch() {
        let transport = FnTransport::new(|_| Ok(stalled_events()));

        let routing = RoutingConfig {
            request_timeout: Some(Duration::from_secs(2)),
            ..immediate()
        };

        let router = router_with(r#"{"openai": [{"id": "a1"}]}"#, routing, transport);
        let started = Instant::now();

        let error = router
            .dispatch(&testing::text_and_tools_request(), "openai", CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(error, LlmError::Cancelled(CancelReason::DeadlineExceeded)));
        assert!(started.elapsed() >= Duration::from_secs(2));

        let health = router.pool().generation().credential("a1").unwrap().health();
        assert_eq!(health.error_count, 0);
        assert_eq!(health.usage_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_ends_a_stream_after_output() {
        let transport = FnTransport::new(|_| Ok(stalled_events()));

        let routing = RoutingConfig {
            request_timeout: Some(Duration::from_secs(2)),
            ..immediate()
        };

        let router = router_with(r#"{"openai": [{"id": "a1"}, {"id": "a2"}]}"#, routing, transport.clone());

        let mut request = testing::text_and_tools_request();
        request.stream = true;

        let Dispatched::Stream(stream) = router.dispatch(&request, "openai", CancellationToken::new()).await.unwrap()
        else {
            unreachable!("expected a stream");
        };

        let items: Vec<_> = stream.collect().await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(LlmError::Cancelled(CancelReason::DeadlineExceeded))));
        assert_eq!(transport.calls().len(), 1);

        let health = router.pool().generation().credential("a1").unwrap().health();
        assert_eq!(health.error_count, 0);
    }
}
