//! Entry point of the core: one native request in, one native reply out.

use std::sync::Arc;

use config::LlmConfig;
use futures::{StreamExt, stream::BoxStream};
use serde_json::Value;

use crate::{
    converter::{Converter, StreamState},
    error::{LlmError, LlmResult},
    pool::ProviderPool,
    registry::ConverterRegistry,
    request::DispatchContext,
    router::{ChunkStream, Dispatched, FallbackRouter},
    transport::Transport,
};

/// Native stream events in the caller's format. A failure is rendered as the last event.
pub type NativeStream = BoxStream<'static, Value>;

pub enum NativeReply {
    Complete(Value),
    Stream(NativeStream),
}

pub struct Dispatcher {
    registry: Arc<ConverterRegistry>,
    router: FallbackRouter,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConverterRegistry>, router: FallbackRouter) -> Self {
        Self { registry, router }
    }

    /// Build the registry, pool and router described by `config`.
    pub fn from_config(config: &LlmConfig, transport: Arc<dyn Transport>) -> config::Result<Self> {
        let registry = Arc::new(ConverterRegistry::new());
        let definitions = config.pool_definitions()?;

        for (provider_type, _) in definitions.iter() {
            if !registry.contains(provider_type) {
                log::warn!("Pool '{provider_type}' has no matching converter and will never be used");
            }
        }

        let pool = Arc::new(ProviderPool::new(&definitions, config.health()));
        let router = FallbackRouter::new(registry.clone(), pool, transport, config.routing());

        Ok(Self::new(registry, router))
    }

    /// Swap in new pools and routing settings. In-flight dispatches are unaffected.
    pub fn reload(&self, config: &LlmConfig) -> config::Result<u64> {
        let definitions = config.pool_definitions()?;
        let generation = self.router.pool().reload(&definitions);
        self.router.reload_routing(config.routing());

        Ok(generation)
    }

    pub fn pool(&self) -> &Arc<ProviderPool> {
        self.router.pool()
    }

    pub fn default_provider(&self) -> Option<String> {
        self.router.routing().default_provider.clone()
    }

    /// Converter of a caller format.
    pub fn converter(&self, provider_type: &str) -> LlmResult<Arc<dyn Converter>> {
        self.registry.get(provider_type)
    }

    /// Serve a native request, answering in the caller's format whichever provider served it.
    pub async fn handle(&self, native: Value, context: &DispatchContext) -> LlmResult<NativeReply> {
        let caller = self.registry.get(&context.caller)?;
        let mut request = caller.to_canonical_request(native)?;

        if let Some(stream) = context.stream {
            request.stream = stream;
        }

        let requested_model = request.model.clone();

        log::debug!(
            "Dispatching {} request for model '{requested_model}' to '{}' (stream: {})",
            context.caller,
            context.serving_provider(),
            request.stream
        );

        let dispatched = self
            .router
            .dispatch(&request, context.serving_provider(), context.cancel.clone())
            .await?;

        match dispatched {
            Dispatched::Complete(mut response) => {
                response.model = requested_model;
                Ok(NativeReply::Complete(caller.to_native_response(&response)?))
            }
            Dispatched::Stream(chunks) => Ok(NativeReply::Stream(encode_stream(caller, chunks, requested_model))),
        }
    }
}

/// Re-encode unified chunks for the caller, stopping after the first error.
fn encode_stream(caller: Arc<dyn Converter>, chunks: ChunkStream, model: String) -> NativeStream {
    chunks
        .scan((StreamState::new(), false), move |progress: &mut (StreamState, bool), item| {
            let (state, failed) = progress;

            if *failed {
                return futures::future::ready(None);
            }

            let events = match item {
                Ok(mut chunk) => {
                    chunk.model.clone_from(&model);

                    caller.to_native_chunk(&chunk, state).unwrap_or_else(|e| {
                        log::warn!("Failed to encode stream chunk for {}: {e}", caller.protocol());
                        *failed = true;

                        vec![caller.error_event(&LlmError::Conversion(e))]
                    })
                }
                Err(error) => {
                    *failed = true;
                    vec![caller.error_event(&error)]
                }
            };

            futures::future::ready(Some(futures::stream::iter(events)))
        })
        .flatten()
        .boxed()
}
