use std::{collections::VecDeque, sync::Arc};

use futures::StreamExt;

use super::{AttemptError, AttemptFailure, ChunkStream, guard::Guard, note_failure};
use crate::{
    converter::{Converter, StreamState},
    error::LlmError,
    messages::unified::{UnifiedChunk, UnifiedResponse, UnifiedResponseBuilder},
    pool::{Credential, PoolGeneration},
    router::Candidate,
    transport::UpstreamStream,
};

/// Decodes one upstream event stream into unified chunks, pulled on demand.
pub(super) struct Forwarder {
    events: UpstreamStream,
    converter: Arc<dyn Converter>,
    state: StreamState,
    pending: VecDeque<UnifiedChunk>,
    saw_event: bool,
    done: bool,
    guard: Guard,
    candidate: Candidate,
    credential: Arc<Credential>,
    generation: Arc<PoolGeneration>,
}

impl Forwarder {
    pub fn new(
        events: UpstreamStream,
        converter: Arc<dyn Converter>,
        guard: Guard,
        candidate: Candidate,
        credential: Arc<Credential>,
        generation: Arc<PoolGeneration>,
    ) -> Self {
        Self {
            events,
            converter,
            state: StreamState::new(),
            pending: VecDeque::new(),
            saw_event: false,
            done: false,
            guard,
            candidate,
            credential,
            generation,
        }
    }

    /// Wait for the first chunk. Failures up to here are ordinary attempt failures.
    pub async fn prime(&mut self) -> Result<(), AttemptError> {
        match self.pull().await? {
            Some(chunk) => {
                self.pending.push_front(chunk);
                Ok(())
            }
            None => Err(AttemptError::Failed(AttemptFailure::empty_stream())),
        }
    }

    /// Fold the whole stream, for callers that did not ask for one.
    pub async fn collect(mut self) -> Result<UnifiedResponse, AttemptError> {
        let mut builder = UnifiedResponseBuilder::new(self.state.created);

        while let Some(chunk) = self.pull().await? {
            builder.push(&chunk);
        }

        Ok(builder.build())
    }

    /// Forward the remaining chunks. A failure from here on is yielded once and ends the stream.
    pub fn into_stream(self) -> ChunkStream {
        futures::stream::unfold(self, |mut forwarder| async move {
            let item = match forwarder.pull().await {
                Ok(Some(chunk)) => Ok(chunk),
                Ok(None) => return None,
                Err(AttemptError::Cancelled(reason)) => {
                    log::debug!("Stream from {} cancelled: {reason}", forwarder.candidate);
                    Err(LlmError::Cancelled(reason))
                }
                Err(AttemptError::Failed(failure)) => {
                    log::warn!(
                        "Stream from {} with credential '{}' failed after output was sent: {}",
                        forwarder.candidate,
                        forwarder.credential.id(),
                        failure.message
                    );

                    note_failure(&forwarder.generation, &forwarder.credential, &failure);
                    Err(failure.into_error())
                }
            };

            Some((item, forwarder))
        })
        .boxed()
    }

    /// The next unified chunk, `None` once the terminal chunk was handed out.
    async fn pull(&mut self) -> Result<Option<UnifiedChunk>, AttemptError> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                if chunk.is_terminal() && self.state.is_failed() {
                    self.done = true;
                    self.pending.clear();

                    return Err(AttemptError::Failed(AttemptFailure::in_stream()));
                }

                if chunk.is_terminal() {
                    self.done = true;
                    self.pending.clear();
                }

                return Ok(Some(chunk));
            }

            if self.done {
                return Ok(None);
            }

            let next = match self.guard.run(self.events.next()).await {
                Ok(next) => next,
                Err(reason) => {
                    self.done = true;
                    return Err(AttemptError::Cancelled(reason));
                }
            };

            match next {
                None => {
                    self.done = true;

                    if !self.saw_event {
                        return Err(AttemptError::Failed(AttemptFailure::empty_stream()));
                    }

                    self.pending.extend(self.converter.finish_canonical_stream(&mut self.state));
                }
                Some(Err(failure)) => {
                    self.done = true;
                    return Err(AttemptError::Failed(AttemptFailure::upstream(failure)));
                }
                Some(Ok(event)) => {
                    self.saw_event = true;

                    match self.converter.to_canonical_chunk(event, &mut self.state) {
                        Ok(chunks) => self.pending.extend(chunks),
                        Err(e) => {
                            self.done = true;
                            return Err(AttemptError::Failed(AttemptFailure::conversion(e)));
                        }
                    }
                }
            }
        }
    }
}
