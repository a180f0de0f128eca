//! Test harness: a scripted upstream, a dispatcher built from TOML and an in-process HTTP server.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use config::Config;
use futures::StreamExt;
use llm::{Dispatcher, Transport, UpstreamCall, UpstreamFailure, UpstreamReply};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// One scripted upstream answer.
#[derive(Debug, Clone)]
pub enum Step {
    Complete(Value),
    /// Native stream events; an `Err` item breaks the stream at that point.
    Stream(Vec<Result<Value, UpstreamFailure>>),
    Fail(UpstreamFailure),
}

impl Step {
    pub fn status(status: u16, message: &str) -> Self {
        Self::Fail(UpstreamFailure::Status {
            status,
            message: message.to_string(),
        })
    }

    /// A stream of well-formed events.
    pub fn events(events: impl IntoIterator<Item = Value>) -> Self {
        Self::Stream(events.into_iter().map(Ok).collect())
    }
}

#[derive(Default)]
struct Script {
    queue: VecDeque<Step>,
    fallback: Option<Step>,
}

/// An upstream call as the transport saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub provider_type: String,
    pub model: String,
    pub credential_id: String,
    pub stream: bool,
    pub body: Value,
}

/// Answers upstream calls from per-credential scripts and records every call.
///
/// Queued steps are consumed first, then the credential's standing answer is
/// repeated. An unscripted credential fails with a network error.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue one answer for `credential_id`.
    pub fn push(&self, credential_id: &str, step: Step) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(credential_id.to_string())
            .or_default()
            .queue
            .push_back(step);

        self
    }

    /// Answer every call for `credential_id` with `step` once its queue is empty.
    pub fn always(&self, credential_id: &str, step: Step) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(credential_id.to_string())
            .or_default()
            .fallback = Some(step);

        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// `provider/model@credential` of every call, in order.
    pub fn call_log(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|call| format!("{}/{}@{}", call.provider_type, call.model, call.credential_id))
            .collect()
    }

    fn next_step(&self, credential_id: &str) -> Option<Step> {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.get_mut(credential_id)?;

        script.queue.pop_front().or_else(|| script.fallback.clone())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn call(&self, call: UpstreamCall<'_>) -> Result<UpstreamReply, UpstreamFailure> {
        let credential_id = call.credential.id().to_string();

        self.calls.lock().unwrap().push(RecordedCall {
            provider_type: call.provider_type.to_string(),
            model: call.model.to_string(),
            credential_id: credential_id.clone(),
            stream: call.stream,
            body: call.body,
        });

        // Lets concurrent dispatches interleave.
        tokio::task::yield_now().await;

        match self.next_step(&credential_id) {
            Some(Step::Complete(body)) => Ok(UpstreamReply::Complete(body)),
            Some(Step::Stream(events)) => Ok(UpstreamReply::Stream(futures::stream::iter(events).boxed())),
            Some(Step::Fail(failure)) => Err(failure),
            None => Err(UpstreamFailure::Network(format!("no script for credential '{credential_id}'"))),
        }
    }
}

/// Build a dispatcher from a TOML configuration on top of `transport`.
pub fn dispatcher(config: &str, transport: Arc<ScriptedTransport>) -> Dispatcher {
    let config = Config::from_toml(config).unwrap();
    Dispatcher::from_config(&config.llm, transport).unwrap()
}

/// The LLM routes served over HTTP on a random local port.
pub struct TestServer {
    pub address: SocketAddr,
    pub client: reqwest::Client,
    shutdown: CancellationToken,
}

impl TestServer {
    pub async fn start(config: &str, transport: Arc<ScriptedTransport>) -> Self {
        let config = Config::from_toml(config).unwrap();
        let router = llm::router_with_transport(&config, transport).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();

        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
                .unwrap();
        });

        Self {
            address,
            client: reqwest::Client::new(),
            shutdown,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.address)
    }

    /// POST a JSON body, returning the status and the JSON answer.
    pub async fn post(&self, path: &str, body: &Value, headers: &[(&str, &str)]) -> (u16, Value) {
        let mut request = self.client.post(self.url(path)).json(body);

        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request.send().await.unwrap();
        let status = response.status().as_u16();

        (status, response.json().await.unwrap())
    }

    /// POST a JSON body and read the SSE answer as `(event name, data)` pairs.
    pub async fn post_stream(&self, path: &str, body: &Value) -> Vec<(String, String)> {
        use eventsource_stream::Eventsource;

        let response = self.client.post(self.url(path)).json(body).send().await.unwrap();
        assert_eq!(response.status(), 200);

        response
            .bytes_stream()
            .eventsource()
            .map(|event| {
                let event = event.unwrap();
                (event.event, event.data)
            })
            .collect()
            .await
    }

    pub async fn get(&self, path: &str) -> (u16, Value) {
        let response = self.client.get(self.url(path)).send().await.unwrap();
        let status = response.status().as_u16();

        (status, response.json().await.unwrap())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
