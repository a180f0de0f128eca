//! The network boundary: sending one native request for one credential.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::{converter::Protocol, error::FailureClass, pool::Credential};

mod http;

pub use self::http::HttpTransport;

/// Native events of a streamed upstream reply, in arrival order.
pub type UpstreamStream = BoxStream<'static, Result<Value, UpstreamFailure>>;

/// One upstream request.
pub struct UpstreamCall<'a> {
    pub provider_type: &'a str,
    pub protocol: Protocol,
    /// Provider-native model name.
    pub model: &'a str,
    pub body: Value,
    pub stream: bool,
    pub credential: &'a Credential,
}

pub enum UpstreamReply {
    Complete(Value),
    Stream(UpstreamStream),
}

/// A failed upstream call, before classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamFailure {
    /// Connection, DNS or TLS failure; nothing was answered.
    #[error("network error: {0}")]
    Network(String),

    #[error("upstream timed out")]
    Timeout,

    /// The provider answered with an error status.
    #[error("status {status}: {message}")]
    Status { status: u16, message: String },

    /// The provider answered with a body that is not the expected JSON.
    #[error("malformed upstream body: {0}")]
    Malformed(String),
}

impl UpstreamFailure {
    /// How the fallback router treats this failure.
    pub fn classify(&self) -> FailureClass {
        match self {
            Self::Network(_) | Self::Timeout | Self::Malformed(_) => FailureClass::Retryable,
            Self::Status { status, message } => classify_status(*status, message),
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Status { status, .. } => *status,
            Self::Timeout => 504,
            Self::Network(_) | Self::Malformed(_) => 502,
        }
    }
}

/// Phrases providers use for quota or overload on otherwise client-class statuses.
const OVERLOAD_MARKERS: &[&str] = &[
    "quota",
    "rate limit",
    "rate_limit",
    "overloaded",
    "resource_exhausted",
    "throttl",
    "too many requests",
];

fn classify_status(status: u16, message: &str) -> FailureClass {
    match status {
        401 | 403 => FailureClass::Auth,
        408 | 409 | 425 | 429 => FailureClass::Retryable,
        500..=599 => FailureClass::Retryable,
        _ => {
            let message = message.to_ascii_lowercase();

            if OVERLOAD_MARKERS.iter().any(|marker| message.contains(marker)) {
                FailureClass::Retryable
            } else {
                FailureClass::NonRetryable
            }
        }
    }
}

/// Sends native requests upstream.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, call: UpstreamCall<'_>) -> Result<UpstreamReply, UpstreamFailure>;
}
