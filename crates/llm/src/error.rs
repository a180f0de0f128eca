use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

pub type LlmResult<T> = std::result::Result<T, LlmError>;

pub type ConversionResult<T> = std::result::Result<T, ConversionError>;

/// A native payload could not be translated to or from the unified model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ConversionError(String);

impl ConversionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn missing(field: &str) -> Self {
        Self(format!("missing required field `{field}`"))
    }

    /// The unified content kind cannot be expressed by the target protocol.
    pub fn unsupported(what: impl std::fmt::Display, protocol: impl std::fmt::Display) -> Self {
        Self(format!("{what} content is not supported by the {protocol} format"))
    }
}

impl From<serde_json::Error> for ConversionError {
    fn from(error: serde_json::Error) -> Self {
        Self(error.to_string())
    }
}

/// How an attempt failure is treated by the fallback router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureClass {
    /// Transient: network, timeout, 429, 5xx, quota or overload. Counts against the credential.
    Retryable,
    /// Caused by the request itself. Ends the dispatch.
    NonRetryable,
    /// The credential was rejected. Excluded for this dispatch only.
    Auth,
    /// No credential could be selected for the candidate.
    Unavailable,
    /// The candidate cannot serve this request (unknown provider or unencodable content).
    Unsupported,
}

/// One entry of the per-dispatch attempt log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub provider_type: String,
    pub model: String,
    pub credential_id: Option<String>,
    pub classification: FailureClass,
    pub message: String,
}

impl AttemptRecord {
    /// Whether an upstream call was actually made for this entry.
    pub fn was_attempted(&self) -> bool {
        self.credential_id.is_some()
            && matches!(
                self.classification,
                FailureClass::Retryable | FailureClass::NonRetryable | FailureClass::Auth
            )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CancelReason {
    #[strum(to_string = "caller disconnected")]
    CallerDisconnected,
    #[strum(to_string = "request deadline exceeded")]
    DeadlineExceeded,
}

/// LLM service errors with appropriate HTTP status codes.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Malformed or unsupported native payload.
    #[error("Invalid request: {0}")]
    Conversion(#[from] ConversionError),

    /// No converter is registered for the provider type.
    #[error("Provider '{0}' not found")]
    UnknownProvider(String),

    /// The provider answered with an error, or could not be reached.
    #[error("Provider API error ({status}): {message}")]
    Upstream { status: u16, message: String, retryable: bool },

    /// The credential was rejected by the provider.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Every candidate failed or was unavailable.
    #[error("All providers failed after {} candidates", attempts.len())]
    PoolExhausted { attempts: Vec<AttemptRecord> },

    #[error("Request cancelled: {0}")]
    Cancelled(CancelReason),

    /// Internal server error.
    /// If Some(message), it came from a provider and can be shown.
    /// If None, it's an internal gateway error and should not leak details.
    #[error("Internal server error")]
    Internal(Option<String>),
}

impl LlmError {
    /// Get the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Conversion(_) => StatusCode::BAD_REQUEST,
            Self::UnknownProvider(_) => StatusCode::NOT_FOUND,
            Self::Upstream { status, .. } => match *status {
                400 | 413 | 422 => StatusCode::BAD_REQUEST,
                404 => StatusCode::NOT_FOUND,
                429 => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::BAD_GATEWAY,
            },
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Cancelled(_) => StatusCode::REQUEST_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI-style error type string.
    pub fn error_type(&self) -> &'static str {
        match self.status_code() {
            StatusCode::BAD_REQUEST => "invalid_request_error",
            StatusCode::NOT_FOUND => "not_found_error",
            StatusCode::TOO_MANY_REQUESTS => "rate_limit_error",
            StatusCode::UNAUTHORIZED => "authentication_error",
            StatusCode::SERVICE_UNAVAILABLE => "service_unavailable",
            StatusCode::REQUEST_TIMEOUT => "timeout_error",
            StatusCode::INTERNAL_SERVER_ERROR => "internal_error",
            _ => "api_error",
        }
    }

    /// Message that is safe to expose to API consumers.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(Some(provider_msg)) => provider_msg.clone(),
            Self::Internal(None) => "Internal server error".to_string(),
            Self::PoolExhausted { attempts } => {
                let tried = attempts
                    .iter()
                    .map(|a| format!("{}/{} ({})", a.provider_type, a.model, a.classification))
                    .collect::<Vec<_>>()
                    .join(", ");

                format!("{self}: {tried}")
            }
            _ => self.to_string(),
        }
    }

    /// Attempt log carried by pool exhaustion, empty for other errors.
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::PoolExhausted { attempts } => attempts,
            _ => &[],
        }
    }
}
