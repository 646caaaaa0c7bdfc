//! Errors returned by LLM backends.

use std::time::Duration;

use thiserror::Error;

use novelkb_shared::FailureKind;

/// A single failed backend call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Connection failed, reset, or DNS lookup failed.
    #[error("network error: {0}")]
    Network(String),

    /// The request did not finish within its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// HTTP 429. `retry_after` is the server's `Retry-After`, if it sent one.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// HTTP 5xx.
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Any other non-2xx response (bad request, auth failure, unknown model).
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// 2xx with no completion text.
    #[error("backend returned an empty response")]
    EmptyResponse,

    /// 2xx whose body is not a chat completion.
    #[error("unexpected response body: {0}")]
    Malformed(String),
}

impl BackendError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_)
            | Self::Timeout(_)
            | Self::RateLimited { .. }
            | Self::Server { .. }
            | Self::EmptyResponse
            | Self::Malformed(_) => true,
            Self::Api { .. } => false,
        }
    }

    /// Delay requested by the server.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Reason code stored in a failed extraction record.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Timeout(_) => FailureKind::Timeout,
            Self::RateLimited { .. } => FailureKind::RateLimited,
            Self::EmptyResponse => FailureKind::EmptyResponse,
            Self::Network(_) | Self::Server { .. } | Self::Api { .. } | Self::Malformed(_) => {
                FailureKind::Backend
            }
        }
    }
}
