//! HTTP-facing error taxonomy (§7). `gateway-core::dispatch` is the only
//! place that translates the library crates' typed errors into this shape.

use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unauthorized,
    ModelConcurrencyLimit,
    RateLimitExceeded,
    EmptyUpstreamResponse,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "invalid_api_key",
            ErrorCode::ModelConcurrencyLimit => "model_concurrency_limit",
            ErrorCode::RateLimitExceeded => "rate_limit_exceeded",
            ErrorCode::EmptyUpstreamResponse => "empty_upstream_response",
            ErrorCode::InternalError => "internal_error",
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::Unauthorized => 401,
            ErrorCode::ModelConcurrencyLimit => 429,
            ErrorCode::RateLimitExceeded => 429,
            ErrorCode::EmptyUpstreamResponse => 500,
            ErrorCode::InternalError => 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchError {
    pub code: ErrorCode,
    pub message: String,
}

impl DispatchError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// Non-streaming error body: `{"error": {"message", "code"}}`.
    pub fn to_body(&self) -> Value {
        json!({ "error": { "message": self.message, "code": self.code.as_str() } })
    }

    /// Streaming error event: `{"error": {"message", "type", "code"}}`.
    pub fn to_stream_event(&self) -> Value {
        json!({
            "error": {
                "message": self.message,
                "type": "api_error",
                "code": self.code.as_str(),
            }
        })
    }
}

impl From<account_pool::Error> for DispatchError {
    fn from(err: account_pool::Error) -> Self {
        match err {
            account_pool::Error::NoAccounts
            | account_pool::Error::AllBusy
            | account_pool::Error::AllLimited => {
                DispatchError::new(ErrorCode::RateLimitExceeded, err.to_string())
            }
            account_pool::Error::Cancelled => {
                DispatchError::new(ErrorCode::InternalError, "client disconnected")
            }
            other => DispatchError::new(ErrorCode::InternalError, other.to_string()),
        }
    }
}

impl From<upstream_client::Error> for DispatchError {
    fn from(err: upstream_client::Error) -> Self {
        match err {
            upstream_client::Error::CapacityExhausted { .. } => {
                DispatchError::new(ErrorCode::RateLimitExceeded, err.to_string())
            }
            upstream_client::Error::EmptyUpstreamResponse => {
                DispatchError::new(ErrorCode::EmptyUpstreamResponse, err.to_string())
            }
            other => DispatchError::new(ErrorCode::InternalError, other.to_string()),
        }
    }
}
