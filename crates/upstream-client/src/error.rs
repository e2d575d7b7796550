//! Error taxonomy for the upstream HTTP client, per §4.4 and §7.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// HTTP 401 seen twice: once before the forced refresh, once after.
    #[error("upstream rejected credentials after refresh")]
    Unauthorized,

    /// HTTP 429, or a body marker indicating per-account capacity hit.
    /// Carries a best-effort reset hint parsed from the error message.
    #[error("upstream capacity exhausted")]
    CapacityExhausted { reset_hint: Option<Duration>, message: String },

    /// Any other non-2xx / protocol / parse failure.
    #[error("upstream error: {0}")]
    UpstreamError(String),

    /// Streaming connection closed cleanly with zero emitted events.
    #[error("empty upstream response")]
    EmptyUpstreamResponse,

    /// Caller cancellation fired.
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
