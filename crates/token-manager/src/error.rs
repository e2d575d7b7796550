//! Error taxonomy for token refresh and account discovery, per §4.1 and §7.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Refresh token rejected by the upstream. Terminal for this account —
    /// callers must not retry the same account.
    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),

    /// Network failure or 5xx from the token/discovery endpoint. Safe to
    /// retry the same account later.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Any other non-success response from the token/discovery endpoint.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Discovery reported the upstream project is already bound to a
    /// different local account.
    #[error("duplicate account: {0}")]
    Duplicate(String),

    #[error("account not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] store::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
