//! Error taxonomy for account selection, per §4.2 and §7.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The pool has no accounts at all.
    #[error("no accounts configured")]
    NoAccounts,

    /// Every eligible account is currently locked and the caller's wait
    /// budget elapsed before one freed up.
    #[error("all accounts busy")]
    AllBusy,

    /// Every account is in a capacity cooldown for the requested model.
    #[error("all accounts rate-limited for this model")]
    AllLimited,

    /// Caller cancellation fired while waiting for an account.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    TokenManager(#[from] token_manager::Error),

    #[error(transparent)]
    Store(#[from] store::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
