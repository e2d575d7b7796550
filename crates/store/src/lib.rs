//! Durable mapping of accounts, API keys, request logs, and model mappings.
//!
//! One JSON document, one writer lock, atomic rewrite on every mutation.
//! Concurrent readers never block on disk I/O; writers serialize through
//! the store's own lock. Account mutability itself is gated above this
//! crate — the account pool and token manager are the only callers that
//! should touch the mutation methods; the store does not enforce that.

pub mod error;
pub mod models;
pub mod store;

pub use error::{Error, Result};
pub use models::{Account, AccountStatus, ApiKey, ModelMapping, RequestLog, RequestStatus};
pub use store::Store;
