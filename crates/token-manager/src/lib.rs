//! Token Manager (C3): credential lifecycle, refresh coalescing, and
//! project id / tier discovery.
//!
//! Flow for a new account:
//! 1. An admin supplies a refresh token (out of band; code-exchange is not
//!    this crate's concern) and a row is created in the store.
//! 2. `TokenManager::initialize_account` refreshes once, discovers the
//!    project id and tier, and marks the account active.
//! 3. `TokenManager::ensure_valid_token` is the steady-state entry point:
//!    it returns a fresh snapshot, refreshing (coalesced across concurrent
//!    callers) only when the current token is within skew of expiry.

pub mod constants;
pub mod discover;
pub mod error;
pub mod manager;
pub mod token;

pub use error::{Error, Result};
pub use manager::{TokenManager, TokenManagerConfig, TokenSnapshot};
pub use token::{TokenResponse, refresh_token};
