//! Account Pool (C4): selection policy, exclusive per-account locking, and
//! per-(account, model) capacity cooldowns.
//!
//! Lifecycle of an account as the pool sees it: created (disabled, not yet
//! initialized) → initialized by the token manager (active, project/tier
//! set) → selectable whenever it's unlocked and not cooling down → moved to
//! `error` once consecutive failures cross `errorThreshold`, or `disabled`
//! by an admin at any time.

pub mod error;
pub mod pool;
pub mod quota;

pub use error::{Error, Result};
pub use pool::{Pool, PoolConfig, SelectedAccount};
pub use quota::{RESET_HINT_CUSHION, tiered_default};
