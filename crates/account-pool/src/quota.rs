//! Cooldown-duration derivation for capacity-limited (account, model) pairs.
//!
//! Marker matching and `"reset after Ns"` parsing happen in the upstream
//! client, where the raw error body first appears (§4.4); this module only
//! turns an already-parsed reset hint (or its absence) into a cooldown
//! duration.

use std::time::Duration;

/// Tiered default cooldown when no reset hint is present: doubles per
/// consecutive hit on the same (account, model) pair, capped. This is a
/// best-effort fallback (§9 open question (b)), never a contract.
pub fn tiered_default(consecutive_hits: u32) -> Duration {
    const BASE_SECS: u64 = 60;
    const CAP_SECS: u64 = 900;
    let secs = BASE_SECS.saturating_mul(1u64 << consecutive_hits.min(4));
    Duration::from_secs(secs.min(CAP_SECS))
}

/// The cushion added to a parsed reset hint so the pair isn't re-selected
/// right at the edge of the upstream's own window.
pub const RESET_HINT_CUSHION: Duration = Duration::from_secs(1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiered_default_doubles_and_caps() {
        assert_eq!(tiered_default(0), Duration::from_secs(60));
        assert_eq!(tiered_default(1), Duration::from_secs(120));
        assert_eq!(tiered_default(2), Duration::from_secs(240));
        assert_eq!(tiered_default(10), Duration::from_secs(900));
    }
}
