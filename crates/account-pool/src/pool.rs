//! Account Pool (C4): selection, locking, capacity cooldowns.
//!
//! All mutations are serialised by two small locks (the lock-flag set and
//! the cooldown map) rather than one big pool-wide mutex, because selection
//! needs to read the store's account snapshot — an `.await` point — while
//! holding neither. Correctness comes from re-checking both maps with the
//! lock held at the moment a candidate is actually claimed, not from
//! holding a single critical section across the whole selection scan.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use store::{AccountStatus, Store};
use token_manager::TokenManager;

use crate::error::{Error, Result};
use crate::quota::{RESET_HINT_CUSHION, tiered_default};

#[derive(Debug, Clone)]
pub struct SelectedAccount {
    pub id: i64,
    pub access_token: String,
    pub project_id: String,
    pub tier: String,
}

struct CooldownEntry {
    until: Instant,
    hit_count: u32,
}

pub struct PoolConfig {
    pub error_threshold: u32,
    pub account_wait: Duration,
    /// model -> ordered list of preferred tiers
    pub preferred_tiers: HashMap<String, Vec<String>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            account_wait: Duration::from_secs(30),
            preferred_tiers: HashMap::new(),
        }
    }
}

pub struct Pool {
    store: std::sync::Arc<Store>,
    token_manager: std::sync::Arc<TokenManager>,
    config: PoolConfig,
    locked: Mutex<HashSet<i64>>,
    cooldowns: Mutex<HashMap<(i64, String), CooldownEntry>>,
    notify: Notify,
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

impl Pool {
    pub fn new(
        store: std::sync::Arc<Store>,
        token_manager: std::sync::Arc<TokenManager>,
        config: PoolConfig,
    ) -> Self {
        Self {
            store,
            token_manager,
            config,
            locked: Mutex::new(HashSet::new()),
            cooldowns: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// `getBestAccount`: select, lock, and return an account eligible for
    /// `model`, with a fresh token. Suspends (bounded by `accountWaitMs`
    /// and `cancel`) while no account is immediately selectable but some
    /// might free up.
    pub async fn get_best_account(&self, model: &str, cancel: &CancellationToken) -> Result<SelectedAccount> {
        let deadline = Instant::now() + self.config.account_wait;

        loop {
            let accounts = self.store.list_accounts().await;
            if accounts.is_empty() {
                return Err(Error::NoAccounts);
            }

            let (mut candidates, any_locked, any_cooldown) = {
                let locked = self.locked.lock().await;
                let cooldowns = self.cooldowns.lock().await;
                let now = Instant::now();

                let eligible: Vec<_> = accounts
                    .iter()
                    .filter(|a| {
                        a.status == AccountStatus::Active
                            && a.is_initialized()
                            && !locked.contains(&a.id)
                            && !cooldowns
                                .get(&(a.id, model.to_string()))
                                .map(|c| now < c.until)
                                .unwrap_or(false)
                    })
                    .cloned()
                    .collect();

                let any_locked = accounts.iter().any(|a| {
                    a.status == AccountStatus::Active && a.is_initialized() && locked.contains(&a.id)
                });
                let any_cooldown = accounts.iter().any(|a| {
                    a.status == AccountStatus::Active
                        && a.is_initialized()
                        && !locked.contains(&a.id)
                        && cooldowns
                            .get(&(a.id, model.to_string()))
                            .map(|c| now < c.until)
                            .unwrap_or(false)
                });

                (eligible, any_locked, any_cooldown)
            };

            if candidates.is_empty() {
                if Instant::now() >= deadline {
                    return Err(if any_locked {
                        Error::AllBusy
                    } else if any_cooldown {
                        Error::AllLimited
                    } else {
                        Error::NoAccounts
                    });
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::select! {
                    _ = self.notify.notified() => continue,
                    _ = tokio::time::sleep(remaining) => continue,
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                }
            }

            let preferred = self.config.preferred_tiers.get(model);
            sort_candidates(&mut candidates, preferred);

            for candidate in candidates {
                {
                    let mut locked = self.locked.lock().await;
                    if locked.contains(&candidate.id) {
                        continue; // lost a race to another waiter
                    }
                    locked.insert(candidate.id);
                }

                match self.token_manager.ensure_valid_token(candidate.id).await {
                    Ok(snapshot) => {
                        let _ = self.store.touch_last_used(candidate.id, now_ms()).await;
                        debug!(account_id = candidate.id, model, "selected account");
                        return Ok(SelectedAccount {
                            id: candidate.id,
                            access_token: snapshot.access_token,
                            project_id: snapshot.project_id,
                            tier: snapshot.tier,
                        });
                    }
                    Err(token_manager::Error::InvalidGrant(msg)) => {
                        warn!(account_id = candidate.id, %msg, "invalid grant during selection");
                        self.unlock_account(candidate.id).await;
                        continue;
                    }
                    Err(token_manager::Error::Transient(msg)) => {
                        debug!(account_id = candidate.id, %msg, "transient refresh failure, reselecting");
                        self.unlock_account(candidate.id).await;
                        continue;
                    }
                    Err(e) => {
                        self.unlock_account(candidate.id).await;
                        return Err(e.into());
                    }
                }
            }
            // every candidate this round failed token refresh; loop to
            // recompute against the deadline rather than spin forever.
            if Instant::now() >= deadline {
                return Err(Error::AllBusy);
            }
        }
    }

    /// Idempotent: unlocking an account that isn't locked is a no-op (P9).
    pub async fn unlock_account(&self, id: i64) {
        let removed = self.locked.lock().await.remove(&id);
        if removed {
            self.notify.notify_waiters();
        }
    }

    /// `markCapacityLimited`: sets cooldown_until for (id, model). Prefers
    /// the upstream client's parsed `"reset after Ns"` hint; falls back to
    /// a tiered default that grows with consecutive hits on the same pair.
    pub async fn mark_capacity_limited(&self, id: i64, model: &str, reset_hint: Option<Duration>) {
        let mut cooldowns = self.cooldowns.lock().await;
        let key = (id, model.to_string());
        let hit_count = cooldowns.get(&key).map(|c| c.hit_count + 1).unwrap_or(0);

        let duration = match reset_hint {
            Some(hint) => hint + RESET_HINT_CUSHION,
            None => tiered_default(hit_count),
        };

        cooldowns.insert(key, CooldownEntry { until: Instant::now() + duration, hit_count });
        info!(account_id = id, model, cooldown_secs = duration.as_secs(), "capacity limited");
    }

    /// `markCapacityRecovered`: clears the cooldown entry for (id, model).
    pub async fn mark_capacity_recovered(&self, id: i64, model: &str) {
        let mut cooldowns = self.cooldowns.lock().await;
        if cooldowns.remove(&(id, model.to_string())).is_some() {
            self.notify.notify_waiters();
        }
    }

    /// `markAccountError`: increments error_count; past `errorThreshold`
    /// the account flips to `error` status.
    pub async fn mark_account_error(&self, id: i64, message: &str) -> Result<()> {
        let count = self.store.record_error(id, now_ms(), message.to_string()).await?;
        if count >= self.config.error_threshold {
            warn!(account_id = id, count, "error threshold exceeded, disabling account");
            self.store.set_status(id, AccountStatus::Error).await?;
        }
        Ok(())
    }

    /// Resets error_count on a successful call (A4) and clears any
    /// cooldown for the (account, model) pair that just succeeded.
    pub async fn report_success(&self, id: i64, model: &str) -> Result<()> {
        self.store.clear_errors(id).await?;
        self.mark_capacity_recovered(id, model).await;
        Ok(())
    }

    /// Pool health summary, mirroring what the admin surface exposes.
    pub async fn health(&self) -> serde_json::Value {
        let accounts = self.store.list_accounts().await;
        let locked = self.locked.lock().await;
        let cooldowns = self.cooldowns.lock().await;
        let now = Instant::now();

        let rows: Vec<_> = accounts
            .iter()
            .map(|a| {
                let cooling: Vec<_> = cooldowns
                    .iter()
                    .filter(|((id, _), c)| *id == a.id && now < c.until)
                    .map(|((_, model), c)| {
                        serde_json::json!({
                            "model": model,
                            "cooldown_remaining_secs": c.until.saturating_duration_since(now).as_secs(),
                        })
                    })
                    .collect();
                serde_json::json!({
                    "id": a.id,
                    "email": a.email,
                    "status": a.status.label(),
                    "locked": locked.contains(&a.id),
                    "error_count": a.error_count,
                    "cooldowns": cooling,
                })
            })
            .collect();

        let active = accounts.iter().filter(|a| a.status == AccountStatus::Active).count();
        let overall = if active == 0 {
            "unhealthy"
        } else if active < accounts.len() {
            "degraded"
        } else {
            "healthy"
        };

        serde_json::json!({ "status": overall, "accounts": rows })
    }
}

fn sort_candidates(candidates: &mut [store::Account], preferred_tiers: Option<&Vec<String>>) {
    candidates.sort_by(|a, b| {
        let rank = |acct: &store::Account| -> usize {
            match (preferred_tiers, acct.tier.as_deref()) {
                (Some(tiers), Some(tier)) => tiers.iter().position(|t| t == tier).unwrap_or(tiers.len()),
                _ => usize::MAX,
            }
        };
        rank(a)
            .cmp(&rank(b))
            .then(a.last_used_at.unwrap_or(i64::MIN).cmp(&b.last_used_at.unwrap_or(i64::MIN)))
            .then(a.id.cmp(&b.id))
    });
}
