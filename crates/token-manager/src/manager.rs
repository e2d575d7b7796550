//! Token Manager (C3): refresh, discovery, and initialization, with refresh
//! coalescing so concurrent callers for the same account share one
//! in-flight refresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use store::{AccountStatus, Store};

use crate::constants::{DEFAULT_CLIENT_ID, DEFAULT_DISCOVERY_ENDPOINT, DEFAULT_TOKEN_ENDPOINT};
use crate::discover::discover;
use crate::error::{Error, Result};
use crate::token::refresh_token;

/// A fresh, usable snapshot of an account's upstream identity.
#[derive(Debug, Clone)]
pub struct TokenSnapshot {
    pub access_token: String,
    pub project_id: String,
    pub tier: String,
}

pub struct TokenManagerConfig {
    pub token_endpoint: String,
    pub client_id: String,
    pub discovery_endpoint: String,
    pub skew_ms: i64,
}

impl Default for TokenManagerConfig {
    fn default() -> Self {
        Self {
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            discovery_endpoint: DEFAULT_DISCOVERY_ENDPOINT.to_string(),
            skew_ms: 60_000,
        }
    }
}

/// Per-account shared-work map for refresh coalescing. The coalescing key
/// is the account id; the handle is released (removed) once the refresh
/// that created it completes, on both success and failure paths.
pub struct TokenManager {
    store: Arc<Store>,
    http: reqwest::Client,
    config: TokenManagerConfig,
    inflight: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl TokenManager {
    pub fn new(store: Arc<Store>, http: reqwest::Client, config: TokenManagerConfig) -> Self {
        Self {
            store,
            http,
            config,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// `ensureValidToken`: returns a snapshot guaranteed fresh per (A2).
    /// Reads the persisted state first; only enters the coalesced refresh
    /// path if the access token is missing or within `skew_ms` of expiry.
    pub async fn ensure_valid_token(&self, account_id: i64) -> Result<TokenSnapshot> {
        if let Some(snapshot) = self.fresh_snapshot(account_id).await? {
            return Ok(snapshot);
        }
        self.refresh_coalesced(account_id).await
    }

    async fn fresh_snapshot(&self, account_id: i64) -> Result<Option<TokenSnapshot>> {
        let account = self
            .store
            .get_account(account_id)
            .await
            .ok_or_else(|| Error::NotFound(account_id.to_string()))?;

        let fresh = match (account.access_token.as_ref(), account.access_token_expires_at) {
            (Some(token), Some(expires_at)) if expires_at > now_ms() + self.config.skew_ms => {
                Some(token.clone())
            }
            _ => None,
        };

        match (fresh, account.project_id, account.tier) {
            (Some(access_token), Some(project_id), Some(tier)) => {
                Ok(Some(TokenSnapshot { access_token, project_id, tier }))
            }
            _ => Ok(None),
        }
    }

    /// Forces a refresh regardless of the persisted token's apparent
    /// freshness — used when the upstream itself rejects a token with 401
    /// even though our expiry bookkeeping thought it was still valid.
    /// Still coalesced: concurrent forced and ordinary refreshes for the
    /// same account share one handle.
    pub async fn force_refresh(&self, account_id: i64) -> Result<TokenSnapshot> {
        let handle = {
            let mut inflight = self.inflight.lock().await;
            inflight.entry(account_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let _guard = handle.lock().await;
        let result = self.refresh_and_discover(account_id).await;
        self.inflight.lock().await.remove(&account_id);
        result
    }

    /// Acquire (or create) the per-account coalescing handle, then
    /// double-check freshness under the lock before actually refreshing —
    /// this is what makes P10/P5 hold: the first caller in does the work,
    /// every other caller observes its result without issuing a second
    /// request.
    async fn refresh_coalesced(&self, account_id: i64) -> Result<TokenSnapshot> {
        let handle = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(account_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let _guard = handle.lock().await;

        // Double-checked: another caller may have refreshed while we
        // waited for the lock.
        if let Some(snapshot) = self.fresh_snapshot(account_id).await? {
            self.inflight.lock().await.remove(&account_id);
            return Ok(snapshot);
        }

        let result = self.refresh_and_discover(account_id).await;
        self.inflight.lock().await.remove(&account_id);
        result
    }

    async fn refresh_and_discover(&self, account_id: i64) -> Result<TokenSnapshot> {
        let account = self
            .store
            .get_account(account_id)
            .await
            .ok_or_else(|| Error::NotFound(account_id.to_string()))?;

        let token = match refresh_token(
            &self.http,
            &self.config.token_endpoint,
            &self.config.client_id,
            &account.refresh_token,
        )
        .await
        {
            Ok(t) => t,
            Err(Error::InvalidGrant(msg)) => {
                warn!(account_id, "refresh token rejected, marking account errored");
                let _ = self.store.set_status(account_id, AccountStatus::Error).await;
                return Err(Error::InvalidGrant(msg));
            }
            Err(e) => return Err(e),
        };

        let expires_at_ms = now_ms() + (token.expires_in as i64) * 1000 - self.config.skew_ms;
        self.store
            .update_token(account_id, token.access_token.clone(), expires_at_ms)
            .await?;
        debug!(account_id, "refreshed access token");

        if let (Some(project_id), Some(tier)) = (account.project_id, account.tier) {
            return Ok(TokenSnapshot { access_token: token.access_token, project_id, tier });
        }

        let discovery = discover(&self.http, &self.config.discovery_endpoint, &token.access_token)
            .await?;
        self.store
            .update_discovery(account_id, discovery.project_id.clone(), discovery.tier.clone())
            .await?;

        Ok(TokenSnapshot {
            access_token: token.access_token,
            project_id: discovery.project_id,
            tier: discovery.tier,
        })
    }

    /// `initializeAccount`: refresh → discover → mark active. Runs once,
    /// right after an admin supplies a refresh token. On `Duplicate`, the
    /// caller is expected to delete the just-created local row.
    pub async fn initialize_account(&self, account_id: i64) -> Result<TokenSnapshot> {
        let snapshot = self.refresh_and_discover(account_id).await?;
        self.store.set_status(account_id, AccountStatus::Active).await?;
        info!(account_id, tier = %snapshot.tier, "account initialized");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Arc<Store> {
        let dir = tempfile::tempdir().unwrap();
        // leak the tempdir so the path stays valid for the test's duration
        let path = dir.into_path().join("store.json");
        Arc::new(Store::load(path, 100).await.unwrap())
    }

    #[tokio::test]
    async fn fresh_snapshot_returns_none_when_uninitialized() {
        let store = test_store().await;
        let account = store.create_account(None, "rt".into()).await;
        let http = reqwest::Client::new();
        let manager = TokenManager::new(store, http, TokenManagerConfig::default());

        let snapshot = manager.fresh_snapshot(account.id).await.unwrap();
        assert!(snapshot.is_none());
    }

    #[tokio::test]
    async fn fresh_snapshot_returns_some_when_not_near_expiry() {
        let store = test_store().await;
        let account = store.create_account(None, "rt".into()).await;
        store
            .update_token(account.id, "at".into(), now_ms() + 3_600_000)
            .await
            .unwrap();
        store
            .update_discovery(account.id, "proj".into(), "standard".into())
            .await
            .unwrap();

        let http = reqwest::Client::new();
        let manager = TokenManager::new(store, http, TokenManagerConfig::default());
        let snapshot = manager.fresh_snapshot(account.id).await.unwrap().unwrap();
        assert_eq!(snapshot.access_token, "at");
        assert_eq!(snapshot.project_id, "proj");
    }

    #[tokio::test]
    async fn fresh_snapshot_is_none_within_skew_window() {
        let store = test_store().await;
        let account = store.create_account(None, "rt".into()).await;
        // Expires in 10s, well within the default 60s skew.
        store.update_token(account.id, "at".into(), now_ms() + 10_000).await.unwrap();
        store.update_discovery(account.id, "proj".into(), "standard".into()).await.unwrap();

        let http = reqwest::Client::new();
        let manager = TokenManager::new(store, http, TokenManagerConfig::default());
        assert!(manager.fresh_snapshot(account.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ensure_valid_token_errors_on_unknown_account() {
        let store = test_store().await;
        let http = reqwest::Client::new();
        let manager = TokenManager::new(store, http, TokenManagerConfig::default());
        let result = manager.ensure_valid_token(999).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn force_refresh_errors_on_unknown_account() {
        let store = test_store().await;
        let http = reqwest::Client::new();
        let manager = TokenManager::new(store, http, TokenManagerConfig::default());
        let result = manager.force_refresh(999).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn force_refresh_ignores_an_unexpired_token() {
        // Unlike `ensure_valid_token`, `force_refresh` must not take the
        // fresh-snapshot shortcut: it always attempts a real refresh, so an
        // account with no reachable token endpoint surfaces that failure
        // instead of silently returning the still-valid cached token.
        let store = test_store().await;
        let account = store.create_account(None, "rt".into()).await;
        store.update_token(account.id, "at".into(), now_ms() + 3_600_000).await.unwrap();
        store.update_discovery(account.id, "proj".into(), "standard".into()).await.unwrap();

        let http = reqwest::Client::new();
        let manager = TokenManager::new(store, http, TokenManagerConfig::default());
        let result = manager.force_refresh(account.id).await;
        assert!(result.is_err());
    }
}
