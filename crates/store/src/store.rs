//! Durable mapping of accounts, API keys, request logs, and model mappings.
//!
//! A single JSON document behind one `tokio::sync::Mutex`, rewritten
//! atomically (temp file + rename, 0600 permissions) on every mutation —
//! the same durability technique as a single-writer credential file, just
//! generalized from one map to four. Readers clone out of the lock rather
//! than holding it across I/O, so concurrent reads don't serialize on disk
//! writes any more than they must.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{Account, AccountStatus, ApiKey, ModelMapping, RequestLog};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    accounts: HashMap<i64, Account>,
    api_keys: HashMap<String, ApiKey>,
    request_logs: VecDeque<RequestLog>,
    model_mappings: HashMap<String, ModelMapping>,
    #[serde(default)]
    next_account_id: i64,
}

pub struct Store {
    path: PathBuf,
    request_log_retention: usize,
    next_account_id: AtomicI64,
    doc: Mutex<Document>,
}

impl Store {
    pub async fn load(path: PathBuf, request_log_retention: usize) -> Result<Self> {
        let doc = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading store file: {e}")))?;
            let doc: Document = serde_json::from_str(&contents)
                .map_err(|e| Error::Serde(format!("parsing store file: {e}")))?;
            info!(path = %path.display(), accounts = doc.accounts.len(), "loaded store");
            doc
        } else {
            info!(path = %path.display(), "store file not found, starting empty");
            let doc = Document::default();
            write_atomic(&path, &doc).await?;
            doc
        };

        let next_account_id = AtomicI64::new(doc.next_account_id);
        Ok(Self {
            path,
            request_log_retention,
            next_account_id,
            doc: Mutex::new(doc),
        })
    }

    // ---- accounts ----------------------------------------------------

    pub async fn create_account(&self, email: Option<String>, refresh_token: String) -> Account {
        let id = self.next_account_id.fetch_add(1, Ordering::SeqCst) + 1;
        let account = Account::new(id, email, refresh_token);
        let mut doc = self.doc.lock().await;
        doc.accounts.insert(id, account.clone());
        doc.next_account_id = self.next_account_id.load(Ordering::SeqCst);
        let _ = write_atomic(&self.path, &doc).await;
        account
    }

    pub async fn get_account(&self, id: i64) -> Option<Account> {
        self.doc.lock().await.accounts.get(&id).cloned()
    }

    pub async fn list_accounts(&self) -> Vec<Account> {
        let doc = self.doc.lock().await;
        let mut accounts: Vec<Account> = doc.accounts.values().cloned().collect();
        accounts.sort_by_key(|a| a.id);
        accounts
    }

    pub async fn remove_account(&self, id: i64) -> Result<()> {
        let mut doc = self.doc.lock().await;
        if doc.accounts.remove(&id).is_none() {
            return Err(Error::NotFound(format!("account {id}")));
        }
        write_atomic(&self.path, &doc).await
    }

    /// Persist a refreshed access token and its expiry (Token Manager's
    /// write path; see the ownership rule in the data model).
    pub async fn update_token(
        &self,
        id: i64,
        access_token: String,
        expires_at_ms: i64,
    ) -> Result<()> {
        let mut doc = self.doc.lock().await;
        let account = doc
            .accounts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("account {id}")))?;
        account.access_token = Some(access_token);
        account.access_token_expires_at = Some(expires_at_ms);
        write_atomic(&self.path, &doc).await
    }

    /// Persist discovered project id / tier (also the Token Manager's write
    /// path).
    pub async fn update_discovery(&self, id: i64, project_id: String, tier: String) -> Result<()> {
        let mut doc = self.doc.lock().await;
        let account = doc
            .accounts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("account {id}")))?;
        account.project_id = Some(project_id);
        account.tier = Some(tier);
        write_atomic(&self.path, &doc).await
    }

    /// Flip account status. Exclusively the Account Pool's call per the
    /// ownership rule, but the store itself enforces nothing beyond
    /// existence — callers are trusted collaborators.
    pub async fn set_status(&self, id: i64, status: AccountStatus) -> Result<()> {
        let mut doc = self.doc.lock().await;
        let account = doc
            .accounts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("account {id}")))?;
        account.status = status;
        write_atomic(&self.path, &doc).await
    }

    pub async fn touch_last_used(&self, id: i64, now_ms: i64) -> Result<()> {
        let mut doc = self.doc.lock().await;
        let account = doc
            .accounts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("account {id}")))?;
        account.last_used_at = Some(now_ms);
        write_atomic(&self.path, &doc).await
    }

    /// Increment error_count and record the failure; returns the new count.
    pub async fn record_error(&self, id: i64, now_ms: i64, message: String) -> Result<u32> {
        let mut doc = self.doc.lock().await;
        let account = doc
            .accounts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("account {id}")))?;
        account.error_count += 1;
        account.last_error_at = Some(now_ms);
        account.last_error_message = Some(message);
        let count = account.error_count;
        write_atomic(&self.path, &doc).await?;
        Ok(count)
    }

    /// Reset error_count to 0 on a successful call (A4).
    pub async fn clear_errors(&self, id: i64) -> Result<()> {
        let mut doc = self.doc.lock().await;
        let account = doc
            .accounts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("account {id}")))?;
        account.error_count = 0;
        write_atomic(&self.path, &doc).await
    }

    // ---- api keys ------------------------------------------------------

    pub async fn get_api_key(&self, key_hash: &str) -> Option<ApiKey> {
        let doc = self.doc.lock().await;
        doc.api_keys.values().find(|k| k.key_hash == key_hash && !k.disabled).cloned()
    }

    pub async fn put_api_key(&self, key: ApiKey) -> Result<()> {
        let mut doc = self.doc.lock().await;
        doc.api_keys.insert(key.id.clone(), key);
        write_atomic(&self.path, &doc).await
    }

    // ---- model mappings --------------------------------------------------

    pub async fn get_model_mapping(&self, caller_model: &str) -> Option<ModelMapping> {
        self.doc.lock().await.model_mappings.get(caller_model).cloned()
    }

    pub async fn put_model_mapping(&self, mapping: ModelMapping) -> Result<()> {
        let mut doc = self.doc.lock().await;
        doc.model_mappings.insert(mapping.caller_model.clone(), mapping);
        write_atomic(&self.path, &doc).await
    }

    // ---- request logs --------------------------------------------------

    pub async fn append_request_log(&self, log: RequestLog) {
        let mut doc = self.doc.lock().await;
        doc.request_logs.push_back(log);
        while doc.request_logs.len() > self.request_log_retention {
            doc.request_logs.pop_front();
        }
        if let Err(e) = write_atomic(&self.path, &doc).await {
            debug!(error = %e, "failed to persist request log (swallowed)");
        }
    }

    pub async fn recent_request_logs(&self, limit: usize) -> Vec<RequestLog> {
        let doc = self.doc.lock().await;
        doc.request_logs.iter().rev().take(limit).cloned().collect()
    }
}

async fn write_atomic(path: &Path, doc: &Document) -> Result<()> {
    let json = serde_json::to_string_pretty(doc)
        .map_err(|e| Error::Serde(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("store path has no parent directory".into()))?;
    let tmp_path = dir.join(format!(".store.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))?;

    Ok(())
}
