//! Row shapes for the four logical tables the store owns: `accounts`,
//! `api_keys`, `request_logs`, `model_mappings`.

use serde::{Deserialize, Serialize};

/// Lifecycle status of an account row. Mutated exclusively by the account
/// pool (see the ownership rule in the data model).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Disabled,
    Error,
}

impl AccountStatus {
    pub fn label(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Disabled => "disabled",
            AccountStatus::Error => "error",
        }
    }
}

/// A locally stored credential record for one upstream user identity.
///
/// `refresh_token` is always present (A1). `access_token` is `None` only
/// before the first successful refresh. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub email: Option<String>,
    pub refresh_token: String,
    pub access_token: Option<String>,
    pub access_token_expires_at: Option<i64>,
    pub project_id: Option<String>,
    pub tier: Option<String>,
    pub status: AccountStatus,
    pub error_count: u32,
    pub last_used_at: Option<i64>,
    pub last_error_at: Option<i64>,
    pub last_error_message: Option<String>,
}

impl Account {
    pub fn new(id: i64, email: Option<String>, refresh_token: String) -> Self {
        Self {
            id,
            email,
            refresh_token,
            access_token: None,
            access_token_expires_at: None,
            project_id: None,
            tier: None,
            status: AccountStatus::Disabled,
            error_count: 0,
            last_used_at: None,
            last_error_at: None,
            last_error_message: None,
        }
    }

    /// Whether the row carries everything `initializeAccount` is supposed
    /// to have populated (A3's non-lock, non-cooldown half).
    pub fn is_initialized(&self) -> bool {
        self.project_id.is_some() && self.tier.is_some()
    }
}

/// A caller-facing API key authorized to use the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub key_hash: String,
    pub label: Option<String>,
    pub created_at: i64,
    pub disabled: bool,
}

/// Append-only record of a single upstream invocation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    pub request_id: String,
    pub account_id: Option<i64>,
    pub api_key_id: Option<String>,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub thinking_tokens: u64,
    pub status: RequestStatus,
    pub latency_ms: u64,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub attempt_no: u32,
    pub account_attempt: u32,
    pub same_retry: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Success,
    Error,
}

/// Caller-facing model name -> upstream model name, plus the ordered tier
/// preference used by account selection (see `preferredTiers` in config).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMapping {
    pub caller_model: String,
    pub upstream_model: String,
    pub preferred_tiers: Vec<String>,
}
