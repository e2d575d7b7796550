//! `GatewayState`: the explicit application context the design notes call
//! for in place of the source's process-wide singletons. Owns every
//! shared collaborator the Dispatcher wires together; tests construct a
//! fresh one per case.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use account_pool::Pool;
use store::Store;
use token_manager::TokenManager;
use upstream_client::UpstreamClient;

use crate::limiter::RateLimiter;
use crate::model_log::ModelLogger;

pub struct DispatchConfig {
    pub capacity_retries: u32,
    pub capacity_retry_delay: Duration,
    pub model_aliases: HashMap<String, String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            capacity_retries: 2,
            capacity_retry_delay: Duration::from_millis(1000),
            model_aliases: HashMap::new(),
        }
    }
}

impl DispatchConfig {
    /// Max attempts across distinct accounts: `capacityRetries + 1`.
    pub fn max_attempts(&self) -> u32 {
        self.capacity_retries + 1
    }

    /// Resolve a caller-facing model name to the upstream model id.
    pub fn resolve_model<'a>(&'a self, caller_model: &'a str) -> &'a str {
        self.model_aliases.get(caller_model).map(String::as_str).unwrap_or(caller_model)
    }
}

#[derive(Clone)]
pub struct GatewayState {
    pub store: Arc<Store>,
    pub token_manager: Arc<TokenManager>,
    pub pool: Arc<Pool>,
    pub limiter: Arc<RateLimiter>,
    pub upstream: Arc<UpstreamClient>,
    pub model_logger: Arc<ModelLogger>,
    pub config: Arc<DispatchConfig>,
}
