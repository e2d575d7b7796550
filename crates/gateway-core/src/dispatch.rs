//! Dispatcher (C7): the per-request state machine wiring the token
//! manager, account pool, rate limiter, and upstream client together.
//!
//! `handle_generate` and `handle_stream_generate` share the same shape:
//! authenticate, acquire a slot, loop over accounts until success or the
//! retry budget is spent, then always release the slot, unlock whatever
//! account is still held, and write a request log.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use store::{RequestLog, RequestStatus};
use upstream_client::{DroppedChunkHook, ForceRefresh, StreamChunk};

use crate::auth::{self, AuthError};
use crate::error::{DispatchError, ErrorCode};
use crate::model_log::ModelLogEntry;
use crate::state::GatewayState;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

fn new_request_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4())
}

#[derive(Default, Clone, Copy)]
struct TokenCounts {
    prompt: u64,
    completion: u64,
    total: u64,
    thinking: u64,
}

fn u64_field(usage: &Value, key: &str) -> u64 {
    usage.get(key).and_then(Value::as_u64).unwrap_or(0)
}

/// Pulls token counts out of a `usageMetadata` object (present inline on a
/// flattened non-streaming response, or carried on the last streamed chunk
/// that had one).
fn token_counts(usage: Option<&Value>) -> TokenCounts {
    let Some(usage) = usage else { return TokenCounts::default() };
    TokenCounts {
        prompt: u64_field(usage, "promptTokenCount"),
        completion: u64_field(usage, "candidatesTokenCount"),
        total: u64_field(usage, "totalTokenCount"),
        thinking: u64_field(usage, "thoughtsTokenCount"),
    }
}

fn force_refresh_for(state: &GatewayState, account_id: i64) -> ForceRefresh {
    let token_manager = state.token_manager.clone();
    Arc::new(move || -> Pin<Box<dyn Future<Output = Option<String>> + Send>> {
        let token_manager = token_manager.clone();
        Box::pin(async move { token_manager.force_refresh(account_id).await.ok().map(|s| s.access_token) })
    })
}

/// Routes an undecodable streamed chunk to the Model Logger (C8) so it's
/// visible to an operator even though it never reaches the caller.
fn dropped_chunk_hook_for(state: &GatewayState, model: &str) -> DroppedChunkHook {
    let model_logger = state.model_logger.clone();
    let model = model.to_string();
    Arc::new(move |raw_len: usize| -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let model_logger = model_logger.clone();
        let model = model.clone();
        Box::pin(async move { model_logger.record_dropped_chunk(&model, raw_len).await })
    })
}

impl From<AuthError> for DispatchError {
    fn from(err: AuthError) -> Self {
        DispatchError::new(ErrorCode::Unauthorized, err.to_string())
    }
}

struct AttemptTracker {
    per_account: HashMap<i64, u32>,
}

impl AttemptTracker {
    fn new() -> Self {
        Self { per_account: HashMap::new() }
    }

    /// Returns (account_attempt, same_retry) for this pick of `account_id`.
    fn record(&mut self, account_id: i64) -> (u32, bool) {
        let count = self.per_account.entry(account_id).or_insert(0);
        *count += 1;
        (*count, *count > 1)
    }
}

/// `handleGenerate`: non-streaming request lifecycle.
pub async fn handle_generate(
    state: &GatewayState,
    bearer_key: &str,
    caller_model: &str,
    body: Value,
    cancel: &CancellationToken,
) -> Result<Value, DispatchError> {
    let api_key = auth::authenticate(&state.store, bearer_key).await?;
    let model = state.config.resolve_model(caller_model).to_string();
    let request_id = new_request_id();
    let started = Instant::now();

    let Some(_slot) = state.limiter.acquire(&model).await else {
        let err = DispatchError::new(
            ErrorCode::ModelConcurrencyLimit,
            "Model concurrency limit reached, please retry later",
        );
        log_request(
            state,
            &request_id,
            None,
            Some(&api_key.id),
            &model,
            RequestStatus::Error,
            started.elapsed().as_millis() as u64,
            Some(&err.message),
            TokenCounts::default(),
            1,
            0,
            false,
        )
        .await;
        return Err(err);
    };

    let mut tracker = AttemptTracker::new();
    let mut attempt_no = 0u32;

    loop {
        attempt_no += 1;
        let account = match state.pool.get_best_account(&model, cancel).await {
            Ok(a) => a,
            Err(e) => {
                let err: DispatchError = e.into();
                log_request(
                    state,
                    &request_id,
                    None,
                    Some(&api_key.id),
                    &model,
                    RequestStatus::Error,
                    started.elapsed().as_millis() as u64,
                    Some(&err.message),
                    TokenCounts::default(),
                    attempt_no,
                    0,
                    false,
                )
                .await;
                return Err(err);
            }
        };

        let (account_attempt, same_retry) = tracker.record(account.id);
        let envelope = upstream_client::build_envelope(&account.project_id, &model, body.clone());
        let force_refresh = force_refresh_for(state, account.id);

        let call_started = Instant::now();
        let result = state.upstream.chat(&account.access_token, &envelope, &force_refresh).await;
        let latency_ms = call_started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                let _ = state.pool.report_success(account.id, &model).await;
                state.pool.unlock_account(account.id).await;
                let tokens = token_counts(response.get("usageMetadata"));
                record_model_log(state, &model, false, "success", latency_ms, Some(&account), &envelope, &response, None)
                    .await;
                log_request(
                    state,
                    &request_id,
                    Some(account.id),
                    Some(&api_key.id),
                    &model,
                    RequestStatus::Success,
                    started.elapsed().as_millis() as u64,
                    None,
                    tokens,
                    attempt_no,
                    account_attempt,
                    same_retry,
                )
                .await;
                return Ok(response);
            }
            Err(upstream_client::Error::CapacityExhausted { reset_hint, message }) => {
                state.pool.mark_capacity_limited(account.id, &model, reset_hint).await;
                state.pool.unlock_account(account.id).await;
                record_model_log(
                    state,
                    &model,
                    false,
                    "error",
                    latency_ms,
                    Some(&account),
                    &envelope,
                    &Value::Null,
                    Some(&message),
                )
                .await;

                if attempt_no < state.config.max_attempts() {
                    let delay = reset_hint.unwrap_or(state.config.capacity_retry_delay * attempt_no);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = cancel.cancelled() => {
                            log_request(
                                state, &request_id, Some(account.id), Some(&api_key.id), &model,
                                RequestStatus::Error, started.elapsed().as_millis() as u64,
                                Some("client disconnected"), TokenCounts::default(),
                                attempt_no, account_attempt, same_retry,
                            ).await;
                            return Err(DispatchError::new(ErrorCode::InternalError, "client disconnected"));
                        }
                    }
                }

                let err = DispatchError::new(ErrorCode::RateLimitExceeded, message);
                log_request(
                    state,
                    &request_id,
                    Some(account.id),
                    Some(&api_key.id),
                    &model,
                    RequestStatus::Error,
                    started.elapsed().as_millis() as u64,
                    Some(&err.message),
                    TokenCounts::default(),
                    attempt_no,
                    account_attempt,
                    same_retry,
                )
                .await;
                return Err(err);
            }
            Err(other) => {
                let _ = state.pool.mark_account_error(account.id, &other.to_string()).await;
                state.pool.unlock_account(account.id).await;
                record_model_log(
                    state,
                    &model,
                    false,
                    "error",
                    latency_ms,
                    Some(&account),
                    &envelope,
                    &Value::Null,
                    Some(&other.to_string()),
                )
                .await;

                let err: DispatchError = other.into();
                log_request(
                    state,
                    &request_id,
                    Some(account.id),
                    Some(&api_key.id),
                    &model,
                    RequestStatus::Error,
                    started.elapsed().as_millis() as u64,
                    Some(&err.message),
                    TokenCounts::default(),
                    attempt_no,
                    account_attempt,
                    same_retry,
                )
                .await;
                return Err(err);
            }
        }
    }
}

/// `handleStreamGenerate`: streaming request lifecycle. Each decoded
/// upstream event is forwarded over `sender` as soon as it arrives;
/// `sender` closing early (the caller disconnected) is observed as a send
/// failure and treated as cancellation.
pub async fn handle_stream_generate(
    state: &GatewayState,
    bearer_key: &str,
    caller_model: &str,
    body: Value,
    cancel: &CancellationToken,
    sender: mpsc::Sender<Value>,
) -> Result<(), DispatchError> {
    let api_key = auth::authenticate(&state.store, bearer_key).await?;
    let model = state.config.resolve_model(caller_model).to_string();
    let request_id = new_request_id();
    let started = Instant::now();

    let Some(_slot) = state.limiter.acquire(&model).await else {
        let err = DispatchError::new(
            ErrorCode::ModelConcurrencyLimit,
            "Model concurrency limit reached, please retry later",
        );
        let _ = sender.send(err.to_stream_event()).await;
        log_request(
            state,
            &request_id,
            None,
            Some(&api_key.id),
            &model,
            RequestStatus::Error,
            started.elapsed().as_millis() as u64,
            Some(&err.message),
            TokenCounts::default(),
            1,
            0,
            false,
        )
        .await;
        return Err(err);
    };

    let mut tracker = AttemptTracker::new();
    let mut attempt_no = 0u32;

    loop {
        attempt_no += 1;
        let account = match state.pool.get_best_account(&model, cancel).await {
            Ok(a) => a,
            Err(e) => {
                let err: DispatchError = e.into();
                let _ = sender.send(err.to_stream_event()).await;
                log_request(
                    state,
                    &request_id,
                    None,
                    Some(&api_key.id),
                    &model,
                    RequestStatus::Error,
                    started.elapsed().as_millis() as u64,
                    Some(&err.message),
                    TokenCounts::default(),
                    attempt_no,
                    0,
                    false,
                )
                .await;
                return Err(err);
            }
        };

        let (account_attempt, same_retry) = tracker.record(account.id);
        let envelope = upstream_client::build_envelope(&account.project_id, &model, body.clone());
        let force_refresh = force_refresh_for(state, account.id);
        let on_dropped_chunk = dropped_chunk_hook_for(state, &model);

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<StreamChunk>(32);
        let upstream = state.upstream.clone();
        let access_token = account.access_token.clone();
        let envelope_for_task = envelope.clone();
        let cancel_for_task = cancel.clone();

        let stream_task = tokio::spawn(async move {
            upstream
                .stream_chat(&access_token, &envelope_for_task, &force_refresh, chunk_tx, cancel_for_task, &on_dropped_chunk)
                .await
        });

        let call_started = Instant::now();
        let mut emitted_any = false;
        let mut latest_usage: Option<Value> = None;
        while let Some(chunk) = chunk_rx.recv().await {
            emitted_any = true;
            if chunk.usage.is_some() {
                latest_usage = chunk.usage.clone();
            }
            if sender.send(chunk.body).await.is_err() {
                stream_task.abort();
                state.pool.unlock_account(account.id).await;
                log_request(
                    state,
                    &request_id,
                    Some(account.id),
                    Some(&api_key.id),
                    &model,
                    RequestStatus::Error,
                    started.elapsed().as_millis() as u64,
                    Some("client disconnected"),
                    TokenCounts::default(),
                    attempt_no,
                    account_attempt,
                    same_retry,
                )
                .await;
                return Err(DispatchError::new(ErrorCode::InternalError, "client disconnected"));
            }
        }
        let latency_ms = call_started.elapsed().as_millis() as u64;

        let result = stream_task.await.unwrap_or(Err(upstream_client::Error::Cancelled));

        match result {
            Ok(()) => {
                let _ = state.pool.report_success(account.id, &model).await;
                state.pool.unlock_account(account.id).await;
                record_model_log(state, &model, true, "success", latency_ms, Some(&account), &envelope, &Value::Null, None)
                    .await;
                let tokens = token_counts(latest_usage.as_ref());
                log_request(
                    state,
                    &request_id,
                    Some(account.id),
                    Some(&api_key.id),
                    &model,
                    RequestStatus::Success,
                    started.elapsed().as_millis() as u64,
                    None,
                    tokens,
                    attempt_no,
                    account_attempt,
                    same_retry,
                )
                .await;
                return Ok(());
            }
            Err(upstream_client::Error::CapacityExhausted { reset_hint, message }) => {
                state.pool.mark_capacity_limited(account.id, &model, reset_hint).await;
                state.pool.unlock_account(account.id).await;
                record_model_log(
                    state,
                    &model,
                    true,
                    "error",
                    latency_ms,
                    Some(&account),
                    &envelope,
                    &Value::Null,
                    Some(&message),
                )
                .await;

                // Streaming-mid-failure rule: once any bytes reached the
                // caller, a capacity error must not trigger a retry on
                // another account.
                if !emitted_any && attempt_no < state.config.max_attempts() {
                    tokio::select! {
                        _ = tokio::time::sleep(reset_hint.unwrap_or(state.config.capacity_retry_delay * attempt_no)) => continue,
                        _ = cancel.cancelled() => {
                            log_request(
                                state, &request_id, Some(account.id), Some(&api_key.id), &model,
                                RequestStatus::Error, started.elapsed().as_millis() as u64,
                                Some("client disconnected"), TokenCounts::default(), attempt_no, account_attempt, same_retry,
                            ).await;
                            return Err(DispatchError::new(ErrorCode::InternalError, "client disconnected"));
                        }
                    }
                }

                let err = DispatchError::new(ErrorCode::RateLimitExceeded, message);
                let _ = sender.send(err.to_stream_event()).await;
                log_request(
                    state,
                    &request_id,
                    Some(account.id),
                    Some(&api_key.id),
                    &model,
                    RequestStatus::Error,
                    started.elapsed().as_millis() as u64,
                    Some(&err.message),
                    TokenCounts::default(),
                    attempt_no,
                    account_attempt,
                    same_retry,
                )
                .await;
                return Err(err);
            }
            Err(upstream_client::Error::Cancelled) => {
                state.pool.unlock_account(account.id).await;
                log_request(
                    state,
                    &request_id,
                    Some(account.id),
                    Some(&api_key.id),
                    &model,
                    RequestStatus::Error,
                    started.elapsed().as_millis() as u64,
                    Some("client disconnected"),
                    TokenCounts::default(),
                    attempt_no,
                    account_attempt,
                    same_retry,
                )
                .await;
                return Err(DispatchError::new(ErrorCode::InternalError, "client disconnected"));
            }
            Err(other) => {
                let _ = state.pool.mark_account_error(account.id, &other.to_string()).await;
                state.pool.unlock_account(account.id).await;
                record_model_log(
                    state,
                    &model,
                    true,
                    "error",
                    latency_ms,
                    Some(&account),
                    &envelope,
                    &Value::Null,
                    Some(&other.to_string()),
                )
                .await;

                let err: DispatchError = other.into();
                let _ = sender.send(err.to_stream_event()).await;
                log_request(
                    state,
                    &request_id,
                    Some(account.id),
                    Some(&api_key.id),
                    &model,
                    RequestStatus::Error,
                    started.elapsed().as_millis() as u64,
                    Some(&err.message),
                    TokenCounts::default(),
                    attempt_no,
                    account_attempt,
                    same_retry,
                )
                .await;
                return Err(err);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn log_request(
    state: &GatewayState,
    request_id: &str,
    account_id: Option<i64>,
    api_key_id: Option<&str>,
    model: &str,
    status: RequestStatus,
    latency_ms: u64,
    error_message: Option<&str>,
    tokens: TokenCounts,
    attempt_no: u32,
    account_attempt: u32,
    same_retry: bool,
) {
    state
        .store
        .append_request_log(RequestLog {
            request_id: request_id.to_string(),
            account_id,
            api_key_id: api_key_id.map(str::to_string),
            model: model.to_string(),
            prompt_tokens: tokens.prompt,
            completion_tokens: tokens.completion,
            total_tokens: tokens.total,
            thinking_tokens: tokens.thinking,
            status,
            latency_ms,
            error_message: error_message.map(str::to_string),
            created_at: now_ms(),
            attempt_no,
            account_attempt,
            same_retry,
        })
        .await;
    if matches!(status, RequestStatus::Error) {
        warn!(request_id, model, error_message, "request failed");
    } else {
        info!(request_id, model, latency_ms, "request succeeded");
    }
}

#[allow(clippy::too_many_arguments)]
async fn record_model_log(
    state: &GatewayState,
    model: &str,
    stream: bool,
    status: &'static str,
    latency_ms: u64,
    account: Option<&account_pool::SelectedAccount>,
    request_body: &Value,
    response: &Value,
    error: Option<&str>,
) {
    state
        .model_logger
        .record(ModelLogEntry {
            kind: "generate",
            provider: "code-assist",
            endpoint: "generateContent".to_string(),
            model: model.to_string(),
            stream,
            status,
            latency_ms,
            account_id: account.map(|a| a.id),
            account_email: None,
            account_tier: account.map(|a| a.tier.clone()),
            request_body: request_body.clone(),
            response: response.clone(),
            error: error.map(|e| Value::String(e.to_string())),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use account_pool::{Pool, PoolConfig};
    use serde_json::json;
    use store::{AccountStatus, ApiKey, Store};
    use token_manager::{TokenManager, TokenManagerConfig};

    use crate::limiter::RateLimiter;
    use crate::model_log::ModelLogger;
    use crate::state::DispatchConfig;

    async fn test_state(capacity: usize) -> (GatewayState, i64) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::load(dir.into_path().join("store.json"), 100).await.unwrap());
        let tm = Arc::new(TokenManager::new(store.clone(), reqwest::Client::new(), TokenManagerConfig::default()));
        let pool = Arc::new(Pool::new(store.clone(), tm.clone(), PoolConfig::default()));

        let account = store.create_account(None, "rt".into()).await;
        store.update_token(account.id, "at".into(), now_ms() + 3_600_000).await.unwrap();
        store.update_discovery(account.id, "proj-1".into(), "standard".into()).await.unwrap();
        store.set_status(account.id, AccountStatus::Active).await.unwrap();

        store
            .put_api_key(ApiKey {
                id: "key-1".into(),
                key_hash: auth::hash_api_key("test-key"),
                label: None,
                created_at: 0,
                disabled: false,
            })
            .await
            .unwrap();

        let limiter = Arc::new(RateLimiter::new(capacity, HashMap::new()));
        let upstream = Arc::new(upstream_client::UpstreamClient::new(reqwest::Client::new(), "http://127.0.0.1:1/unused".into()));
        let model_logger = Arc::new(ModelLogger::new(10));

        let state = GatewayState {
            store,
            token_manager: tm,
            pool,
            limiter,
            upstream,
            model_logger,
            config: Arc::new(DispatchConfig::default()),
        };
        (state, account.id)
    }

    #[tokio::test]
    async fn rejects_unknown_api_key() {
        let (state, _account_id) = test_state(1).await;
        let cancel = CancellationToken::new();
        let err = handle_generate(&state, "wrong-key", "gemini-2.0-flash", json!({}), &cancel).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn slot_exhaustion_returns_concurrency_limit() {
        let (state, _account_id) = test_state(0).await;
        let cancel = CancellationToken::new();
        let err = handle_generate(&state, "test-key", "m", json!({}), &cancel).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ModelConcurrencyLimit);

        let logs = state.store.recent_request_logs(10).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, RequestStatus::Error);
    }

    #[tokio::test]
    async fn no_accounts_surfaces_rate_limit_exceeded_after_unlocking_slot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::load(dir.into_path().join("store.json"), 100).await.unwrap());
        let tm = Arc::new(TokenManager::new(store.clone(), reqwest::Client::new(), TokenManagerConfig::default()));
        let pool = Arc::new(Pool::new(
            store.clone(),
            tm.clone(),
            PoolConfig { account_wait: Duration::from_millis(10), ..PoolConfig::default() },
        ));
        store
            .put_api_key(ApiKey { id: "key-1".into(), key_hash: auth::hash_api_key("test-key"), label: None, created_at: 0, disabled: false })
            .await
            .unwrap();

        let state = GatewayState {
            store,
            token_manager: tm,
            pool,
            limiter: Arc::new(RateLimiter::new(1, HashMap::new())),
            upstream: Arc::new(upstream_client::UpstreamClient::new(reqwest::Client::new(), "http://127.0.0.1:1/unused".into())),
            model_logger: Arc::new(ModelLogger::new(10)),
            config: Arc::new(DispatchConfig::default()),
        };

        let cancel = CancellationToken::new();
        let err = handle_generate(&state, "test-key", "m", json!({}), &cancel).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::RateLimitExceeded);

        // the slot must have been released even though no account existed
        assert!(state.limiter.acquire("m").await.is_some());
    }

    #[tokio::test]
    async fn stream_generate_surfaces_upstream_failure_as_an_error_event() {
        let (state, account_id) = test_state(1).await;
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);

        let result = handle_stream_generate(&state, "test-key", "gemini-2.0-flash", json!({}), &cancel, tx).await;
        assert!(result.is_err());

        let event = rx.recv().await.expect("an error event should have been sent");
        assert!(event["error"]["code"].is_string());

        // the slot and the account lock must both have been released
        assert!(state.limiter.acquire("gemini-2.0-flash").await.is_some());
        let health = state.pool.health().await;
        let account_entry = health["accounts"].as_array().unwrap().iter().find(|a| a["id"] == account_id).unwrap();
        assert_eq!(account_entry["locked"], false);

        let logs = state.store.recent_request_logs(10).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, RequestStatus::Error);
    }
}
