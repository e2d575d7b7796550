//! Admin API for account management and operational surfaces.
//!
//! Runs on a separate listener (`adminListenAddr`, default
//! `127.0.0.1:9090`) so it can be kept off any public ingress.
//!
//! Endpoints:
//! - GET    /admin/accounts            — list accounts with status, never exposing tokens
//! - POST   /admin/accounts            — create from `{refresh_token, email?}`, initialize synchronously
//! - DELETE /admin/accounts/:id        — remove from the pool and store
//! - POST   /admin/accounts/:id/disable / /enable — manual lifecycle transition
//! - GET    /admin/pool                — pool health summary
//! - GET    /health                    — liveness + pool health + uptime + request counters
//! - GET    /metrics                   — Prometheus exposition

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use account_pool::Pool;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use store::{AccountStatus, Store};
use token_manager::TokenManager;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AdminState {
    store: Arc<Store>,
    pool: Arc<Pool>,
    token_manager: Arc<TokenManager>,
    metrics_handle: PrometheusHandle,
    started_at: Instant,
    requests_total: Arc<AtomicU64>,
}

impl AdminState {
    pub fn new(
        store: Arc<Store>,
        pool: Arc<Pool>,
        token_manager: Arc<TokenManager>,
        metrics_handle: PrometheusHandle,
        requests_total: Arc<AtomicU64>,
    ) -> Self {
        Self { store, pool, token_manager, metrics_handle, started_at: Instant::now(), requests_total }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/accounts", get(list_accounts).post(create_account))
        .route("/admin/accounts/{id}", delete(delete_account))
        .route("/admin/accounts/{id}/disable", post(disable_account))
        .route("/admin/accounts/{id}/enable", post(enable_account))
        .route("/admin/pool", get(pool_status))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

fn json(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (status, [(axum::http::header::CONTENT_TYPE, "application/json")], body.to_string())
}

/// GET /admin/accounts — never includes refresh_token or access_token.
async fn list_accounts(State(state): State<AdminState>) -> impl IntoResponse {
    let health = state.pool.health().await;
    json(StatusCode::OK, serde_json::json!({ "accounts": health["accounts"] }))
}

#[derive(Debug, Deserialize)]
struct CreateAccountRequest {
    refresh_token: String,
    email: Option<String>,
}

/// POST /admin/accounts — create a row, then run `initializeAccount` (C3)
/// synchronously so the caller learns immediately whether the supplied
/// refresh token is actually usable.
async fn create_account(State(state): State<AdminState>, axum::Json(req): axum::Json<CreateAccountRequest>) -> impl IntoResponse {
    let account = state.store.create_account(req.email, req.refresh_token).await;

    match state.token_manager.initialize_account(account.id).await {
        Ok(snapshot) => {
            info!(account_id = account.id, tier = %snapshot.tier, "account created and initialized");
            json(
                StatusCode::CREATED,
                serde_json::json!({
                    "id": account.id,
                    "project_id": snapshot.project_id,
                    "tier": snapshot.tier,
                }),
            )
        }
        Err(e) => {
            warn!(account_id = account.id, error = %e, "account initialization failed, removing");
            let _ = state.store.remove_account(account.id).await;
            json(StatusCode::BAD_REQUEST, serde_json::json!({ "error": e.to_string() }))
        }
    }
}

/// DELETE /admin/accounts/:id
async fn delete_account(State(state): State<AdminState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.store.remove_account(id).await {
        Ok(()) => {
            state.pool.unlock_account(id).await;
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => json(StatusCode::NOT_FOUND, serde_json::json!({ "error": e.to_string() })).into_response(),
    }
}

async fn disable_account(State(state): State<AdminState>, Path(id): Path<i64>) -> impl IntoResponse {
    set_status_response(&state, id, AccountStatus::Disabled).await
}

async fn enable_account(State(state): State<AdminState>, Path(id): Path<i64>) -> impl IntoResponse {
    set_status_response(&state, id, AccountStatus::Active).await
}

async fn set_status_response(state: &AdminState, id: i64, status: AccountStatus) -> axum::response::Response {
    match state.store.set_status(id, status).await {
        Ok(()) => json(StatusCode::OK, serde_json::json!({ "id": id, "status": status.label() })).into_response(),
        Err(e) => json(StatusCode::NOT_FOUND, serde_json::json!({ "error": e.to_string() })).into_response(),
    }
}

/// GET /admin/pool — same shape the pool itself reports internally.
async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    json(StatusCode::OK, state.pool.health().await)
}

/// GET /health — liveness, pool health, uptime, request counters.
async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    let pool_health = state.pool.health().await;
    let uptime = state.started_at.elapsed().as_secs();
    let requests = state.requests_total.load(Ordering::Relaxed);

    json(
        StatusCode::OK,
        serde_json::json!({
            "status": pool_health["status"],
            "uptime_seconds": uptime,
            "requests_served": requests,
            "pool": pool_health,
        }),
    )
}

/// GET /metrics — Prometheus text exposition.
async fn metrics_text(State(state): State<AdminState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics_handle.render())
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_pool::PoolConfig;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::load(dir.into_path().join("store.json"), 100).await.unwrap());
        let token_manager = Arc::new(TokenManager::new(store.clone(), reqwest::Client::new(), Default::default()));
        let pool = Arc::new(Pool::new(store.clone(), token_manager.clone(), PoolConfig::default()));
        let metrics_handle = PrometheusBuilder::new().build_recorder().handle();
        let state = AdminState::new(store, pool, token_manager, metrics_handle, Arc::new(AtomicU64::new(0)));
        build_admin_router(state)
    }

    #[tokio::test]
    async fn health_reports_ok_with_no_accounts() {
        let app = test_app().await;
        let response = app.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn disabling_an_unknown_account_returns_not_found() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().method("POST").uri("/admin/accounts/999/disable").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listing_accounts_never_exposes_tokens() {
        let app = test_app().await;
        let response = app.oneshot(Request::builder().uri("/admin/accounts").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["accounts"].as_array().unwrap().is_empty());
    }
}
