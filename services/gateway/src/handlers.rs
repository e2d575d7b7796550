//! HTTP surface for the two caller-facing endpoint families (§6): the
//! OpenAI-shaped chat-completion dialect and the native
//! `generateContent`/`streamGenerateContent` dialect. Both funnel into the
//! same Dispatcher (`gateway_core::dispatch`); this module only adapts
//! request/response shape and picks streaming vs non-streaming.

use std::convert::Infallible;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use gateway_core::{handle_generate, handle_stream_generate};

use crate::AppState;
use crate::error::ApiError;

fn bearer_token(headers: &HeaderMap) -> &str {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("")
}

/// `POST /v1/chat/completions`. The caller-facing body is already in the
/// upstream's normalised shape by the time it reaches this gateway (an
/// external schema converter owns the OpenAI dialect translation); this
/// handler only decides streaming vs non-streaming from `body.stream`.
pub async fn chat_completions(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let model = body.get("model").and_then(Value::as_str).unwrap_or("").to_string();
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let token = bearer_token(&headers).to_string();

    if stream {
        stream_response(state, token, model, body, true).await
    } else {
        non_streaming_response(state, &token, &model, body).await
    }
}

/// `POST /v1beta/models/{model}:generateContent` and
/// `POST /v1beta/models/{model}:streamGenerateContent`, dispatched from a
/// single wildcard route since the action is appended to the model segment
/// with a colon rather than a separate path component.
pub async fn generate_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(model_and_action): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let Some((model, action)) = model_and_action.rsplit_once(':') else {
        return (StatusCode::NOT_FOUND, "unknown endpoint").into_response();
    };
    let token = bearer_token(&headers).to_string();

    match action {
        "generateContent" => non_streaming_response(state, &token, model, body).await,
        "streamGenerateContent" => stream_response(state, token, model.to_string(), body, false).await,
        _ => (StatusCode::NOT_FOUND, "unknown endpoint").into_response(),
    }
}

async fn non_streaming_response(state: AppState, token: &str, model: &str, body: Value) -> Response {
    match handle_generate(&state.gateway, token, model, body, &state.shutdown).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

/// Runs the dispatch loop on a background task, forwarding each unwrapped
/// event as an SSE `data: <json>` line. `emit_done_marker` appends the
/// OpenAI-dialect `data: [DONE]` terminator the native dialect doesn't use.
async fn stream_response(state: AppState, token: String, model: String, body: Value, emit_done_marker: bool) -> Response {
    let (tx, rx) = mpsc::channel::<Value>(32);
    let gateway = state.gateway.clone();
    let cancel = state.shutdown.clone();

    tokio::spawn(async move {
        let _ = handle_stream_generate(&gateway, &token, &model, body, &cancel, tx.clone()).await;
        if emit_done_marker {
            let _ = tx.send(Value::String("[DONE]".to_string())).await;
        }
    });

    let stream = ReceiverStream::new(rx).map(|value| {
        let data = match &value {
            Value::String(s) if s == "[DONE]" => "[DONE]".to_string(),
            other => other.to_string(),
        };
        Ok::<Event, Infallible>(Event::default().data(data))
    });

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}
