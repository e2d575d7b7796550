//! Upstream Client (C6): builds requests, performs the HTTP call, and
//! parses streamed events.
//!
//! `force_refresh` is a caller-supplied hook so this crate never has to
//! know about the token manager or account pool: on a 401 it calls the
//! hook once for a fresh access token and retries, exactly as §4.4
//! prescribes. It's typed as a boxed future the way the teacher's
//! `Provider` trait returns `Pin<Box<dyn Future<...> + Send>>` at a seam
//! that otherwise couldn't be made into a trait object.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::envelope::{extract_usage_metadata, unwrap_response};
use crate::error::{Error, Result};

pub type ForceRefresh =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Option<String>> + Send>> + Send + Sync>;

/// Called with the byte length of a streamed chunk that failed to parse as
/// JSON, so the caller can route it to its own diagnostics sink (the Model
/// Logger, C8) without this crate having to know that type exists.
pub type DroppedChunkHook =
    Arc<dyn Fn(usize) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

const CAPACITY_MARKERS: &[&str] = &[
    "exhausted your capacity",
    "resource has been exhausted",
    "no capacity available",
];

/// A decoded, unwrapped streaming event. `usage` is populated whenever the
/// chunk carried `usageMetadata` — the last one observed wins.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub body: Value,
    pub usage: Option<Value>,
}

pub struct UpstreamClient {
    http: reqwest::Client,
    endpoint: String,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, endpoint: String) -> Self {
        Self { http, endpoint }
    }

    /// Non-streaming `chat(account, req) -> response`.
    pub async fn chat(
        &self,
        access_token: &str,
        envelope: &Value,
        force_refresh: &ForceRefresh,
    ) -> Result<Value> {
        let response = self.post(access_token, envelope).await?;
        let status = response.status();

        if status.as_u16() == 401 {
            return self.retry_after_refresh(envelope, force_refresh).await;
        }

        if status.is_success() {
            let body: Value = response
                .json()
                .await
                .map_err(|e| Error::UpstreamError(format!("invalid JSON response: {e}")))?;
            return Ok(unwrap_response(body));
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_non_success(status.as_u16(), body))
    }

    async fn retry_after_refresh(&self, envelope: &Value, force_refresh: &ForceRefresh) -> Result<Value> {
        let Some(new_token) = force_refresh().await else {
            return Err(Error::Unauthorized);
        };
        let response = self.post(&new_token, envelope).await?;
        let status = response.status();
        if status.as_u16() == 401 {
            return Err(Error::Unauthorized);
        }
        if status.is_success() {
            let body: Value = response
                .json()
                .await
                .map_err(|e| Error::UpstreamError(format!("invalid JSON response: {e}")))?;
            return Ok(unwrap_response(body));
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_non_success(status.as_u16(), body))
    }

    async fn post(&self, access_token: &str, envelope: &Value) -> Result<reqwest::Response> {
        self.http
            .post(&self.endpoint)
            .bearer_auth(access_token)
            .json(envelope)
            .send()
            .await
            .map_err(|e| Error::UpstreamError(format!("request failed: {e}")))
    }

    /// `streamChat(account, req, emit, cancel) -> done`. Opens the
    /// connection, decodes newline-delimited JSON events, and forwards
    /// each unwrapped event over `sender`. Invalid JSON chunks are dropped
    /// (§9 open question (c)) and reported through `on_dropped_chunk` so
    /// the caller can log them via its own diagnostics sink.
    pub async fn stream_chat(
        &self,
        access_token: &str,
        envelope: &Value,
        force_refresh: &ForceRefresh,
        sender: mpsc::Sender<StreamChunk>,
        cancel: CancellationToken,
        on_dropped_chunk: &DroppedChunkHook,
    ) -> Result<()> {
        let mut response = self.post(access_token, envelope).await?;
        let mut status = response.status();

        if status.as_u16() == 401 {
            let Some(new_token) = force_refresh().await else {
                return Err(Error::Unauthorized);
            };
            response = self.post(&new_token, envelope).await?;
            status = response.status();
            if status.as_u16() == 401 {
                return Err(Error::Unauthorized);
            }
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_non_success(status.as_u16(), body));
        }

        let mut stream = response.bytes_stream();
        let mut buf = Vec::new();
        let mut emitted = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                chunk = stream.next() => chunk,
            };

            let Some(chunk) = next else { break };
            let chunk: Bytes = chunk.map_err(|e| Error::UpstreamError(format!("stream read failed: {e}")))?;
            buf.extend_from_slice(&chunk);

            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.iter().all(|b| b.is_ascii_whitespace()) {
                    continue;
                }
                match serde_json::from_slice::<Value>(line) {
                    Ok(raw) => {
                        let usage = extract_usage_metadata(&raw);
                        let body = unwrap_response(raw);
                        emitted += 1;
                        if sender.send(StreamChunk { body, usage }).await.is_err() {
                            return Err(Error::Cancelled);
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, bytes = line.len(), "dropping undecodable stream chunk");
                        on_dropped_chunk(line.len()).await;
                    }
                }
            }
        }

        if emitted == 0 {
            return Err(Error::EmptyUpstreamResponse);
        }
        Ok(())
    }
}

fn classify_non_success(status: u16, body: String) -> Error {
    let lower = body.to_lowercase();
    let is_capacity_marker = CAPACITY_MARKERS.iter().any(|m| lower.contains(m));
    if status == 429 || is_capacity_marker {
        let reset_hint = parse_reset_hint(&body);
        return Error::CapacityExhausted { reset_hint, message: body };
    }
    warn!(status, "upstream returned non-success, non-capacity error");
    Error::UpstreamError(format!("status {status}: {body}"))
}

/// Best-effort parse of `"reset after <N>s"` out of an upstream error
/// message — never treated as a contract (§9 open question (b)).
fn parse_reset_hint(message: &str) -> Option<Duration> {
    let lower = message.to_lowercase();
    let needle = "reset after ";
    let start = lower.find(needle)? + needle.len();
    let rest = &lower[start..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_non_success_detects_429_as_capacity() {
        let err = classify_non_success(429, "too many requests".into());
        assert!(matches!(err, Error::CapacityExhausted { .. }));
    }

    #[test]
    fn classify_non_success_detects_marker_regardless_of_status() {
        let err = classify_non_success(500, "Resource has been exhausted for project".into());
        assert!(matches!(err, Error::CapacityExhausted { .. }));
    }

    #[test]
    fn classify_non_success_parses_reset_hint() {
        let err = classify_non_success(429, "Resource has been exhausted reset after 4s".into());
        match err {
            Error::CapacityExhausted { reset_hint, .. } => {
                assert_eq!(reset_hint, Some(Duration::from_secs(4)))
            }
            _ => panic!("expected CapacityExhausted"),
        }
    }

    #[test]
    fn classify_non_success_other_is_upstream_error() {
        let err = classify_non_success(500, "internal server error".into());
        assert!(matches!(err, Error::UpstreamError(_)));
    }

    #[test]
    fn parse_reset_hint_absent_returns_none() {
        assert_eq!(parse_reset_hint("quota exceeded"), None);
    }
}
