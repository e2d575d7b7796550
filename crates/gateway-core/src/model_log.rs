//! Model Logger (C8): structured, size-bounded sink for per-call
//! diagnostics — every upstream invocation that reached C6, not every
//! inbound request. Mirrors the Store's request-log retention rule at a
//! smaller scale and shorter lifetime: diagnostics, not durable history.

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct ModelLogEntry {
    pub kind: &'static str,
    pub provider: &'static str,
    pub endpoint: String,
    pub model: String,
    pub stream: bool,
    pub status: &'static str,
    pub latency_ms: u64,
    pub account_id: Option<i64>,
    pub account_email: Option<String>,
    pub account_tier: Option<String>,
    pub request_body: Value,
    pub response: Value,
    pub error: Option<Value>,
}

pub struct ModelLogger {
    capacity: usize,
    entries: Mutex<VecDeque<ModelLogEntry>>,
}

impl ModelLogger {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// Appends an entry, evicting the oldest on overflow. Never fails the
    /// caller — a logging failure here must not fail the request it
    /// describes.
    pub async fn record(&self, entry: ModelLogEntry) {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Best-effort record of an undecodable raw chunk observed mid-stream
    /// (§9 open question (c)) — logged, not surfaced as an error.
    pub async fn record_dropped_chunk(&self, model: &str, raw_len: usize) {
        warn!(model, raw_len, "dropped undecodable stream chunk");
    }

    pub async fn recent(&self, limit: usize) -> Vec<ModelLogEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(model: &str) -> ModelLogEntry {
        ModelLogEntry {
            kind: "generate",
            provider: "code-assist",
            endpoint: "generateContent".into(),
            model: model.into(),
            stream: false,
            status: "success",
            latency_ms: 10,
            account_id: Some(1),
            account_email: None,
            account_tier: None,
            request_body: json!({}),
            response: json!({}),
            error: None,
        }
    }

    #[tokio::test]
    async fn records_are_retained_up_to_capacity() {
        let logger = ModelLogger::new(2);
        logger.record(entry("a")).await;
        logger.record(entry("b")).await;
        logger.record(entry("c")).await;

        assert_eq!(logger.len().await, 2);
        let recent = logger.recent(10).await;
        assert_eq!(recent[0].model, "c");
        assert_eq!(recent[1].model, "b");
    }

    #[tokio::test]
    async fn recent_respects_limit() {
        let logger = ModelLogger::new(10);
        for m in ["a", "b", "c"] {
            logger.record(entry(m)).await;
        }
        assert_eq!(logger.recent(1).await.len(), 1);
    }
}
