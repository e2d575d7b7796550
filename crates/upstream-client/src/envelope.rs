//! Upstream envelope construction and response unwrapping (§6).
//!
//! The caller's normalised body is carried mostly as an opaque
//! `serde_json::Value` — only `sessionId` and
//! `generationConfig.candidateCount` are ever parsed or defaulted, per the
//! "dynamic property bags -> typed records" design note.

use serde_json::{Value, json};
use uuid::Uuid;

/// Model id the upstream treats as image generation; everything else is
/// `requestType = "agent"`.
pub const IMAGE_GEN_MODEL: &str = "imagen-3.0-generate";

/// Build the upstream envelope: `{project, requestId, request, model,
/// userAgent, requestType}`. Mutates `inner_body` in place to inject
/// `sessionId` (if absent) and `generationConfig.candidateCount` (default
/// 1) before embedding it as `request`.
pub fn build_envelope(project_id: &str, model: &str, mut inner_body: Value) -> Value {
    normalize_inner_body(&mut inner_body);

    let request_type = if model == IMAGE_GEN_MODEL { "image_gen" } else { "agent" };

    json!({
        "project": project_id,
        "requestId": format!("agent-{}", Uuid::new_v4()),
        "request": inner_body,
        "model": model,
        "userAgent": "antigravity",
        "requestType": request_type,
    })
}

fn normalize_inner_body(body: &mut Value) {
    let Value::Object(map) = body else { return };

    if !map.contains_key("sessionId") {
        map.insert("sessionId".to_string(), json!(synthesize_session_id()));
    }

    let generation_config = map
        .entry("generationConfig")
        .or_insert_with(|| json!({}));
    if let Value::Object(config) = generation_config {
        config.entry("candidateCount").or_insert_with(|| json!(1));
    }
}

/// A synthesised session id when the caller didn't supply one. The exact
/// shape isn't part of any upstream contract — just needs to be unique
/// enough not to collide within a session's lifetime.
fn synthesize_session_id() -> String {
    format!("-{}", Uuid::new_v4().as_u128() as i64)
}

/// Unwraps `{response: {...}, traceId}` into a flat object, preserving
/// `traceId` if the inner object lacks one of its own.
pub fn unwrap_response(mut raw: Value) -> Value {
    let Value::Object(outer) = &mut raw else { return raw };

    let trace_id = outer.get("traceId").cloned();
    let Some(response) = outer.remove("response") else {
        return raw;
    };

    let mut flattened = response;
    if let (Some(trace_id), Value::Object(map)) = (trace_id, &mut flattened) {
        map.entry("traceId").or_insert(trace_id);
    }
    flattened
}

/// Extracts `usageMetadata` from a chunk, if present — the authoritative
/// token-count snapshot; the last observed chunk wins.
pub fn extract_usage_metadata(chunk: &Value) -> Option<Value> {
    chunk.get("usageMetadata").cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_envelope_has_required_shape() {
        let envelope = build_envelope(
            "proj-1",
            "gemini-2.0-flash",
            json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]}),
        );
        assert_eq!(envelope["project"], "proj-1");
        assert!(envelope["requestId"].as_str().unwrap().starts_with("agent-"));
        assert_eq!(envelope["model"], "gemini-2.0-flash");
        assert_eq!(envelope["userAgent"], "antigravity");
        assert_eq!(envelope["requestType"], "agent");
        assert!(envelope["request"]["sessionId"].is_string());
        assert_eq!(envelope["request"]["generationConfig"]["candidateCount"], 1);
    }

    #[test]
    fn build_envelope_marks_image_gen_model() {
        let envelope = build_envelope(IMAGE_GEN_MODEL.into(), IMAGE_GEN_MODEL, json!({}));
        assert_eq!(envelope["requestType"], "image_gen");
    }

    #[test]
    fn build_envelope_preserves_existing_session_id() {
        let envelope = build_envelope("p", "m", json!({"sessionId": "caller-supplied"}));
        assert_eq!(envelope["request"]["sessionId"], "caller-supplied");
    }

    #[test]
    fn build_envelope_preserves_existing_candidate_count() {
        let envelope =
            build_envelope("p", "m", json!({"generationConfig": {"candidateCount": 3}}));
        assert_eq!(envelope["request"]["generationConfig"]["candidateCount"], 3);
    }

    #[test]
    fn unwrap_response_flattens_and_keeps_trace_id() {
        let raw = json!({"response": {"candidates": [1,2]}, "traceId": "t-1"});
        let flat = unwrap_response(raw);
        assert_eq!(flat["candidates"], json!([1, 2]));
        assert_eq!(flat["traceId"], "t-1");
    }

    #[test]
    fn unwrap_response_does_not_override_inner_trace_id() {
        let raw = json!({"response": {"traceId": "inner"}, "traceId": "outer"});
        let flat = unwrap_response(raw);
        assert_eq!(flat["traceId"], "inner");
    }

    #[test]
    fn extract_usage_metadata_present() {
        let chunk = json!({"usageMetadata": {"totalTokenCount": 12}});
        assert_eq!(extract_usage_metadata(&chunk).unwrap()["totalTokenCount"], 12);
    }

    #[test]
    fn extract_usage_metadata_absent() {
        let chunk = json!({"candidates": []});
        assert!(extract_usage_metadata(&chunk).is_none());
    }
}
