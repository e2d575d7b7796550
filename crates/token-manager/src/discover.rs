//! Project id / tier discovery (C3 `discover`).
//!
//! With a valid access token, call the upstream "load onboarded user"
//! endpoint to learn the project id and quota tier bound to the account.
//! This runs exactly once, as the tail of `initializeAccount`.

use serde::Deserialize;

use crate::constants::DUPLICATE_ACCOUNT_MARKER;
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    #[serde(rename = "cloudaicompanionProject")]
    project: Option<String>,
    #[serde(rename = "currentTier")]
    tier: Option<TierInfo>,
}

#[derive(Debug, Deserialize)]
struct TierInfo {
    id: String,
}

pub struct Discovery {
    pub project_id: String,
    pub tier: String,
}

pub async fn discover(
    client: &reqwest::Client,
    discovery_endpoint: &str,
    access_token: &str,
) -> Result<Discovery> {
    let response = client
        .post(discovery_endpoint)
        .bearer_auth(access_token)
        .json(&serde_json::json!({ "metadata": { "pluginType": "GEMINI" } }))
        .send()
        .await
        .map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                Error::Transient(format!("discovery request failed: {e}"))
            } else {
                Error::Upstream(format!("discovery request failed: {e}"))
            }
        })?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::Upstream(format!("reading discovery response: {e}")))?;

    if body.to_lowercase().contains(DUPLICATE_ACCOUNT_MARKER) {
        return Err(Error::Duplicate(
            "upstream project already bound to another local account".into(),
        ));
    }

    if !status.is_success() {
        if status.is_server_error() {
            return Err(Error::Transient(format!(
                "discovery endpoint returned {status}: {body}"
            )));
        }
        return Err(Error::Upstream(format!(
            "discovery endpoint returned {status}: {body}"
        )));
    }

    let parsed: DiscoveryResponse = serde_json::from_str(&body)
        .map_err(|e| Error::Upstream(format!("invalid discovery response: {e}")))?;

    let project_id = parsed
        .project
        .ok_or_else(|| Error::Upstream("discovery response missing project id".into()))?;
    let tier = parsed
        .tier
        .map(|t| t.id)
        .ok_or_else(|| Error::Upstream("discovery response missing tier".into()))?;

    Ok(Discovery { project_id, tier })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_response_parses_project_and_tier() {
        let json = r#"{"cloudaicompanionProject":"proj-123","currentTier":{"id":"standard-tier"}}"#;
        let parsed: DiscoveryResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.project.as_deref(), Some("proj-123"));
        assert_eq!(parsed.tier.unwrap().id, "standard-tier");
    }

    #[test]
    fn discovery_response_tolerates_missing_fields() {
        let json = r#"{}"#;
        let parsed: DiscoveryResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.project.is_none());
        assert!(parsed.tier.is_none());
    }
}
