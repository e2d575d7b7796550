//! Refresh-token grant against the upstream OAuth token endpoint.
//!
//! Accounts are onboarded out of band (an admin supplies a refresh token
//! directly — the authorization-code exchange itself is out of scope here);
//! this module only ever performs `grant_type=refresh_token`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Response from the token endpoint. `expires_in` is a delta in seconds
/// from the response time; callers convert it to an absolute millisecond
/// timestamp before persisting.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

/// Refresh an access token using a stored refresh token (C3 `refresh`).
pub async fn refresh_token(
    client: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    refresh: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(token_endpoint)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", client_id),
        ])
        .send()
        .await
        .map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                Error::Transient(format!("token refresh request failed: {e}"))
            } else {
                Error::Upstream(format!("token refresh request failed: {e}"))
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidGrant(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }
        if status.is_server_error() {
            return Err(Error::Transient(format!(
                "token endpoint returned {status}: {body}"
            )));
        }
        return Err(Error::Upstream(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::Upstream(format!("invalid token response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_deserializes_without_refresh_token() {
        let json = r#"{"access_token":"at_abc","expires_in":3600}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "at_abc");
        assert_eq!(token.expires_in, 3600);
        assert!(token.refresh_token.is_none());
    }

    #[test]
    fn token_response_deserializes_with_rotated_refresh_token() {
        let json = r#"{"access_token":"at_abc","refresh_token":"rt_new","expires_in":3600}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.refresh_token.as_deref(), Some("rt_new"));
    }
}
