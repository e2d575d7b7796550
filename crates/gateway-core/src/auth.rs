//! Caller authentication: hash an `Authorization: Bearer <api-key>` value
//! and look it up against the Store's `api_keys` table.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use store::{ApiKey, Store};

/// `SHA256(key)`, base64url-encoded — the same digest scheme the teacher
/// uses for PKCE challenges, applied here to avoid storing plaintext keys.
pub fn hash_api_key(key: &str) -> String {
    let hash = Sha256::digest(key.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing or malformed Authorization header")]
    MissingCredential,
    #[error("unknown or disabled API key")]
    InvalidCredential,
}

/// Resolves a caller-presented bearer value into its Store row. Never
/// exposes the key hash or plaintext to the caller beyond its own id.
pub async fn authenticate(store: &Store, presented_key: &str) -> Result<ApiKey, AuthError> {
    if presented_key.is_empty() {
        return Err(AuthError::MissingCredential);
    }
    let hash = hash_api_key(presented_key);
    store.get_api_key(&hash).await.ok_or(AuthError::InvalidCredential)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_key_dependent() {
        let a = hash_api_key("key-one");
        let b = hash_api_key("key-one");
        let c = hash_api_key("key-two");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn authenticate_rejects_empty_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().join("store.json"), 10).await.unwrap();
        let err = authenticate(&store, "").await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCredential));
    }

    #[tokio::test]
    async fn authenticate_rejects_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().join("store.json"), 10).await.unwrap();
        let err = authenticate(&store, "nope").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential));
    }

    #[tokio::test]
    async fn authenticate_accepts_known_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().join("store.json"), 10).await.unwrap();
        let hash = hash_api_key("secret-key");
        store
            .put_api_key(ApiKey {
                id: "key-1".into(),
                key_hash: hash,
                label: None,
                created_at: 0,
                disabled: false,
            })
            .await
            .unwrap();

        let key = authenticate(&store, "secret-key").await.unwrap();
        assert_eq!(key.id, "key-1");
    }

    #[tokio::test]
    async fn authenticate_rejects_disabled_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().join("store.json"), 10).await.unwrap();
        let hash = hash_api_key("secret-key");
        store
            .put_api_key(ApiKey {
                id: "key-1".into(),
                key_hash: hash,
                label: None,
                created_at: 0,
                disabled: true,
            })
            .await
            .unwrap();

        let err = authenticate(&store, "secret-key").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential));
    }
}
