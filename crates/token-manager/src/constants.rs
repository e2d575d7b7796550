//! OAuth client configuration for refreshing access to the upstream
//! code-assist API. These values identify the public client application and
//! the upstream's token/discovery endpoints; they are not secrets — the
//! secret is the per-account refresh token held in the store.

/// Public OAuth client id used when refreshing a user-supplied refresh
/// token. Deployments that front a different upstream override this via
/// config; this is the default for the reference upstream.
pub const DEFAULT_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";

/// Token endpoint used for refresh-token grants.
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Endpoint for the "load/onboard user" discovery sequence that returns a
/// project id and quota tier for a freshly authorized account.
pub const DEFAULT_DISCOVERY_ENDPOINT: &str =
    "https://cloudcode-pa.googleapis.com/v1internal:loadCodeAssist";

/// Discovery response marker indicating the upstream project is already
/// bound to a different local account.
pub const DUPLICATE_ACCOUNT_MARKER: &str = "already associated with another account";
