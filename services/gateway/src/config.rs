//! Configuration types and loading.
//!
//! One TOML file, read once at startup. Every field has a sane default so a
//! deployment can start from an almost-empty file and override only what it
//! needs (§6's configuration table).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Upstream endpoint for the code-assist generate-content call. Lives on the
/// same host as the token manager's discovery endpoint.
pub const DEFAULT_UPSTREAM_ENDPOINT: &str =
    "https://cloudcode-pa.googleapis.com/v1internal:generateContent";

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub admin_listen_addr: SocketAddr,
    pub store_path: PathBuf,
    pub request_log_retention: usize,
    pub model_log_capacity: usize,
    pub log_level: String,

    pub upstream_endpoint: String,
    pub capacity_retries: u32,
    pub capacity_retry_delay_ms: u64,
    pub fetch_connect_timeout_ms: u64,
    pub outbound_proxy_url: Option<String>,
    pub token_refresh_skew_ms: i64,

    #[serde(default)]
    pub model_concurrency: HashMap<String, usize>,
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,
    #[serde(default)]
    pub preferred_tiers: HashMap<String, Vec<String>>,

    pub default_model_concurrency: usize,
    pub error_threshold: u32,
    pub account_wait_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".parse().unwrap(),
            admin_listen_addr: "127.0.0.1:9090".parse().unwrap(),
            store_path: PathBuf::from("data/store.json"),
            request_log_retention: 10_000,
            model_log_capacity: 500,
            log_level: "info".to_string(),
            upstream_endpoint: DEFAULT_UPSTREAM_ENDPOINT.to_string(),
            capacity_retries: 2,
            capacity_retry_delay_ms: 1000,
            fetch_connect_timeout_ms: 30_000,
            outbound_proxy_url: None,
            token_refresh_skew_ms: 60_000,
            model_concurrency: HashMap::new(),
            model_aliases: HashMap::new(),
            preferred_tiers: HashMap::new(),
            default_model_concurrency: 16,
            error_threshold: 5,
            account_wait_ms: 30_000,
        }
    }
}

impl Config {
    /// Default config file location, overridable with `--config <path>`.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        std::env::var("GATEWAY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("gateway.toml"))
    }

    /// Load configuration from a TOML file, falling back to all-defaults
    /// when the file doesn't exist — a fresh deployment can start with
    /// nothing but an admin-supplied refresh token.
    pub fn load(path: &Path) -> common::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/gateway.toml")).unwrap();
        assert_eq!(config.capacity_retries, 2);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "log_level = \"debug\"\ncapacity_retries = 5\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.capacity_retries, 5);
        assert_eq!(config.account_wait_ms, 30_000);
    }

    #[test]
    fn resolve_path_prefers_cli_flag() {
        let path = Config::resolve_path(Some("custom.toml"));
        assert_eq!(path, PathBuf::from("custom.toml"));
    }
}
