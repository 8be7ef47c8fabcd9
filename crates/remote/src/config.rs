//! Connection settings for the remote store.

use std::time::Duration;

use crate::error::{RemoteError, Result};

pub const ENV_REMOTE_URL: &str = "LEDGERLY_REMOTE_URL";
pub const ENV_REMOTE_API_KEY: &str = "LEDGERLY_REMOTE_API_KEY";
pub const ENV_REMOTE_ACCESS_TOKEN: &str = "LEDGERLY_REMOTE_ACCESS_TOKEN";

/// Default timeout for API requests.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// REST root, e.g. `https://project.example.co/rest/v1`.
    pub base_url: String,
    pub api_key: String,
    /// Signed-in user's token. Requests fall back to the api key when absent.
    pub access_token: Option<String>,
    pub timeout: Duration,
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
}

impl RemoteConfig {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
            access_token: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the config from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base_url = clean(lookup(ENV_REMOTE_URL)).ok_or_else(|| {
            RemoteError::invalid_request(format!(
                "{} not configured. Remote sync is disabled.",
                ENV_REMOTE_URL
            ))
        })?;
        let api_key = clean(lookup(ENV_REMOTE_API_KEY))
            .ok_or_else(|| RemoteError::auth(format!("{} not configured", ENV_REMOTE_API_KEY)))?;

        let mut config = Self::new(&base_url, &api_key);
        config.access_token = clean(lookup(ENV_REMOTE_ACCESS_TOKEN));
        Ok(config)
    }

    /// Token sent as the bearer credential.
    pub fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.api_key)
    }
}
