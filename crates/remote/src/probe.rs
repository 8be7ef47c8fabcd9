//! Reachability probe against the REST root.

use async_trait::async_trait;
use log::debug;
use reqwest::header::HeaderValue;
use std::time::Duration;

use ledgerly_core::sync::ReachabilityProbe;

use crate::config::RemoteConfig;
use crate::error::Result;

const PROBE_TIMEOUT_SECS: u64 = 5;

/// Reports the backend reachable when it answers at all, short of a gateway
/// failure.
#[derive(Debug, Clone)]
pub struct HttpReachabilityProbe {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl HttpReachabilityProbe {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/", config.base_url),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl ReachabilityProbe for HttpReachabilityProbe {
    async fn is_reachable(&self) -> bool {
        let mut request = self.client.get(&self.url);
        if let Ok(value) = HeaderValue::from_str(&self.api_key) {
            request = request.header("apikey", value);
        }
        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                debug!("[Connectivity] Probe answered {}", status);
                !matches!(status, 502..=504)
            }
            Err(err) => {
                debug!("[Connectivity] Probe failed: {}", err);
                false
            }
        }
    }
}
