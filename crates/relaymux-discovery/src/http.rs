//! HTTP client for a remote messaging-discovery service

use crate::{DiscoveryClient, DiscoveryError, DiscoveryResult, Entry};
use async_trait::async_trait;
use relaymux_proto::PublicKey;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, trace};

/// Path prefix served by the discovery service
pub const API_PREFIX: &str = "/messaging-discovery";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Discovery client talking JSON over HTTP
#[derive(Debug, Clone)]
pub struct HttpDiscovery {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDiscovery {
    /// Create a client for the service at `base_url` (e.g. `http://127.0.0.1:9090`)
    pub fn new(base_url: impl Into<String>) -> DiscoveryResult<Self> {
        Self::with_timeout(base_url, Duration::from_secs(10))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> DiscoveryResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    async fn post_entry(&self, entry: &Entry) -> DiscoveryResult<()> {
        let url = self.url("/entry/");
        trace!("POST {} (sequence {})", url, entry.sequence);

        let response = self
            .client
            .post(&url)
            .json(entry)
            .send()
            .await
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;

        if response.status().is_success() {
            return Ok(());
        }
        Err(error_from_response(response, &entry.static_pk).await)
    }
}

async fn error_from_response(response: reqwest::Response, pk: &PublicKey) -> DiscoveryError {
    let status = response.status().as_u16();
    if status == 404 {
        return DiscoveryError::NotFound(*pk);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or(body);
    DiscoveryError::Http { status, message }
}

#[async_trait]
impl DiscoveryClient for HttpDiscovery {
    async fn entry(&self, pk: &PublicKey) -> DiscoveryResult<Entry> {
        let url = self.url(&format!("/entry/{}", pk));
        trace!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response, pk).await);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn create_entry(&self, entry: &Entry) -> DiscoveryResult<()> {
        debug!("Publishing new entry for {}", entry.static_pk.short());
        self.post_entry(entry).await
    }

    async fn update_entry(&self, entry: &Entry) -> DiscoveryResult<()> {
        debug!(
            "Publishing entry update for {} (sequence {})",
            entry.static_pk.short(),
            entry.sequence
        );
        self.post_entry(entry).await
    }

    async fn available_servers(&self) -> DiscoveryResult<Vec<Entry>> {
        let url = self.url("/available_servers");
        trace!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(DiscoveryError::Http { status, message });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;
        Ok(serde_json::from_slice(&body)?)
    }
}
