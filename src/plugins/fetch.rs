//! Byte fetching for registry manifests and plugin artifacts.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{DevstrapError, Result};
use crate::security::validate_registry_url;

/// Default cap on a single download.
pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 256 * 1024 * 1024;

const MAX_REDIRECTS: usize = 5;

/// Source of raw bytes for a URL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;
}

/// `ArtifactFetcher` over HTTP(S).
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl HttpFetcher {
    /// Build a fetcher. Every redirect hop is validated like the original
    /// URL; private and local hosts are refused unless `allow_private`.
    pub fn new(timeout: Duration, max_bytes: u64, allow_private: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(15))
            .redirect(redirect_policy(allow_private))
            .user_agent(concat!("devstrap/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DevstrapError::Setup(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, max_bytes })
    }

    /// Public hosts only, default size cap.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        Self::new(timeout, DEFAULT_MAX_DOWNLOAD_BYTES, false)
    }
}

fn redirect_policy(allow_private: bool) -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error(format!("more than {} redirects", MAX_REDIRECTS));
        }
        match validate_registry_url(attempt.url().as_str(), allow_private) {
            Ok(_) => attempt.follow(),
            Err(e) => {
                warn!(url = %attempt.url(), error = %e, "Refusing redirect");
                attempt.error(e)
            }
        }
    })
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url = %url, "Fetching");

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DevstrapError::Network(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DevstrapError::Network(format!(
                "GET {} returned HTTP {}",
                url, status
            )));
        }

        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(DevstrapError::Network(format!(
                    "{} is {} bytes, over the {} byte limit",
                    url, len, self.max_bytes
                )));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| DevstrapError::Network(format!("Reading {} failed: {}", url, e)))?
        {
            if body.len() as u64 + chunk.len() as u64 > self.max_bytes {
                return Err(DevstrapError::Network(format!(
                    "{} exceeded the {} byte limit",
                    url, self.max_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        debug!(url = %url, bytes = body.len(), "Fetched");
        Ok(body)
    }
}
